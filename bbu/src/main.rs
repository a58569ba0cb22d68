//! Baseband Unit Host Process
//!
//! Loads the YAML configuration, brings up the uplink pipeline, and drives
//! it with the built-in traffic generator, checking decoded payloads
//! against what was sent.

use anyhow::Result;
use clap::Parser;
use common::types::FrameId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use baseband::{PhyError, SystematicLdpc, UplinkPipeline};

mod config;
mod sim;

use config::BbuConfig;
use sim::{ChannelProfile, UplinkSimulator};

/// Software massive-MIMO baseband unit (uplink)
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the number of simulated frames
    #[arg(short, long)]
    frames: Option<u32>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let file_cfg = BbuConfig::from_yaml_file(&args.config)?;

    let log_level = args.log_level.as_ref().unwrap_or(&file_cfg.log.level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("loading configuration from {}", args.config);
    let mut cfg = file_cfg.to_baseband()?;

    let profile = ChannelProfile::parse(&file_cfg.sim.channel)?;
    let simulator = UplinkSimulator::new(&cfg, profile, file_cfg.sim.seed);
    cfg.ground_truth = Some(Arc::new(simulator.ground_truth(&cfg)));

    info!(
        "cell: {}x{} antennas, {} streams, {} data subcarriers over {}-point FFT",
        cfg.bs_ant_num, cfg.ue_ant_num, cfg.spatial_streams, cfg.ofdm_data_num, cfg.ofdm_ca_num
    );

    let num_frames = args.frames.unwrap_or(file_cfg.sim.frames);
    let pipeline = UplinkPipeline::start(cfg, Arc::new(SystematicLdpc))?;

    let start = Instant::now();
    let mut retired = 0u32;
    let mut payload_mismatches = 0u64;

    for frame in 0..num_frames {
        let packets = simulator.frame_packets(pipeline.config(), FrameId(frame));
        for pkt in &packets {
            loop {
                match pipeline.ingest(pkt) {
                    Ok(()) => break,
                    Err(PhyError::Backpressure { .. }) => {
                        std::thread::sleep(Duration::from_micros(100));
                    }
                    Err(e) => {
                        error!("ingest failed: {e}");
                        return Err(e.into());
                    }
                }
            }
        }

        // Drain retirements without blocking the feed
        while let Ok(done) = pipeline.retired().try_recv() {
            retired += 1;
            payload_mismatches += check_frame(&pipeline, simulator.payloads(), done.frame);
        }
    }

    // Wait out the tail of the window
    while retired < num_frames {
        match pipeline.retired().recv_timeout(Duration::from_secs(10)) {
            Ok(done) => {
                retired += 1;
                payload_mismatches += check_frame(&pipeline, simulator.payloads(), done.frame);
            }
            Err(_) => {
                warn!("timed out waiting for {} frames", num_frames - retired);
                break;
            }
        }
    }

    let elapsed = start.elapsed();
    info!(
        "{} frames in {:.2?} ({:.1} frames/s), {} payload mismatches",
        retired,
        elapsed,
        retired as f64 / elapsed.as_secs_f64(),
        payload_mismatches
    );

    let summary = pipeline.shutdown();
    print!("{summary}");
    Ok(())
}

/// Compare every decoded block of a retired frame against the generator
fn check_frame(pipeline: &UplinkPipeline, payloads: &[Vec<u8>], frame: FrameId) -> u64 {
    let cfg = pipeline.config();
    let mut mismatches = 0;
    for data_sym in 0..cfg.ul_data_symbols {
        for (stream, payload) in payloads.iter().enumerate() {
            if &pipeline.decoded_bytes(frame, data_sym, stream) != payload {
                mismatches += 1;
            }
        }
    }
    if mismatches > 0 {
        warn!("frame {}: {} mismatched blocks", frame.0, mismatches);
    }
    mismatches
}
