//! Pipeline Construction and Host Interface
//!
//! Wires the buffers, queues, coordinator and worker pool together. The
//! host feeds raw packets through [`UplinkPipeline::ingest`]; admission is
//! refused with a back-pressure error while the target ring slot is still
//! owned by an un-retired frame. Retirement notifications stream out over
//! a channel, and decoded payloads are read out per
//! `(frame, data symbol, stream)` between retirement and slot reuse.

use crate::beam::BeamStage;
use crate::buffers::{
    BeamMatrixBuffer, CsiBuffer, DataBuffer, DecodedBuffer, DemodBuffer, EqualBuffer, PhaseBuffer,
};
use crate::config::Config;
use crate::decode::DecodeStage;
use crate::equalize::EqualizeStage;
use crate::fft::FftStage;
use crate::ldpc::UplinkCodec;
use crate::linalg::combine_kernel;
use crate::message::{enqueue_with_backoff, EventData, EventType, Tag, TaskQueues};
use crate::rx::{PacketHeader, RxSocketBuffer};
use crate::scheduler::{Coordinator, RetiredFrame};
use crate::stats::PhyStats;
use crate::worker::Worker;
use crate::PhyError;
use common::types::FrameId;
use crossbeam::channel::Receiver;
use num_complex::Complex32;
use rustfft::FftPlanner;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

pub struct UplinkPipeline {
    cfg: Arc<Config>,
    queues: Arc<TaskQueues>,
    rx: Arc<RxSocketBuffer>,
    decoded: Arc<DecodedBuffer>,
    equal_export: Option<Arc<EqualBuffer>>,
    stats: Arc<PhyStats>,
    retired_rx: Receiver<RetiredFrame>,
    watermark: Arc<AtomicU64>,
    run: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
}

impl UplinkPipeline {
    /// Validate the configuration, build every shared buffer and kernel,
    /// and spawn the coordinator plus worker threads.
    pub fn start(cfg: Config, codec: Arc<dyn UplinkCodec>) -> Result<Self, PhyError> {
        cfg.validate()?;
        let combine = combine_kernel(cfg.spatial_streams)
            .ok_or(PhyError::UnsupportedStreamCount(cfg.spatial_streams))?;
        let cfg = Arc::new(cfg);

        let fft_plan = FftPlanner::<f32>::new().plan_fft_forward(cfg.ofdm_ca_num);
        let rx = Arc::new(RxSocketBuffer::new(
            cfg.ingress_threads,
            cfg.rx_slots_per_thread,
            cfg.packet_len(),
        ));
        let data = Arc::new(DataBuffer::new(&cfg));
        let csi = Arc::new(CsiBuffer::new(&cfg));
        let beams = Arc::new(BeamMatrixBuffer::new(&cfg));
        let phase = Arc::new(PhaseBuffer::new(&cfg));
        let demod = Arc::new(DemodBuffer::new(&cfg));
        let decoded = Arc::new(DecodedBuffer::new(&cfg));
        let equal_export = cfg
            .export_constellation
            .then(|| Arc::new(EqualBuffer::new(&cfg)));
        let stats = Arc::new(PhyStats::new(&cfg));
        let queues = TaskQueues::new(cfg.queue_capacity);

        let run = Arc::new(AtomicBool::new(true));
        let watermark = Arc::new(AtomicU64::new(0));
        let (retired_tx, retired_rx) = crossbeam::channel::unbounded();

        let mut coordinator = Coordinator::new(
            Arc::clone(&cfg),
            Arc::clone(&queues),
            Arc::clone(&rx),
            Arc::clone(&stats),
            retired_tx,
            Arc::clone(&watermark),
            Arc::clone(&run),
        );
        let coordinator = std::thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || coordinator.run())
            .map_err(|e| PhyError::InvalidConfiguration(format!("spawn failed: {e}")))?;

        let mut workers = Vec::with_capacity(cfg.worker_threads);
        for id in 0..cfg.worker_threads {
            let worker = Worker::new(
                id,
                Arc::clone(&queues),
                Arc::clone(&run),
                cfg.stage_priority,
                FftStage::new(
                    Arc::clone(&cfg),
                    Arc::clone(&fft_plan),
                    Arc::clone(&rx),
                    Arc::clone(&data),
                    Arc::clone(&csi),
                    Arc::clone(&stats),
                ),
                BeamStage::new(
                    Arc::clone(&cfg),
                    Arc::clone(&csi),
                    Arc::clone(&beams),
                    Arc::clone(&stats),
                ),
                EqualizeStage::new(
                    Arc::clone(&cfg),
                    Arc::clone(&data),
                    Arc::clone(&beams),
                    equal_export.clone(),
                    Arc::clone(&phase),
                    Arc::clone(&demod),
                    Arc::clone(&stats),
                    combine,
                ),
                DecodeStage::new(
                    Arc::clone(&cfg),
                    Arc::clone(&demod),
                    Arc::clone(&decoded),
                    Arc::clone(&codec),
                    Arc::clone(&stats),
                ),
            );
            let handle = std::thread::Builder::new()
                .name(format!("phy-worker-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| PhyError::InvalidConfiguration(format!("spawn failed: {e}")))?;
            workers.push(handle);
        }

        info!(
            "uplink pipeline up: {} workers, window {}, {}x{} antennas, {} streams",
            cfg.worker_threads, cfg.frame_wnd, cfg.bs_ant_num, cfg.ue_ant_num, cfg.spatial_streams
        );

        Ok(Self {
            cfg,
            queues,
            rx,
            decoded,
            equal_export,
            stats,
            retired_rx,
            watermark,
            run,
            workers,
            coordinator: Some(coordinator),
        })
    }

    /// Feed one raw packet on ingress thread 0
    pub fn ingest(&self, packet: &[u8]) -> Result<(), PhyError> {
        self.ingest_on(0, packet)
    }

    /// Feed one raw packet. Fails with `Backpressure` while the frame's
    /// ring slot is not retired or the socket buffer is full; the caller
    /// retries with its own pacing.
    pub fn ingest_on(&self, thread: usize, packet: &[u8]) -> Result<(), PhyError> {
        if !self.run.load(Ordering::Acquire) {
            return Err(PhyError::ShutDown);
        }
        if packet.len() != self.cfg.packet_len() {
            return Err(PhyError::MalformedPacket(format!(
                "{} bytes, expected {}",
                packet.len(),
                self.cfg.packet_len()
            )));
        }
        let header = PacketHeader::parse(packet)?;

        let wm = self.watermark.load(Ordering::Acquire);
        let frame = header.frame.0 as u64;
        if frame >= wm + self.cfg.frame_wnd as u64 {
            return Err(PhyError::Backpressure {
                frame: header.frame.0,
            });
        }
        if frame < wm {
            return Err(PhyError::Schedule {
                frame: header.frame.0,
                symbol: header.symbol.0,
                detail: "packet for an already retired frame".into(),
            });
        }

        let slot = self.rx.try_claim(thread).ok_or(PhyError::Backpressure {
            frame: header.frame.0,
        })?;
        // SAFETY: the slot was just claimed and is not yet published.
        unsafe { self.rx.packet_mut(thread, slot)[..packet.len()].copy_from_slice(packet) };

        let ev = EventData::new(EventType::RxPacket, Tag::rx(thread as u16, slot as u16));
        if let Err(e) = enqueue_with_backoff(&self.queues.completion, ev, "rx message queue") {
            self.rx.release(thread, slot);
            return Err(e);
        }
        Ok(())
    }

    /// Retirement notification stream
    pub fn retired(&self) -> &Receiver<RetiredFrame> {
        &self.retired_rx
    }

    /// Copy out the decoded payload of `(frame, data symbol, stream)`.
    /// Valid between the frame's retirement notification and the reuse of
    /// its ring slot.
    pub fn decoded_bytes(&self, frame: FrameId, data_sym: usize, stream: usize) -> Vec<u8> {
        let slab = self
            .decoded
            .slab(frame.slot(self.cfg.frame_wnd), data_sym, stream);
        // SAFETY: decode writers finished before the retirement event the
        // caller observed.
        unsafe { slab.slice(0, slab.len()) }.to_vec()
    }

    /// Copy out the equalized constellation of an uplink symbol, when
    /// export is enabled. Same validity window as [`decoded_bytes`].
    pub fn equalized(&self, frame: FrameId, ul_sym: usize) -> Option<Vec<Complex32>> {
        self.equal_export.as_ref().map(|buf| {
            let slab = buf.slab(frame.slot(self.cfg.frame_wnd), ul_sym);
            // SAFETY: equalize writers finished before retirement.
            unsafe { slab.slice(0, slab.len()) }.to_vec()
        })
    }

    pub fn stats(&self) -> &PhyStats {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
    }

    /// Stop the worker pool and coordinator, then report the run summary
    pub fn shutdown(mut self) -> String {
        self.stop();
        self.stats.summary()
    }
}

impl Drop for UplinkPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
