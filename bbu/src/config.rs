//! YAML Configuration for the Baseband Unit
//!
//! File-level structures deserialized with serde, converted once at
//! startup into the immutable `baseband::Config`.

use baseband::ldpc::LdpcParams;
use baseband::message::EventType;
use baseband::Config;
use common::types::Modulation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BbuConfig {
    /// Antenna array and stream dimensions
    pub cell: CellSection,
    /// OFDM numerology
    pub ofdm: OfdmSection,
    /// Frame schedule and ring window
    pub frame: FrameSection,
    /// Buffer blocking parameters
    #[serde(default)]
    pub blocks: BlockSection,
    /// Modulation and demodulation mode
    #[serde(default)]
    pub modulation: ModulationSection,
    /// Uplink codec parameters
    pub ldpc: LdpcSection,
    /// Worker pool and queue sizing
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Built-in traffic generator
    #[serde(default)]
    pub sim: SimSection,
    /// Logging configuration
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellSection {
    /// Base-station antennas
    pub bs_antennas: usize,
    /// UE antennas
    pub ue_antennas: usize,
    /// Decoded spatial streams
    pub spatial_streams: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OfdmSection {
    /// FFT size
    pub fft_size: usize,
    /// Occupied data subcarriers
    pub data_subcarriers: usize,
    /// First data subcarrier (defaults to a centered band)
    pub data_start: Option<usize>,
    /// Received samples to skip before the FFT window
    #[serde(default = "default_zero_prefix")]
    pub rx_zero_prefix: usize,
    /// 12-bit packed IQ payloads instead of 16-bit native
    #[serde(default)]
    pub twelve_bit_iq: bool,
}

fn default_zero_prefix() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameSection {
    /// Ring depth, power of two
    #[serde(default = "default_frame_window")]
    pub window: usize,
    /// UE pilot symbols at the head of the uplink portion
    pub ul_pilot_symbols: usize,
    /// Uplink data symbols
    pub ul_data_symbols: usize,
    /// Soft per-frame deadline in microseconds
    pub deadline_us: Option<u64>,
}

fn default_frame_window() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockSection {
    /// Subcarriers per partial-transpose block
    #[serde(default = "default_transpose_block")]
    pub transpose: usize,
    /// Subcarriers per cacheline gather
    #[serde(default = "default_cacheline")]
    pub cacheline: usize,
    /// Subcarriers per equalize work item
    #[serde(default = "default_demul_block")]
    pub demul: usize,
    /// Beam matrices per frame
    pub beam_blocks: Option<usize>,
}

fn default_transpose_block() -> usize {
    16
}

fn default_cacheline() -> usize {
    8
}

fn default_demul_block() -> usize {
    48
}

impl Default for BlockSection {
    fn default() -> Self {
        Self {
            transpose: default_transpose_block(),
            cacheline: default_cacheline(),
            demul: default_demul_block(),
            beam_blocks: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModulationSection {
    /// Bits per modulated subcarrier (2, 4 or 6)
    #[serde(default = "default_order_bits")]
    pub order_bits: u8,
    /// Hard demodulation instead of soft LLRs
    #[serde(default = "default_true")]
    pub hard_demod: bool,
    /// Keep equalized samples for constellation export
    #[serde(default)]
    pub export_constellation: bool,
}

fn default_order_bits() -> u8 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for ModulationSection {
    fn default() -> Self {
        Self {
            order_bits: default_order_bits(),
            hard_demod: true,
            export_constellation: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LdpcSection {
    /// Base graph (1 or 2)
    pub base_graph: u8,
    /// Lifting size Zc
    pub lifting: usize,
    /// Parity rows kept (defaults to the base graph's full extent)
    pub rows: Option<usize>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_true")]
    pub early_termination: bool,
}

fn default_max_iterations() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ingress_threads")]
    pub ingress_threads: usize,
    #[serde(default = "default_rx_slots")]
    pub rx_slots: usize,
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_ingress_threads() -> usize {
    1
}

fn default_rx_slots() -> usize {
    256
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            ingress_threads: default_ingress_threads(),
            rx_slots: default_rx_slots(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimSection {
    /// Frames to run
    #[serde(default = "default_sim_frames")]
    pub frames: u32,
    /// Generator seed
    #[serde(default)]
    pub seed: u64,
    /// Channel profile: "identity" or "unitary"
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_sim_frames() -> u32 {
    100
}

fn default_channel() -> String {
    "unitary".to_string()
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            frames: default_sim_frames(),
            seed: 0,
            channel: default_channel(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSection {
    /// Log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BbuConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BbuConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Convert into the immutable pipeline configuration
    pub fn to_baseband(&self) -> anyhow::Result<Config> {
        let modulation = Modulation::from_order_bits(self.modulation.order_bits)
            .ok_or(baseband::PhyError::UnsupportedModulation(self.modulation.order_bits))?;

        let mut ldpc = LdpcParams::new(self.ldpc.base_graph, self.ldpc.lifting);
        if let Some(rows) = self.ldpc.rows {
            ldpc.rows = rows;
        }
        ldpc.max_iterations = self.ldpc.max_iterations;
        ldpc.early_termination = self.ldpc.early_termination;

        let data_start = self
            .ofdm
            .data_start
            .unwrap_or((self.ofdm.fft_size.saturating_sub(self.ofdm.data_subcarriers)) / 2);
        let beam_blocks = self.blocks.beam_blocks.unwrap_or(self.ofdm.data_subcarriers);

        let cfg = Config {
            ofdm_ca_num: self.ofdm.fft_size,
            ofdm_data_num: self.ofdm.data_subcarriers,
            ofdm_data_start: data_start,
            bs_ant_num: self.cell.bs_antennas,
            ue_ant_num: self.cell.ue_antennas,
            spatial_streams: self.cell.spatial_streams,
            frame_wnd: self.frame.window,
            transpose_block_size: self.blocks.transpose,
            sc_per_cacheline: self.blocks.cacheline,
            demul_block_size: self.blocks.demul,
            beam_block_num: beam_blocks,
            ul_pilot_symbols: self.frame.ul_pilot_symbols,
            ul_data_symbols: self.frame.ul_data_symbols,
            cal_dl_symbol: None,
            cal_ul_symbol: None,
            modulation,
            hard_demod: self.modulation.hard_demod,
            export_constellation: self.modulation.export_constellation,
            samps_per_symbol: self.ofdm.rx_zero_prefix + self.ofdm.fft_size,
            rx_zero_prefix: self.ofdm.rx_zero_prefix,
            rx_zero_prefix_cal_dl: self.ofdm.rx_zero_prefix,
            rx_zero_prefix_cal_ul: self.ofdm.rx_zero_prefix,
            twelve_bit_iq: self.ofdm.twelve_bit_iq,
            worker_threads: self.runtime.workers,
            stage_priority: [
                EventType::Fft,
                EventType::Beam,
                EventType::Equalize,
                EventType::Decode,
            ],
            queue_capacity: self.runtime.queue_capacity,
            ingress_threads: self.runtime.ingress_threads,
            rx_slots_per_thread: self.runtime.rx_slots,
            frame_deadline: self.frame.deadline_us.map(Duration::from_micros),
            ldpc,
            pilot_sign: Config::generate_pilot_sign(
                self.sim.seed ^ 0x70AD,
                self.ofdm.data_subcarriers,
            ),
            ue_pilots: Config::generate_ue_pilots(
                self.sim.seed ^ 0x9E1C,
                self.cell.ue_antennas,
                self.ofdm.data_subcarriers,
            ),
            ground_truth: None,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
cell:
  bs_antennas: 8
  ue_antennas: 2
  spatial_streams: 2
ofdm:
  fft_size: 512
  data_subcarriers: 480
frame:
  ul_pilot_symbols: 2
  ul_data_symbols: 4
ldpc:
  base_graph: 1
  lifting: 72
"#;

    #[test]
    fn test_parse_minimal_yaml() {
        let cfg: BbuConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.cell.bs_antennas, 8);
        assert_eq!(cfg.frame.window, 8); // default
        assert_eq!(cfg.blocks.transpose, 16); // default
        assert_eq!(cfg.runtime.workers, 4); // default
    }

    #[test]
    fn test_conversion_produces_valid_config() {
        let cfg: BbuConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let baseband = cfg.to_baseband().unwrap();
        assert_eq!(baseband.ofdm_data_start, 16); // centered band
        assert_eq!(baseband.beam_block_num, 480); // per-subcarrier default
        assert!(baseband.validate().is_ok());
    }

    #[test]
    fn test_bad_modulation_order_rejected() {
        let mut cfg: BbuConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        cfg.modulation.order_bits = 5;
        assert!(cfg.to_baseband().is_err());
    }
}
