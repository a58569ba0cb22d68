//! Run Configuration for the Uplink Baseband
//!
//! `Config` is built once at startup, validated, and passed by shared
//! reference to every stage. It carries the OFDM dimensions, the frame
//! symbol schedule, the blocking parameters that shape the transposed
//! buffer layouts, the reference pilot sequences, and the knobs of the
//! scheduler and worker pool. Nothing in here mutates after construction.

use crate::ldpc::LdpcParams;
use crate::message::EventType;
use crate::PhyError;
use common::types::{Modulation, SymbolId, UeId};
use num_complex::Complex32;
use std::sync::Arc;
use std::time::Duration;

/// Classification of one OFDM symbol within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    /// Channel-sounding pilot for one UE antenna (feeds CSI estimation)
    Pilot,
    /// Uplink symbol (UE pilot or data, distinguished by uplink index)
    UplinkData,
    /// Downlink calibration symbol (recognized, not processed)
    CalDl,
    /// Uplink calibration symbol (recognized, not processed)
    CalUl,
}

/// Ground-truth transmit content, used for EVM and error accounting when
/// the host knows what was sent (simulation and bench runs).
#[derive(Debug, Clone)]
pub struct GroundTruth {
    /// Modulated symbol indices, `[D_ul][S][N_d]`
    pub mod_symbols: Vec<u8>,
    /// Information payload handed to the encoder, `[D_ul][S][info_bytes]`
    pub payload: Vec<u8>,
    /// Reference equalized constellation for EVM, `[S][N_d]`
    pub evm_reference: Vec<Complex32>,
}

/// Immutable run configuration shared by all stages
#[derive(Debug, Clone)]
pub struct Config {
    /// Total OFDM subcarriers (FFT size)
    pub ofdm_ca_num: usize,
    /// Occupied data subcarriers
    pub ofdm_data_num: usize,
    /// First data subcarrier within the FFT output
    pub ofdm_data_start: usize,

    /// Base-station antennas
    pub bs_ant_num: usize,
    /// UE antennas (also the number of channel-sounding pilot symbols)
    pub ue_ant_num: usize,
    /// Spatial streams decoded per subcarrier (streams are UE antennas 0..S)
    pub spatial_streams: usize,

    /// Frame ring depth, power of two
    pub frame_wnd: usize,
    /// Subcarriers per partial-transpose block
    pub transpose_block_size: usize,
    /// Subcarriers per cacheline gather
    pub sc_per_cacheline: usize,
    /// Subcarriers per equalize work item
    pub demul_block_size: usize,
    /// Number of beam matrices per frame; each covers `N_d / beam_block_num`
    /// contiguous data subcarriers
    pub beam_block_num: usize,

    /// UE pilot symbols at the head of the uplink portion of the frame
    pub ul_pilot_symbols: usize,
    /// Uplink data symbols per frame
    pub ul_data_symbols: usize,
    /// Optional calibration symbols appended after the uplink symbols
    pub cal_dl_symbol: Option<u16>,
    pub cal_ul_symbol: Option<u16>,

    /// Uplink modulation
    pub modulation: Modulation,
    /// Hard (true) or soft (false) demodulation
    pub hard_demod: bool,
    /// Keep per-subcarrier equalized samples for constellation export
    pub export_constellation: bool,

    /// Samples per received symbol, including the zero prefix
    pub samps_per_symbol: usize,
    /// Samples to skip before the FFT window for regular symbols
    pub rx_zero_prefix: usize,
    /// Prefix lengths for calibration symbols
    pub rx_zero_prefix_cal_dl: usize,
    pub rx_zero_prefix_cal_ul: usize,
    /// IQ payload encoding: 12-bit packed (true) or 16-bit native (false)
    pub twelve_bit_iq: bool,

    /// Worker thread count
    pub worker_threads: usize,
    /// Stage polling order for the symmetric workers
    pub stage_priority: [EventType; 4],
    /// Capacity of each task queue
    pub queue_capacity: usize,
    /// Ingress threads feeding the socket buffer
    pub ingress_threads: usize,
    /// Packet slots per ingress thread
    pub rx_slots_per_thread: usize,
    /// Soft per-frame processing deadline
    pub frame_deadline: Option<Duration>,

    /// Uplink codec parameters
    pub ldpc: LdpcParams,

    /// Per-subcarrier reference pilot sign (±1), length `N_d`
    pub pilot_sign: Vec<f32>,
    /// Per-UE unit-magnitude reference pilots, `[U][N_d]`
    pub ue_pilots: Vec<Complex32>,

    /// Known transmit content for EVM/error accounting
    pub ground_truth: Option<Arc<GroundTruth>>,
}

impl Config {
    /// Deterministic ±1 pilot sign sequence
    pub fn generate_pilot_sign(seed: u64, len: usize) -> Vec<f32> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                if state & 1 == 0 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect()
    }

    /// Deterministic unit-magnitude QPSK reference pilots, `[num_ue][len]`
    pub fn generate_ue_pilots(seed: u64, num_ue: usize, len: usize) -> Vec<Complex32> {
        const SCALE: f32 = std::f32::consts::FRAC_1_SQRT_2;
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..num_ue * len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let re = if state & 1 == 0 { SCALE } else { -SCALE };
                let im = if state & 2 == 0 { SCALE } else { -SCALE };
                Complex32::new(re, im)
            })
            .collect()
    }

    /// Number of uplink symbols per frame (UE pilots + data)
    pub fn ul_symbol_num(&self) -> usize {
        self.ul_pilot_symbols + self.ul_data_symbols
    }

    /// Total symbols per frame, calibration included
    pub fn total_symbols(&self) -> usize {
        let cal = self.cal_dl_symbol.is_some() as usize + self.cal_ul_symbol.is_some() as usize;
        self.ue_ant_num + self.ul_symbol_num() + cal
    }

    /// Classify a symbol id according to the frame schedule
    pub fn symbol_type(&self, symbol: SymbolId) -> Result<SymbolType, PhyError> {
        let id = symbol.0 as usize;
        if Some(symbol.0) == self.cal_dl_symbol {
            return Ok(SymbolType::CalDl);
        }
        if Some(symbol.0) == self.cal_ul_symbol {
            return Ok(SymbolType::CalUl);
        }
        if id < self.ue_ant_num {
            Ok(SymbolType::Pilot)
        } else if id < self.ue_ant_num + self.ul_symbol_num() {
            Ok(SymbolType::UplinkData)
        } else {
            Err(PhyError::Schedule {
                frame: 0,
                symbol: symbol.0,
                detail: "unknown symbol type".into(),
            })
        }
    }

    /// UE index sounded by a channel pilot symbol
    pub fn pilot_symbol_idx(&self, symbol: SymbolId) -> Option<UeId> {
        let id = symbol.0 as usize;
        (id < self.ue_ant_num).then(|| UeId(symbol.0))
    }

    /// Index of an uplink symbol within the uplink portion of the frame
    pub fn ul_symbol_idx(&self, symbol: SymbolId) -> Option<usize> {
        let id = symbol.0 as usize;
        let base = self.ue_ant_num;
        (id >= base && id < base + self.ul_symbol_num()).then(|| id - base)
    }

    /// Symbol id of uplink symbol `idx`
    pub fn ul_symbol_id(&self, idx: usize) -> SymbolId {
        SymbolId((self.ue_ant_num + idx) as u16)
    }

    /// Data subcarriers covered by one beam matrix
    pub fn beam_group_size(&self) -> usize {
        self.ofdm_data_num / self.beam_block_num
    }

    /// Beam matrix owning a data subcarrier
    pub fn beam_sc_id(&self, sc: usize) -> usize {
        sc / self.beam_group_size()
    }

    /// Equalize work items per uplink symbol
    pub fn demul_block_num(&self) -> usize {
        (self.ofdm_data_num + self.demul_block_size - 1) / self.demul_block_size
    }

    /// Modulation order in bits
    pub fn mod_order_bits(&self) -> usize {
        self.modulation.bits_per_symbol()
    }

    /// Zero-prefix length for a given symbol class
    pub fn rx_prefix(&self, sym_type: SymbolType) -> usize {
        match sym_type {
            SymbolType::CalDl => self.rx_zero_prefix_cal_dl,
            SymbolType::CalUl => self.rx_zero_prefix_cal_ul,
            _ => self.rx_zero_prefix,
        }
    }

    /// IQ payload bytes per packet
    pub fn packet_payload_bytes(&self) -> usize {
        if self.twelve_bit_iq {
            self.samps_per_symbol * 3
        } else {
            self.samps_per_symbol * 4
        }
    }

    /// Total packet length including the header
    pub fn packet_len(&self) -> usize {
        crate::rx::HEADER_LEN + self.packet_payload_bytes()
    }

    /// Decoded bytes per (symbol, stream) code block
    pub fn decoded_bytes(&self) -> usize {
        self.ldpc.num_info_bits() / 8
    }

    /// Reference pilot of one UE across the data subcarriers
    pub fn ue_pilot(&self, ue: usize) -> &[Complex32] {
        let n = self.ofdm_data_num;
        &self.ue_pilots[ue * n..(ue + 1) * n]
    }

    /// Validate every size and divisibility invariant. Fatal at startup.
    pub fn validate(&self) -> Result<(), PhyError> {
        let fail = |msg: String| Err(PhyError::InvalidConfiguration(msg));

        if !self.frame_wnd.is_power_of_two() {
            return fail(format!("frame_wnd {} must be a power of two", self.frame_wnd));
        }
        if self.ofdm_data_start + self.ofdm_data_num > self.ofdm_ca_num {
            return fail(format!(
                "data band [{}, {}) exceeds FFT size {}",
                self.ofdm_data_start,
                self.ofdm_data_start + self.ofdm_data_num,
                self.ofdm_ca_num
            ));
        }
        if self.transpose_block_size == 0 || self.ofdm_data_num % self.transpose_block_size != 0 {
            return fail(format!(
                "transpose block {} must divide data subcarriers {}",
                self.transpose_block_size, self.ofdm_data_num
            ));
        }
        if self.sc_per_cacheline == 0 || self.transpose_block_size % self.sc_per_cacheline != 0 {
            return fail(format!(
                "cacheline {} must divide transpose block {}",
                self.sc_per_cacheline, self.transpose_block_size
            ));
        }
        if self.demul_block_size == 0 || self.demul_block_size % self.sc_per_cacheline != 0 {
            return fail(format!(
                "demul block {} must be a multiple of cacheline {}",
                self.demul_block_size, self.sc_per_cacheline
            ));
        }
        if self.ofdm_data_num % self.sc_per_cacheline != 0 {
            return fail(format!(
                "cacheline {} must divide data subcarriers {}",
                self.sc_per_cacheline, self.ofdm_data_num
            ));
        }
        if self.beam_block_num == 0 || self.ofdm_data_num % self.beam_block_num != 0 {
            return fail(format!(
                "beam blocks {} must divide data subcarriers {}",
                self.beam_block_num, self.ofdm_data_num
            ));
        }
        if self.spatial_streams == 0 || self.spatial_streams > self.ue_ant_num {
            return fail(format!(
                "spatial streams {} must be in 1..={}",
                self.spatial_streams, self.ue_ant_num
            ));
        }
        if self.ul_data_symbols == 0 {
            return fail("at least one uplink data symbol is required".into());
        }
        if self.samps_per_symbol < self.rx_zero_prefix + self.ofdm_ca_num {
            return fail(format!(
                "samps_per_symbol {} too short for prefix {} + FFT {}",
                self.samps_per_symbol, self.rx_zero_prefix, self.ofdm_ca_num
            ));
        }
        if self.worker_threads == 0 {
            return fail("at least one worker thread is required".into());
        }
        if self.ingress_threads == 0 || self.rx_slots_per_thread == 0 {
            return fail("ingress buffer must have at least one thread and slot".into());
        }
        let cw_bits = self.mod_order_bits() * self.ofdm_data_num;
        if cw_bits < self.ldpc.num_info_bits() {
            return fail(format!(
                "symbol carries {} bits, fewer than the {} information bits of one code block",
                cw_bits,
                self.ldpc.num_info_bits()
            ));
        }
        self.ldpc.validate()?;
        if self.pilot_sign.len() != self.ofdm_data_num {
            return fail("pilot sign table length mismatch".into());
        }
        if self.ue_pilots.len() != self.ue_ant_num * self.ofdm_data_num {
            return fail("UE pilot table length mismatch".into());
        }
        if let Some(gt) = &self.ground_truth {
            let s = self.spatial_streams;
            let d = self.ul_data_symbols;
            if gt.mod_symbols.len() != d * s * self.ofdm_data_num {
                return fail("ground-truth mod symbol table length mismatch".into());
            }
            if gt.payload.len() != d * s * self.decoded_bytes() {
                return fail("ground-truth payload length mismatch".into());
            }
            if gt.evm_reference.len() != s * self.ofdm_data_num {
                return fail("EVM reference length mismatch".into());
            }
        }
        Ok(())
    }
}

impl GroundTruth {
    /// Transmitted modulation symbol for `(data_sym, stream, sc)`
    pub fn mod_symbol(&self, n_d: usize, streams: usize, data_sym: usize, stream: usize, sc: usize) -> u8 {
        self.mod_symbols[(data_sym * streams + stream) * n_d + sc]
    }

    /// Payload block for `(data_sym, stream)`
    pub fn payload_block(&self, block_bytes: usize, streams: usize, data_sym: usize, stream: usize) -> &[u8] {
        let base = (data_sym * streams + stream) * block_bytes;
        &self.payload[base..base + block_bytes]
    }

    /// EVM reference sample for `(stream, sc)`
    pub fn reference(&self, n_d: usize, stream: usize, sc: usize) -> Complex32 {
        self.evm_reference[stream * n_d + sc]
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::ldpc::LdpcParams;
    use crate::message::EventType;
    use common::types::Modulation;

    /// Small valid configuration shared by in-crate unit tests
    pub fn small_config() -> Config {
        let n_d = 96;
        Config {
            ofdm_ca_num: 128,
            ofdm_data_num: n_d,
            ofdm_data_start: 16,
            bs_ant_num: 8,
            ue_ant_num: 2,
            spatial_streams: 2,
            frame_wnd: 4,
            transpose_block_size: 16,
            sc_per_cacheline: 8,
            demul_block_size: 48,
            beam_block_num: 96,
            ul_pilot_symbols: 2,
            ul_data_symbols: 2,
            cal_dl_symbol: None,
            cal_ul_symbol: None,
            modulation: Modulation::Qam16,
            hard_demod: true,
            export_constellation: false,
            samps_per_symbol: 160,
            rx_zero_prefix: 32,
            rx_zero_prefix_cal_dl: 0,
            rx_zero_prefix_cal_ul: 0,
            twelve_bit_iq: false,
            worker_threads: 2,
            stage_priority: [
                EventType::Fft,
                EventType::Beam,
                EventType::Equalize,
                EventType::Decode,
            ],
            queue_capacity: 512,
            ingress_threads: 1,
            rx_slots_per_thread: 64,
            frame_deadline: None,
            ldpc: LdpcParams::new(2, 16),
            pilot_sign: Config::generate_pilot_sign(17, n_d),
            ue_pilots: Config::generate_ue_pilots(29, 2, n_d),
            ground_truth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::small_config as base_config;
    use super::*;
    use common::types::{SymbolId, UeId};

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_non_divisible_blocks_rejected() {
        let mut cfg = base_config();
        cfg.transpose_block_size = 20;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.demul_block_size = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_frame_wnd_power_of_two() {
        let mut cfg = base_config();
        cfg.frame_wnd = 6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_symbol_classification() {
        let cfg = base_config();
        assert_eq!(cfg.symbol_type(SymbolId(0)).unwrap(), SymbolType::Pilot);
        assert_eq!(cfg.symbol_type(SymbolId(1)).unwrap(), SymbolType::Pilot);
        assert_eq!(cfg.symbol_type(SymbolId(2)).unwrap(), SymbolType::UplinkData);
        assert_eq!(cfg.symbol_type(SymbolId(5)).unwrap(), SymbolType::UplinkData);
        assert!(cfg.symbol_type(SymbolId(6)).is_err());

        assert_eq!(cfg.pilot_symbol_idx(SymbolId(1)), Some(UeId(1)));
        assert_eq!(cfg.pilot_symbol_idx(SymbolId(2)), None);
        assert_eq!(cfg.ul_symbol_idx(SymbolId(2)), Some(0));
        assert_eq!(cfg.ul_symbol_idx(SymbolId(5)), Some(3));
    }

    #[test]
    fn test_beam_sc_mapping() {
        let mut cfg = base_config();
        cfg.beam_block_num = 6;
        assert_eq!(cfg.beam_group_size(), 16);
        assert_eq!(cfg.beam_sc_id(0), 0);
        assert_eq!(cfg.beam_sc_id(15), 0);
        assert_eq!(cfg.beam_sc_id(16), 1);
        assert_eq!(cfg.beam_sc_id(95), 5);
    }

    #[test]
    fn test_pilot_sign_is_deterministic_and_unit() {
        let a = Config::generate_pilot_sign(7, 64);
        let b = Config::generate_pilot_sign(7, 64);
        assert_eq!(a, b);
        assert!(a.iter().all(|&s| s == 1.0 || s == -1.0));
    }
}
