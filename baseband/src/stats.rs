//! Uplink PHY Statistics
//!
//! The stats sink consumed by the stages: pilot SNR, EVM, bit/block error
//! and decoded-bit accounting, plus pipeline-level event counters. Workers
//! update concurrently, so everything in here is an atomic; EVM and SNR
//! accumulate per ring slot, are reported by the coordinator at retirement
//! and cleared when the slot is admitted again. Error counters are keyed per
//! `(ue, frame mod W, data symbol)` and summed for the run totals.

use crate::buffers::AtomicF32;
use crate::config::Config;
use common::utils::bit_errors;
use num_complex::Complex32;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

pub struct PhyStats {
    ue_num: usize,
    streams: usize,
    frame_wnd: usize,
    data_symbols: usize,
    ofdm_data_start: usize,
    ofdm_data_num: usize,

    decoded_bits: Vec<AtomicUsize>,
    bit_error_count: Vec<AtomicUsize>,
    decoded_blocks: Vec<AtomicUsize>,
    block_error_count: Vec<AtomicUsize>,

    evm: Vec<AtomicF32>,
    pilot_snr_db: Vec<AtomicF32>,

    beam_singular: AtomicUsize,
    deadline_missed: AtomicUsize,
}

impl PhyStats {
    pub fn new(cfg: &Config) -> Self {
        let per_ue = cfg.frame_wnd * cfg.ul_data_symbols;
        let counters = cfg.ue_ant_num * per_ue;
        Self {
            ue_num: cfg.ue_ant_num,
            streams: cfg.spatial_streams,
            frame_wnd: cfg.frame_wnd,
            data_symbols: cfg.ul_data_symbols,
            ofdm_data_start: cfg.ofdm_data_start,
            ofdm_data_num: cfg.ofdm_data_num,
            decoded_bits: (0..counters).map(|_| AtomicUsize::new(0)).collect(),
            bit_error_count: (0..counters).map(|_| AtomicUsize::new(0)).collect(),
            decoded_blocks: (0..counters).map(|_| AtomicUsize::new(0)).collect(),
            block_error_count: (0..counters).map(|_| AtomicUsize::new(0)).collect(),
            evm: (0..cfg.frame_wnd * cfg.spatial_streams)
                .map(|_| AtomicF32::default())
                .collect(),
            pilot_snr_db: (0..cfg.frame_wnd * cfg.ue_ant_num)
                .map(|_| AtomicF32::default())
                .collect(),
            beam_singular: AtomicUsize::new(0),
            deadline_missed: AtomicUsize::new(0),
        }
    }

    fn counter_index(&self, ue: usize, slot: usize, data_sym: usize) -> usize {
        (ue * self.frame_wnd + slot) * self.data_symbols + data_sym
    }

    /// SNR estimate from a pilot symbol's FFT output: signal from the data
    /// band, noise from the guard bins outside it.
    pub fn update_pilot_snr(&self, slot: usize, ue: usize, fft_bins: &[Complex32]) {
        let data = &fft_bins[self.ofdm_data_start..self.ofdm_data_start + self.ofdm_data_num];
        let signal: f32 = data.iter().map(|v| v.norm_sqr()).sum::<f32>() / data.len() as f32;

        let guard_len = fft_bins.len() - self.ofdm_data_num;
        let noise: f32 = if guard_len > 0 {
            let head = fft_bins[..self.ofdm_data_start]
                .iter()
                .map(|v| v.norm_sqr())
                .sum::<f32>();
            let tail = fft_bins[self.ofdm_data_start + self.ofdm_data_num..]
                .iter()
                .map(|v| v.norm_sqr())
                .sum::<f32>();
            (head + tail) / guard_len as f32
        } else {
            0.0
        };

        let snr_db = 10.0 * (signal / noise.max(1e-12)).log10();
        self.pilot_snr_db[slot * self.ue_num + ue].store(snr_db);
    }

    /// Accumulate squared error distance for one equalized data sample
    pub fn update_evm(&self, slot: usize, stream: usize, sq_err: f32) {
        self.evm[slot * self.streams + stream].fetch_add(sq_err);
    }

    pub fn update_bit_errors(&self, ue: usize, slot: usize, data_sym: usize, tx: u8, rx: u8) {
        let errors = bit_errors(tx, rx);
        if errors > 0 {
            self.bit_error_count[self.counter_index(ue, slot, data_sym)]
                .fetch_add(errors, Ordering::Relaxed);
        }
    }

    pub fn update_decoded_bits(&self, ue: usize, slot: usize, data_sym: usize, bits: usize) {
        self.decoded_bits[self.counter_index(ue, slot, data_sym)].fetch_add(bits, Ordering::Relaxed);
    }

    pub fn increment_decoded_blocks(&self, ue: usize, slot: usize, data_sym: usize) {
        self.decoded_blocks[self.counter_index(ue, slot, data_sym)].fetch_add(1, Ordering::Relaxed);
    }

    /// A block with any errored bits counts as one block error
    pub fn update_block_errors(&self, ue: usize, slot: usize, data_sym: usize, errors: usize) {
        if errors > 0 {
            self.block_error_count[self.counter_index(ue, slot, data_sym)]
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_beam_singular(&self) {
        self.beam_singular.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beam_singular_count(&self) -> usize {
        self.beam_singular.load(Ordering::Relaxed)
    }

    pub fn increment_deadline_missed(&self) {
        self.deadline_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deadline_missed_count(&self) -> usize {
        self.deadline_missed.load(Ordering::Relaxed)
    }

    /// Root-mean-square EVM of one stream over a retired frame
    pub fn frame_evm_rms(&self, slot: usize, stream: usize) -> f32 {
        let samples = (self.data_symbols * self.ofdm_data_num) as f32;
        (self.evm[slot * self.streams + stream].load() / samples).sqrt()
    }

    /// Log the per-frame EVM/SNR report at retirement
    pub fn frame_report(&self, frame_id: u32, slot: usize) {
        let evm: Vec<String> = (0..self.streams)
            .map(|s| format!("{:.3}%", 100.0 * self.frame_evm_rms(slot, s)))
            .collect();
        let snr: Vec<String> = (0..self.ue_num)
            .map(|u| format!("{:.1}dB", self.pilot_snr_db[slot * self.ue_num + u].load()))
            .collect();
        info!(
            "Frame {}: EVM [{}], pilot SNR [{}]",
            frame_id,
            evm.join(", "),
            snr.join(", ")
        );
    }

    /// Clear the per-slot accumulators when the ring slot is admitted again
    pub fn reset_slot(&self, slot: usize) {
        for s in 0..self.streams {
            self.evm[slot * self.streams + s].store(0.0);
        }
    }

    /// Lifetime `(bit errors, decoded bits)` for one UE
    pub fn bit_error_totals(&self, ue: usize) -> (usize, usize) {
        let per_ue = self.frame_wnd * self.data_symbols;
        let base = ue * per_ue;
        let errors = (0..per_ue)
            .map(|i| self.bit_error_count[base + i].load(Ordering::Relaxed))
            .sum();
        let bits = (0..per_ue)
            .map(|i| self.decoded_bits[base + i].load(Ordering::Relaxed))
            .sum();
        (errors, bits)
    }

    /// Lifetime `(block errors, decoded blocks)` for one UE
    pub fn block_error_totals(&self, ue: usize) -> (usize, usize) {
        let per_ue = self.frame_wnd * self.data_symbols;
        let base = ue * per_ue;
        let errors = (0..per_ue)
            .map(|i| self.block_error_count[base + i].load(Ordering::Relaxed))
            .sum();
        let blocks = (0..per_ue)
            .map(|i| self.decoded_blocks[base + i].load(Ordering::Relaxed))
            .sum();
        (errors, blocks)
    }

    /// End-of-run BER/BLER summary, one line per UE
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for ue in 0..self.ue_num {
            let (bit_err, bits) = self.bit_error_totals(ue);
            let (blk_err, blocks) = self.block_error_totals(ue);
            out.push_str(&format!(
                "UE {}: bit errors {}/{} ({:.2e}), block errors {}/{} ({:.2e})\n",
                ue,
                bit_err,
                bits,
                bit_err as f64 / (bits as f64).max(1.0),
                blk_err,
                blocks,
                blk_err as f64 / (blocks as f64).max(1.0),
            ));
        }
        out
    }
}
