//! FFT / CSI Stage
//!
//! Consumes one raw IQ packet: converts the samples to complex floats
//! (skipping the symbol-class zero prefix), runs the forward FFT in place,
//! then writes the data subcarriers into the partially transposed layout.
//! On the pilot path the copy is fused with the reference-pilot
//! de-rotation, so the CSI estimate lands in the buffer already
//! de-rotated. The packet slot is freed after the dispatch with an atomic
//! store of zero.

use crate::buffers::{CsiBuffer, DataBuffer, SharedSlab};
use crate::config::{Config, SymbolType};
use crate::message::{EventData, EventType, Tag};
use crate::rx::{self, PacketHeader, RxSocketBuffer};
use crate::stats::PhyStats;
use crate::PhyError;
use num_complex::Complex32;
use rustfft::Fft;
use std::sync::Arc;
use tracing::debug;

pub struct FftStage {
    cfg: Arc<Config>,
    fft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex32>,
    fft_scratch: Vec<Complex32>,
    rx: Arc<RxSocketBuffer>,
    data: Arc<DataBuffer>,
    csi: Arc<CsiBuffer>,
    stats: Arc<PhyStats>,
}

impl FftStage {
    pub fn new(
        cfg: Arc<Config>,
        fft: Arc<dyn Fft<f32>>,
        rx: Arc<RxSocketBuffer>,
        data: Arc<DataBuffer>,
        csi: Arc<CsiBuffer>,
        stats: Arc<PhyStats>,
    ) -> Self {
        let fft_buf = vec![Complex32::new(0.0, 0.0); cfg.ofdm_ca_num];
        let fft_scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        Self {
            cfg,
            fft,
            fft_buf,
            fft_scratch,
            rx,
            data,
            csi,
            stats,
        }
    }

    /// Process the packet a descriptor points at and return the completion
    /// event carrying `(frame, symbol)`.
    pub fn launch(&mut self, tag: Tag) -> Result<EventData, PhyError> {
        let thread = tag.rx_thread();
        let slot_idx = tag.rx_slot();

        // SAFETY: this worker holds the rx descriptor for the slot; the
        // ingress side stopped touching it when it published the event.
        let pkt = unsafe { self.rx.packet(thread, slot_idx) };
        let header = PacketHeader::parse(pkt)?;
        let frame_slot = header.frame.slot(self.cfg.frame_wnd);

        let sym_type = self.cfg.symbol_type(header.symbol).map_err(|_| {
            PhyError::Schedule {
                frame: header.frame.0,
                symbol: header.symbol.0,
                detail: "unknown symbol type".into(),
            }
        })?;

        let prefix = self.cfg.rx_prefix(sym_type);
        rx::decode_iq(
            &pkt[rx::HEADER_LEN..],
            self.cfg.twelve_bit_iq,
            prefix,
            &mut self.fft_buf,
        );

        self.fft
            .process_with_scratch(&mut self.fft_buf, &mut self.fft_scratch);

        let ant = header.antenna.0 as usize;
        match sym_type {
            SymbolType::Pilot => {
                let ue = self
                    .cfg
                    .pilot_symbol_idx(header.symbol)
                    .expect("classified pilot has a UE index")
                    .0 as usize;
                self.stats.update_pilot_snr(frame_slot, ue, &self.fft_buf);
                let slab = self.csi.slab(frame_slot, ue);
                self.partial_transpose(slab, ant, true);
            }
            SymbolType::UplinkData => {
                let ul_sym = self
                    .cfg
                    .ul_symbol_idx(header.symbol)
                    .expect("classified uplink symbol has an index");
                let slab = self.data.slab(frame_slot, ul_sym);
                self.partial_transpose(slab, ant, false);
            }
            SymbolType::CalDl | SymbolType::CalUl => {
                debug!(
                    "dropping calibration symbol: frame {}, symbol {}, ant {}",
                    header.frame.0, header.symbol.0, ant
                );
            }
        }

        // Free the packet slot only after the symbol has been dispatched
        self.rx.release(thread, slot_idx);

        Ok(EventData::new(
            EventType::Fft,
            Tag::frame_sym(header.frame, header.symbol),
        ))
    }

    /// Copy the data subcarriers into the partially transposed layout:
    /// `out[block*B_tr*A + ant*B_tr + sc_in_block]`. On the pilot path the
    /// copy is fused with the elementwise reference-sign multiply.
    fn partial_transpose(&self, out: &SharedSlab<Complex32>, ant: usize, derotate: bool) {
        let cfg = &self.cfg;
        let b_tr = cfg.transpose_block_size;
        let ants = cfg.bs_ant_num;
        let num_blocks = cfg.ofdm_data_num / b_tr;

        for block in 0..num_blocks {
            let stripe_base = block * b_tr * ants + ant * b_tr;
            // SAFETY: exactly one FFT item exists per (frame, symbol,
            // antenna); antenna stripes of one slab are disjoint.
            let stripe = unsafe { out.slice_mut(stripe_base, b_tr) };
            let src = &self.fft_buf[cfg.ofdm_data_start + block * b_tr..];
            if derotate {
                let sign = &cfg.pilot_sign[block * b_tr..];
                for j in 0..b_tr {
                    stripe[j] = src[j] * sign[j];
                }
            } else {
                stripe[..b_tr].copy_from_slice(&src[..b_tr]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::small_config;
    use common::types::{AntennaId, FrameId, SymbolId};
    use rustfft::FftPlanner;

    fn make_stage(cfg: Arc<Config>) -> FftStage {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(cfg.ofdm_ca_num);
        let rx = Arc::new(RxSocketBuffer::new(
            cfg.ingress_threads,
            cfg.rx_slots_per_thread,
            cfg.packet_len(),
        ));
        let data = Arc::new(DataBuffer::new(&cfg));
        let csi = Arc::new(CsiBuffer::new(&cfg));
        let stats = Arc::new(PhyStats::new(&cfg));
        FftStage::new(cfg, fft, rx, data, csi, stats)
    }

    fn inject(stage: &FftStage, header: PacketHeader, iq: &[i16]) -> Tag {
        let slot = stage.rx.try_claim(0).unwrap();
        let bytes = rx::encode_packet(header, iq);
        // SAFETY: freshly claimed slot, not yet published
        unsafe { stage.rx.packet_mut(0, slot)[..bytes.len()].copy_from_slice(&bytes) };
        Tag::rx(0, slot as u16)
    }

    fn test_samples(cfg: &Config, seed: u32) -> Vec<i16> {
        let mut state = seed | 1;
        (0..cfg.samps_per_symbol * 2)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 18) as i16
            })
            .collect()
    }

    #[test]
    fn test_pilot_partial_transpose_matches_reference() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));

        let header = PacketHeader {
            frame: FrameId(0),
            symbol: SymbolId(0), // pilot for UE 0
            antenna: AntennaId(3),
        };
        let iq = test_samples(&cfg, 0xC0FFEE);
        let tag = inject(&stage, header, &iq);
        let done = stage.launch(tag).unwrap();
        assert_eq!(done.event_type, EventType::Fft);
        assert_eq!(done.tag.frame(), FrameId(0));

        // Reference: decode, FFT, de-rotate
        let pkt = rx::encode_packet(header, &iq);
        let mut reference = vec![Complex32::new(0.0, 0.0); cfg.ofdm_ca_num];
        rx::decode_iq(&pkt[rx::HEADER_LEN..], false, cfg.rx_zero_prefix, &mut reference);
        FftPlanner::<f32>::new()
            .plan_fft_forward(cfg.ofdm_ca_num)
            .process(&mut reference);

        let b_tr = cfg.transpose_block_size;
        let ants = cfg.bs_ant_num;
        let ant = 3usize;
        let slab = stage.csi.slab(0, 0);
        for block in 0..cfg.ofdm_data_num / b_tr {
            let stripe = unsafe { slab.slice(block * b_tr * ants + ant * b_tr, b_tr) };
            for j in 0..b_tr {
                let sc = block * b_tr + j;
                let expected = reference[cfg.ofdm_data_start + sc] * cfg.pilot_sign[sc];
                assert!(
                    (stripe[j] - expected).norm() < 1e-4,
                    "csi mismatch at block {} sc {}",
                    block,
                    j
                );
            }
        }
    }

    #[test]
    fn test_uplink_symbol_lands_in_data_buffer_without_derotation() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));

        let ul_symbol = SymbolId(cfg.ue_ant_num as u16); // first uplink symbol
        let header = PacketHeader {
            frame: FrameId(2),
            symbol: ul_symbol,
            antenna: AntennaId(0),
        };
        let iq = test_samples(&cfg, 0xBEEF);
        let tag = inject(&stage, header, &iq);
        stage.launch(tag).unwrap();

        let pkt = rx::encode_packet(header, &iq);
        let mut reference = vec![Complex32::new(0.0, 0.0); cfg.ofdm_ca_num];
        rx::decode_iq(&pkt[rx::HEADER_LEN..], false, cfg.rx_zero_prefix, &mut reference);
        FftPlanner::<f32>::new()
            .plan_fft_forward(cfg.ofdm_ca_num)
            .process(&mut reference);

        let slab = stage.data.slab(2, 0);
        let b_tr = cfg.transpose_block_size;
        let stripe = unsafe { slab.slice(0, b_tr) }; // antenna 0, block 0
        for j in 0..b_tr {
            let expected = reference[cfg.ofdm_data_start + j];
            assert!((stripe[j] - expected).norm() < 1e-4);
        }
    }

    #[test]
    fn test_packet_slot_freed_after_launch() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));

        let header = PacketHeader {
            frame: FrameId(0),
            symbol: SymbolId(0),
            antenna: AntennaId(0),
        };
        let iq = test_samples(&cfg, 1);
        let tag = inject(&stage, header, &iq);
        let claimed_slot = tag.rx_slot();
        stage.launch(tag).unwrap();

        // The slot must be reusable immediately
        let mut seen = false;
        for _ in 0..cfg.rx_slots_per_thread {
            if let Some(s) = stage.rx.try_claim(0) {
                if s == claimed_slot {
                    seen = true;
                }
            }
        }
        assert!(seen, "processed slot was not released");
    }

    #[test]
    fn test_unknown_symbol_type_is_fatal() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));

        let header = PacketHeader {
            frame: FrameId(0),
            symbol: SymbolId(99),
            antenna: AntennaId(0),
        };
        let iq = test_samples(&cfg, 2);
        let tag = inject(&stage, header, &iq);
        assert!(matches!(
            stage.launch(tag),
            Err(PhyError::Schedule { symbol: 99, .. })
        ));
    }
}
