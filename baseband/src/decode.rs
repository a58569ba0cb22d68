//! Decode Stage
//!
//! One work item decodes the code block of `(frame, uplink data symbol,
//! stream)`: the LLR run is read out of the demod buffer, handed to the
//! codec, and the payload bytes land in the decoded buffer. Error
//! accounting against the known payload runs here when demodulation is
//! soft; with hard demodulation the equalizer already accounted for the
//! final decisions.

use crate::buffers::{DecodedBuffer, DemodBuffer};
use crate::config::Config;
use crate::ldpc::UplinkCodec;
use crate::message::{EventData, EventType, Tag};
use crate::stats::PhyStats;
use crate::PhyError;
use std::sync::Arc;
use tracing::debug;

pub struct DecodeStage {
    cfg: Arc<Config>,
    demod: Arc<DemodBuffer>,
    decoded: Arc<DecodedBuffer>,
    codec: Arc<dyn UplinkCodec>,
    stats: Arc<PhyStats>,
}

impl DecodeStage {
    pub fn new(
        cfg: Arc<Config>,
        demod: Arc<DemodBuffer>,
        decoded: Arc<DecodedBuffer>,
        codec: Arc<dyn UplinkCodec>,
        stats: Arc<PhyStats>,
    ) -> Self {
        Self {
            cfg,
            demod,
            decoded,
            codec,
            stats,
        }
    }

    pub fn launch(&mut self, tag: Tag) -> Result<EventData, PhyError> {
        let cfg = &self.cfg;
        let frame = tag.frame();
        let data_sym = tag.symbol().0 as usize;
        let stream = tag.block() as usize;
        let slot = frame.slot(cfg.frame_wnd);
        let sym_idx_ul = cfg.ul_pilot_symbols + data_sym;

        if data_sym >= cfg.ul_data_symbols || stream >= cfg.spatial_streams {
            return Err(PhyError::Schedule {
                frame: frame.0,
                symbol: data_sym as u16,
                detail: format!("decode item out of range (stream {})", stream),
            });
        }

        let llr_slab = self.demod.slab(slot, sym_idx_ul, stream);
        // SAFETY: every equalize item of this symbol completed before the
        // scheduler dispatched decode; no writer remains.
        let llrs = unsafe { llr_slab.slice(0, llr_slab.len()) };

        let out_slab = self.decoded.slab(slot, data_sym, stream);
        // SAFETY: exactly one decode item exists per (frame, symbol, stream).
        let out = unsafe { out_slab.slice_mut(0, out_slab.len()) };

        let report = self.codec.decode(&cfg.ldpc, llrs, out);
        if !report.parity_ok {
            debug!(
                "parity failure: frame {}, data symbol {}, stream {} ({} iterations)",
                frame.0, data_sym, stream, report.iterations
            );
        }

        if !cfg.hard_demod {
            self.stats
                .update_decoded_bits(stream, slot, data_sym, cfg.ldpc.num_info_bits());
            self.stats.increment_decoded_blocks(stream, slot, data_sym);
            if let Some(gt) = &cfg.ground_truth {
                let tx = gt.payload_block(cfg.decoded_bytes(), cfg.spatial_streams, data_sym, stream);
                let mut byte_errors = 0;
                for (&t, &r) in tx.iter().zip(out.iter()) {
                    self.stats.update_bit_errors(stream, slot, data_sym, t, r);
                    if t != r {
                        byte_errors += 1;
                    }
                }
                self.stats.update_block_errors(stream, slot, data_sym, byte_errors);
            } else {
                self.stats.update_block_errors(
                    stream,
                    slot,
                    data_sym,
                    usize::from(!report.parity_ok),
                );
            }
        }

        Ok(EventData::new(EventType::Decode, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::small_config;
    use crate::ldpc::SystematicLdpc;
    use crate::modulation::Constellation;
    use common::types::FrameId;
    use common::types::SymbolId;

    fn make_stage(cfg: Arc<Config>) -> DecodeStage {
        let demod = Arc::new(DemodBuffer::new(&cfg));
        let decoded = Arc::new(DecodedBuffer::new(&cfg));
        let stats = Arc::new(PhyStats::new(&cfg));
        DecodeStage::new(cfg, demod, decoded, Arc::new(SystematicLdpc), stats)
    }

    #[test]
    fn test_decode_recovers_encoded_payload() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));
        let codec = SystematicLdpc;

        let payload: Vec<u8> = (0..cfg.decoded_bytes()).map(|i| (i * 29) as u8).collect();
        let target_bits = cfg.mod_order_bits() * cfg.ofdm_data_num;
        let bits = codec.encode(&cfg.ldpc, &payload, target_bits);

        // Plant saturated LLRs for (data symbol 1, stream 0)
        let sym_idx_ul = cfg.ul_pilot_symbols + 1;
        let slab = stage.demod.slab(0, sym_idx_ul, 0);
        let llrs = unsafe { slab.slice_mut(0, slab.len()) };
        for (dst, &b) in llrs.iter_mut().zip(bits.iter()) {
            *dst = if b == 1 { -127 } else { 127 };
        }

        let done = stage
            .launch(Tag::frame_sym_block(FrameId(0), SymbolId(1), 0))
            .unwrap();
        assert_eq!(done.event_type, EventType::Decode);

        let out = stage.decoded.slab(0, 1, 0);
        let decoded = unsafe { out.slice(0, out.len()) };
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn test_decode_roundtrips_through_demodulator() {
        // encode -> modulate -> demodulate(soft) -> decode
        let mut cfg = small_config();
        cfg.hard_demod = false;
        let cfg = Arc::new(cfg);
        let mut stage = make_stage(Arc::clone(&cfg));
        let codec = SystematicLdpc;
        let constellation = Constellation::new(cfg.modulation);

        let payload: Vec<u8> = (0..cfg.decoded_bytes()).map(|i| !(i as u8)).collect();
        let m = cfg.mod_order_bits();
        let bits = codec.encode(&cfg.ldpc, &payload, m * cfg.ofdm_data_num);

        let syms: Vec<_> = bits
            .chunks(m)
            .map(|chunk| {
                let sym = chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (k, &b)| acc | (b << k));
                constellation.map(sym)
            })
            .collect();

        let slab = stage.demod.slab(0, cfg.ul_pilot_symbols, 0);
        let llrs = unsafe { slab.slice_mut(0, slab.len()) };
        constellation.demodulate(&syms, llrs, false);

        stage
            .launch(Tag::frame_sym_block(FrameId(0), SymbolId(0), 0))
            .unwrap();

        let out = stage.decoded.slab(0, 0, 0);
        let decoded = unsafe { out.slice(0, out.len()) };
        assert_eq!(decoded, payload.as_slice());

        // Soft path updates the decode-side accounting
        let (errors, bits_counted) = stage.stats.bit_error_totals(0);
        assert_eq!(errors, 0);
        assert_eq!(bits_counted, cfg.ldpc.num_info_bits());
    }

    #[test]
    fn test_out_of_range_decode_item_is_schedule_error() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));
        assert!(matches!(
            stage.launch(Tag::frame_sym_block(FrameId(0), SymbolId(7), 0)),
            Err(PhyError::Schedule { .. })
        ));
    }
}
