//! Equalize + Demodulate Stage
//!
//! One work item covers `(frame, uplink symbol, base subcarrier)` and walks
//! the block cacheline by cacheline: gather the antenna samples out of the
//! partially transposed data buffer, combine them with the per-subcarrier
//! beam matrix, track the per-stream phase drift against the UE reference
//! pilots, accumulate EVM, then demodulate each stream's equalized run into
//! the demod buffer.

use crate::buffers::{BeamMatrixBuffer, DataBuffer, DemodBuffer, EqualBuffer, PhaseBuffer, SharedSlab};
use crate::config::Config;
use crate::linalg::CombineFn;
use crate::message::{EventData, EventType, Tag};
use crate::modulation::Constellation;
use crate::stats::PhyStats;
use crate::PhyError;
use num_complex::Complex32;
use std::sync::Arc;

/// Antenna lanes gathered per unrolled step
const ANT_LANES: usize = 4;

/// Unit-magnitude direction of a sample, zero stays zero
fn csign(z: Complex32) -> Complex32 {
    let n = z.norm();
    if n > 0.0 {
        z / n
    } else {
        Complex32::new(0.0, 0.0)
    }
}

pub struct EqualizeStage {
    cfg: Arc<Config>,
    data: Arc<DataBuffer>,
    beams: Arc<BeamMatrixBuffer>,
    equal_export: Option<Arc<EqualBuffer>>,
    phase: Arc<PhaseBuffer>,
    demod: Arc<DemodBuffer>,
    stats: Arc<PhyStats>,
    combine: CombineFn,
    constellation: Constellation,
    /// Gather scratch, `B_cl x A` row-major
    gather_buf: Vec<Complex32>,
    /// Equalized block, `max_sc x S`
    equaled: Vec<Complex32>,
    /// Per-stream contiguous run handed to the demodulator
    stream_buf: Vec<Complex32>,
}

impl EqualizeStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        data: Arc<DataBuffer>,
        beams: Arc<BeamMatrixBuffer>,
        equal_export: Option<Arc<EqualBuffer>>,
        phase: Arc<PhaseBuffer>,
        demod: Arc<DemodBuffer>,
        stats: Arc<PhyStats>,
        combine: CombineFn,
    ) -> Self {
        let gather_buf =
            vec![Complex32::new(0.0, 0.0); cfg.sc_per_cacheline * cfg.bs_ant_num];
        let equaled =
            vec![Complex32::new(0.0, 0.0); cfg.demul_block_size * cfg.spatial_streams];
        let stream_buf = vec![Complex32::new(0.0, 0.0); cfg.demul_block_size];
        let constellation = Constellation::new(cfg.modulation);
        Self {
            cfg,
            data,
            beams,
            equal_export,
            phase,
            demod,
            stats,
            combine,
            constellation,
            gather_buf,
            equaled,
            stream_buf,
        }
    }

    pub fn launch(&mut self, tag: Tag) -> Result<EventData, PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let frame = tag.frame();
        let symbol = tag.symbol();
        let base_sc = tag.block() as usize;
        let slot = frame.slot(cfg.frame_wnd);

        let sym_idx_ul = cfg.ul_symbol_idx(symbol).ok_or_else(|| PhyError::Schedule {
            frame: frame.0,
            symbol: symbol.0,
            detail: "equalize item for a non-uplink symbol".into(),
        })?;
        let is_pilot = sym_idx_ul < cfg.ul_pilot_symbols;

        // Clip the last block of the symbol
        let max_sc = cfg.demul_block_size.min(cfg.ofdm_data_num - base_sc);
        debug_assert_eq!(max_sc % cfg.sc_per_cacheline, 0);

        let streams = cfg.spatial_streams;
        let ants = cfg.bs_ant_num;
        let data = Arc::clone(&self.data);
        let beams = Arc::clone(&self.beams);
        let export = self.equal_export.clone();
        let phase = Arc::clone(&self.phase);
        let data_slab = data.slab(slot, sym_idx_ul);

        // The correction is constant across the block; derive it once from
        // the completed pilot correlations.
        let correction = (!is_pilot && cfg.ul_pilot_symbols > 0)
            .then(|| self.phase_correction(slot, sym_idx_ul));

        for i in (0..max_sc).step_by(cfg.sc_per_cacheline) {
            self.gather_cacheline(data_slab, base_sc + i);

            for j in 0..cfg.sc_per_cacheline {
                let sc = base_sc + i + j;
                let beam_slab = beams.slab(slot, cfg.beam_sc_id(sc));
                // SAFETY: beam completions for this frame precede equalize
                // dispatch; the slab has no writer anymore.
                let w = unsafe { beam_slab.slice(0, beam_slab.len()) };
                let x = &self.gather_buf[j * ants..(j + 1) * ants];
                let y = &mut self.equaled[(i + j) * streams..(i + j + 1) * streams];
                (self.combine)(w, x, y);

                if is_pilot {
                    if sym_idx_ul == 0 && sc == 0 {
                        // Lazy reset of the previous frame's correlations
                        phase.reset_slot(frame.prev().slot(cfg.frame_wnd));
                    }
                    for (s, ys) in y.iter().enumerate() {
                        let p = cfg.ue_pilot(s)[sc];
                        phase.add(slot, sym_idx_ul, s, csign(ys * p.conj()));
                    }
                } else if let Some(corr) = &correction {
                    for (ys, c) in y.iter_mut().zip(corr.iter()) {
                        *ys *= c;
                    }
                }

                if !is_pilot {
                    if let Some(gt) = &cfg.ground_truth {
                        for (s, ys) in y.iter().enumerate() {
                            let err = ys - gt.reference(cfg.ofdm_data_num, s, sc);
                            self.stats.update_evm(slot, s, err.norm_sqr());
                        }
                    }
                }

                if let Some(export) = &export {
                    let slab = export.slab(slot, sym_idx_ul);
                    // SAFETY: subcarrier ranges of concurrent equalize items
                    // are disjoint.
                    unsafe { slab.slice_mut(sc * streams, streams) }.copy_from_slice(y);
                }
            }
        }

        self.demodulate_block(slot, sym_idx_ul, base_sc, max_sc);

        Ok(EventData::new(EventType::Equalize, tag))
    }

    /// Phase offset per stream extrapolated from the pilot correlations:
    /// start at the first pilot's angle and advance by the mean per-symbol
    /// increment.
    fn phase_correction(&self, slot: usize, sym_idx_ul: usize) -> Vec<Complex32> {
        let cfg = &self.cfg;
        let p_ul = cfg.ul_pilot_symbols;
        (0..cfg.spatial_streams)
            .map(|s| {
                let theta0 = self.phase.read(slot, 0, s).arg();
                let mut inc = 0.0f32;
                for p in 1..p_ul {
                    inc += self.phase.read(slot, p, s).arg() - self.phase.read(slot, p - 1, s).arg();
                }
                inc /= (p_ul - 1).max(1) as f32;
                let cur = theta0 + sym_idx_ul as f32 * inc;
                Complex32::new(cur.cos(), -cur.sin())
            })
            .collect()
    }

    /// Gather `B_cl x A` samples for the cacheline at `base` into the
    /// scratch buffer: full antenna lane groups first, scalar tail for the
    /// remainder. Both paths compute identical indices, so the output is
    /// bit-identical to an all-scalar gather.
    fn gather_cacheline(&mut self, slab: &SharedSlab<Complex32>, base: usize) {
        let cfg = &self.cfg;
        let b_tr = cfg.transpose_block_size;
        let b_cl = cfg.sc_per_cacheline;
        let ants = cfg.bs_ant_num;

        // B_cl divides B_tr and base is a multiple of B_cl, so the whole
        // cacheline sits inside one transpose block.
        let block_base = (base / b_tr) * (b_tr * ants);
        let sc_off = base % b_tr;

        // SAFETY: all FFT completions for this symbol precede equalize
        // dispatch; the data slab has no remaining writer.
        let src = unsafe { slab.slice(0, slab.len()) };
        let dst = &mut self.gather_buf;

        let lane_end = ants - ants % ANT_LANES;
        for ant in (0..lane_end).step_by(ANT_LANES) {
            for j in 0..b_cl {
                let row = &mut dst[j * ants + ant..j * ants + ant + ANT_LANES];
                let col = block_base + sc_off + j;
                row[0] = src[col + ant * b_tr];
                row[1] = src[col + (ant + 1) * b_tr];
                row[2] = src[col + (ant + 2) * b_tr];
                row[3] = src[col + (ant + 3) * b_tr];
            }
        }
        for j in 0..b_cl {
            for ant in lane_end..ants {
                dst[j * ants + ant] = src[block_base + ant * b_tr + sc_off + j];
            }
        }
    }

    /// Transpose the equalized block stream-major and demodulate each run
    fn demodulate_block(&mut self, slot: usize, sym_idx_ul: usize, base_sc: usize, max_sc: usize) {
        let cfg = Arc::clone(&self.cfg);
        let streams = cfg.spatial_streams;
        let m = cfg.mod_order_bits();
        let is_pilot = sym_idx_ul < cfg.ul_pilot_symbols;
        let demod = Arc::clone(&self.demod);

        for s in 0..streams {
            for k in 0..max_sc {
                self.stream_buf[k] = self.equaled[k * streams + s];
            }
            let slab = demod.slab(slot, sym_idx_ul, s);
            // SAFETY: concurrent equalize items cover disjoint subcarrier
            // ranges, so the `M * base_sc` offsets never overlap.
            let out = unsafe { slab.slice_mut(m * base_sc, m * max_sc) };
            self.constellation
                .demodulate(&self.stream_buf[..max_sc], out, cfg.hard_demod);

            // With hard demodulation the decisions are final here, so the
            // error accounting runs against the known transmit symbols.
            if cfg.hard_demod && !is_pilot {
                if let Some(gt) = &cfg.ground_truth {
                    let data_sym = sym_idx_ul - cfg.ul_pilot_symbols;
                    self.stats.update_decoded_bits(s, slot, data_sym, max_sc * m);
                    self.stats.increment_decoded_blocks(s, slot, data_sym);
                    let mut block_errors = 0;
                    for k in 0..max_sc {
                        let rx = self.constellation.hard_symbol(self.stream_buf[k]);
                        let tx =
                            gt.mod_symbol(cfg.ofdm_data_num, streams, data_sym, s, base_sc + k);
                        self.stats.update_bit_errors(s, slot, data_sym, tx, rx);
                        if rx != tx {
                            block_errors += 1;
                        }
                    }
                    self.stats.update_block_errors(s, slot, data_sym, block_errors);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{BeamMatrixBuffer, DataBuffer, DemodBuffer, PhaseBuffer};
    use crate::config::tests_support::small_config;
    use crate::linalg::combine_kernel;
    use common::types::FrameId;

    fn make_stage(cfg: Arc<Config>) -> EqualizeStage {
        let data = Arc::new(DataBuffer::new(&cfg));
        let beams = Arc::new(BeamMatrixBuffer::new(&cfg));
        let phase = Arc::new(PhaseBuffer::new(&cfg));
        let demod = Arc::new(DemodBuffer::new(&cfg));
        let stats = Arc::new(PhyStats::new(&cfg));
        let combine = combine_kernel(cfg.spatial_streams).unwrap();
        EqualizeStage::new(cfg, data, beams, None, phase, demod, stats, combine)
    }

    /// Identity combiner: stream s listens to antenna s only
    fn write_identity_beams(cfg: &Config, beams: &BeamMatrixBuffer, slot: usize) {
        for b in 0..cfg.beam_block_num {
            let slab = beams.slab(slot, b);
            let w = unsafe { slab.slice_mut(0, slab.len()) };
            for s in 0..cfg.spatial_streams {
                w[s * cfg.bs_ant_num + s] = Complex32::new(1.0, 0.0);
            }
        }
    }

    /// Store `v` at `(ant, sc)` in partial-transpose layout
    fn poke(cfg: &Config, slab: &SharedSlab<Complex32>, ant: usize, sc: usize, v: Complex32) {
        let b_tr = cfg.transpose_block_size;
        let idx = (sc / b_tr) * (b_tr * cfg.bs_ant_num) + ant * b_tr + sc % b_tr;
        unsafe { slab.slice_mut(idx, 1)[0] = v };
    }

    #[test]
    fn test_gather_lane_path_matches_scalar() {
        // 6 antennas: lane group of 4 plus scalar tail of 2
        let mut cfg = small_config();
        cfg.bs_ant_num = 6;
        let cfg = Arc::new(cfg);
        let mut stage = make_stage(Arc::clone(&cfg));

        let slab = stage.data.slab(0, 0);
        for ant in 0..cfg.bs_ant_num {
            for sc in 0..cfg.ofdm_data_num {
                poke(&cfg, slab, ant, sc, Complex32::new(ant as f32, sc as f32));
            }
        }

        let data = Arc::clone(&stage.data);
        stage.gather_cacheline(data.slab(0, 0), 16);

        // All-scalar reference over the same cacheline
        let b_tr = cfg.transpose_block_size;
        let src = unsafe { data.slab(0, 0).slice(0, data.slab(0, 0).len()) };
        for j in 0..cfg.sc_per_cacheline {
            for ant in 0..cfg.bs_ant_num {
                let base = 16 + j;
                let expected =
                    src[(base / b_tr) * (b_tr * cfg.bs_ant_num) + ant * b_tr + base % b_tr];
                let got = stage.gather_buf[j * cfg.bs_ant_num + ant];
                assert_eq!(got, expected, "ant {} sc {}", ant, j);
            }
        }
    }

    #[test]
    fn test_identity_channel_block_clipped_at_band_edge() {
        let mut cfg = small_config();
        cfg.demul_block_size = 64; // 96 - 64 = 32 sc in the last (clipped) block
        let cfg = Arc::new(cfg);
        let mut stage = make_stage(Arc::clone(&cfg));

        write_identity_beams(&cfg, &stage.beams, 0);
        let point = stage.constellation.map(0b0110);
        let data_sym_ul = cfg.ul_pilot_symbols; // first data symbol
        let slab = stage.data.slab(0, data_sym_ul);
        for sc in 0..cfg.ofdm_data_num {
            for s in 0..cfg.spatial_streams {
                poke(&cfg, slab, s, sc, point);
            }
        }

        // Clipped final block succeeds
        let symbol = cfg.ul_symbol_id(data_sym_ul);
        for base in [0usize, 64] {
            stage
                .launch(Tag::frame_sym_block(FrameId(0), symbol, base as u16))
                .unwrap();
        }

        // Every subcarrier demodulated back to the transmitted symbol
        let m = cfg.mod_order_bits();
        for s in 0..cfg.spatial_streams {
            let slab = stage.demod.slab(0, data_sym_ul, s);
            let bits = unsafe { slab.slice(0, slab.len()) };
            for sc in 0..cfg.ofdm_data_num {
                for b in 0..m {
                    let expected = if (0b0110 >> b) & 1 == 1 { -127 } else { 127 };
                    assert_eq!(
                        bits[sc * m + b],
                        expected,
                        "stream {} sc {} bit {}",
                        s,
                        sc,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn test_pilot_symbol_accumulates_unit_phase() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));
        write_identity_beams(&cfg, &stage.beams, 0);

        // Received pilots equal the reference pilots: correlation angle 0
        let slab = stage.data.slab(0, 0);
        for sc in 0..cfg.ofdm_data_num {
            for s in 0..cfg.spatial_streams {
                poke(&cfg, slab, s, sc, cfg.ue_pilot(s)[sc]);
            }
        }

        let symbol = cfg.ul_symbol_id(0);
        for block in 0..cfg.demul_block_num() {
            let base = (block * cfg.demul_block_size) as u16;
            stage
                .launch(Tag::frame_sym_block(FrameId(0), symbol, base))
                .unwrap();
        }

        for s in 0..cfg.spatial_streams {
            let corr = stage.phase.read(0, 0, s);
            // Every subcarrier contributed a unit vector at angle zero
            assert!((corr.norm() - cfg.ofdm_data_num as f32).abs() < 1e-2);
            assert!(corr.arg().abs() < 1e-4);
        }
    }

    #[test]
    fn test_data_symbol_phase_corrected_from_pilots() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));
        write_identity_beams(&cfg, &stage.beams, 0);

        // Common phase drift: 0.2 rad at pilot 0, advancing 0.1 rad/symbol
        let theta = |idx: usize| 0.2 + 0.1 * idx as f32;
        let rot = |t: f32| Complex32::new(t.cos(), t.sin());

        for pilot in 0..cfg.ul_pilot_symbols {
            let slab = stage.data.slab(0, pilot);
            for sc in 0..cfg.ofdm_data_num {
                for s in 0..cfg.spatial_streams {
                    poke(&cfg, slab, s, sc, cfg.ue_pilot(s)[sc] * rot(theta(pilot)));
                }
            }
        }
        let data_sym_ul = cfg.ul_pilot_symbols;
        let point = stage.constellation.map(0b0011);
        let slab = stage.data.slab(0, data_sym_ul);
        for sc in 0..cfg.ofdm_data_num {
            for s in 0..cfg.spatial_streams {
                poke(&cfg, slab, s, sc, point * rot(theta(data_sym_ul)));
            }
        }

        // Pilots first, then the data symbol
        for ul_sym in 0..=data_sym_ul {
            let symbol = cfg.ul_symbol_id(ul_sym);
            for block in 0..cfg.demul_block_num() {
                let base = (block * cfg.demul_block_size) as u16;
                stage
                    .launch(Tag::frame_sym_block(FrameId(0), symbol, base))
                    .unwrap();
            }
        }

        // The drift is extrapolated and removed, leaving the constellation
        // point; residual rotation would flip hard decisions.
        let m = cfg.mod_order_bits();
        let slab = stage.demod.slab(0, data_sym_ul, 0);
        let bits = unsafe { slab.slice(0, slab.len()) };
        for sc in 0..cfg.ofdm_data_num {
            for b in 0..m {
                let expected = if (0b0011 >> b) & 1 == 1 { -127 } else { 127 };
                assert_eq!(bits[sc * m + b], expected, "sc {} bit {}", sc, b);
            }
        }
    }

    #[test]
    fn test_first_pilot_block_resets_previous_frame_phase() {
        let cfg = Arc::new(small_config());
        let mut stage = make_stage(Arc::clone(&cfg));
        write_identity_beams(&cfg, &stage.beams, 0);

        // Stale accumulation in the previous frame's slot
        let prev_slot = FrameId(0).prev().slot(cfg.frame_wnd);
        stage.phase.add(prev_slot, 0, 0, Complex32::new(5.0, 5.0));

        let symbol = cfg.ul_symbol_id(0);
        stage
            .launch(Tag::frame_sym_block(FrameId(0), symbol, 0))
            .unwrap();

        assert_eq!(
            stage.phase.read(prev_slot, 0, 0),
            Complex32::new(0.0, 0.0),
            "previous frame's phase slice must be lazily reset"
        );
    }
}
