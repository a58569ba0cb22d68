//! Beam-Matrix Builder
//!
//! For the subcarrier range owned by one beam id, gathers the estimated
//! channel `H` (antennas x streams) out of the partially transposed CSI
//! buffers and computes the zero-forcing uplink combiner
//! `W = (Hᴴ H)⁻¹ Hᴴ`. A numerically singular channel falls back to the
//! SVD pseudo-inverse; that is logged and counted, never fatal.

use crate::buffers::{BeamMatrixBuffer, CsiBuffer};
use crate::config::Config;
use crate::linalg::{cholesky_inverse, gram, hermitian, matmul, pseudo_inverse};
use crate::message::{EventData, EventType, Tag};
use crate::stats::PhyStats;
use crate::PhyError;
use ndarray::Array2;
use num_complex::Complex32;
use std::sync::Arc;
use tracing::warn;

/// Singular-value cutoff for the pseudo-inverse fallback
const PINV_CUTOFF: f32 = 1e-2;

/// How the beam matrix was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeamOutcome {
    /// Regular zero-forcing path
    Ok,
    /// Gram matrix was singular; pseudo-inverse fallback used
    Singular,
}

/// Compute the uplink combiner for one channel estimate
pub fn compute_ul_beam(h: &Array2<Complex32>) -> (Array2<Complex32>, BeamOutcome) {
    match cholesky_inverse(&gram(h)) {
        Some(inv) => (matmul(&inv, &hermitian(h)), BeamOutcome::Ok),
        None => (pseudo_inverse(h, PINV_CUTOFF), BeamOutcome::Singular),
    }
}

pub struct BeamStage {
    cfg: Arc<Config>,
    csi: Arc<CsiBuffer>,
    beams: Arc<BeamMatrixBuffer>,
    stats: Arc<PhyStats>,
}

impl BeamStage {
    pub fn new(
        cfg: Arc<Config>,
        csi: Arc<CsiBuffer>,
        beams: Arc<BeamMatrixBuffer>,
        stats: Arc<PhyStats>,
    ) -> Self {
        Self {
            cfg,
            csi,
            beams,
            stats,
        }
    }

    pub fn launch(&mut self, tag: Tag) -> Result<EventData, PhyError> {
        let cfg = &self.cfg;
        let frame = tag.frame();
        let beam_id = tag.block() as usize;
        let slot = frame.slot(cfg.frame_wnd);

        // The channel is sampled at the base subcarrier of the beam group
        let base_sc = beam_id * cfg.beam_group_size();
        let b_tr = cfg.transpose_block_size;
        let ants = cfg.bs_ant_num;
        let block_base = (base_sc / b_tr) * (b_tr * ants) + base_sc % b_tr;

        let h = Array2::from_shape_fn((ants, cfg.spatial_streams), |(a, u)| {
            // SAFETY: all pilot FFT completions precede beam dispatch; the
            // CSI slab for this slot has no remaining writer.
            unsafe { self.csi.slab(slot, u).slice(block_base + a * b_tr, 1)[0] }
        });

        let (w, outcome) = compute_ul_beam(&h);
        if outcome == BeamOutcome::Singular {
            warn!(
                "singular CSI at frame {}, beam {}: using pseudo-inverse",
                frame.0, beam_id
            );
            self.stats.increment_beam_singular();
        }

        let slab = self.beams.slab(slot, beam_id);
        // SAFETY: one beam item exists per (frame, beam id); equalize reads
        // only after the completion event round-trips the scheduler.
        let out = unsafe { slab.slice_mut(0, slab.len()) };
        for s in 0..cfg.spatial_streams {
            for a in 0..ants {
                out[s * ants + a] = w[[s, a]];
            }
        }

        Ok(EventData::new(EventType::Beam, tag))
    }
}
