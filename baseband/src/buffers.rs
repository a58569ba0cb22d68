//! Ring-Window Intermediate Storage
//!
//! Every buffer here is a flat array of slabs keyed by `frame_id mod W`.
//! A slab is reused only after the scheduler retires the frame that owned
//! it, and while a stage holds a work descriptor it has exclusive write
//! access to the `(frame, symbol, subcarrier-range)` slice the descriptor
//! names. That dispatch discipline, not a lock, is what makes the
//! `SharedSlab` accessors sound: writers of one slab never overlap, and
//! readers only run after the scheduler has observed the writer's
//! completion event (the queues' release/acquire pairs establish the
//! happens-before edge).

use crate::config::Config;
use num_complex::Complex32;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Flat storage cell allowing disjoint concurrent writes coordinated by the
/// scheduler.
pub struct SharedSlab<T> {
    data: Box<[UnsafeCell<T>]>,
}

// Sound per the dispatch discipline documented at module level.
unsafe impl<T: Send> Sync for SharedSlab<T> {}

impl<T: Copy + Default> SharedSlab<T> {
    pub fn new(len: usize) -> Self {
        Self {
            data: (0..len).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of `[start, start + len)`.
    ///
    /// # Safety
    /// No stage may be writing any element of the range; the caller's work
    /// descriptor must be downstream of the writer's completion event.
    pub unsafe fn slice(&self, start: usize, len: usize) -> &[T] {
        debug_assert!(start + len <= self.data.len());
        std::slice::from_raw_parts(self.data[start].get(), len)
    }

    /// Mutable view of `[start, start + len)`.
    ///
    /// # Safety
    /// The caller must hold the only dispatch covering the range, and no
    /// reader may observe it until the completion event is posted.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, start: usize, len: usize) -> &mut [T] {
        debug_assert!(start + len <= self.data.len());
        std::slice::from_raw_parts_mut(self.data[start].get(), len)
    }
}

/// f32 cell with atomic load/store and CAS add
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    pub fn fetch_add(&self, v: f32) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(cur) + v).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Uplink symbol samples in partially transposed layout:
/// `slab[(block * B_tr * A) + (ant * B_tr) + sc_in_block]`, one slab per
/// `(frame mod W, uplink symbol)`. Written by FFT, read by equalize.
pub struct DataBuffer {
    slabs: Vec<SharedSlab<Complex32>>,
    ul_symbols: usize,
}

impl DataBuffer {
    pub fn new(cfg: &Config) -> Self {
        let slab_len = cfg.bs_ant_num * cfg.ofdm_data_num;
        let ul_symbols = cfg.ul_symbol_num();
        Self {
            slabs: (0..cfg.frame_wnd * ul_symbols)
                .map(|_| SharedSlab::new(slab_len))
                .collect(),
            ul_symbols,
        }
    }

    pub fn slab(&self, slot: usize, ul_sym: usize) -> &SharedSlab<Complex32> {
        &self.slabs[slot * self.ul_symbols + ul_sym]
    }
}

/// CSI estimates, same partial-transpose layout as `DataBuffer`, one slab
/// per `(frame mod W, ue)`. Written by FFT on pilot symbols (already
/// de-rotated), read by the beam builder.
pub struct CsiBuffer {
    slabs: Vec<SharedSlab<Complex32>>,
    ue_num: usize,
}

impl CsiBuffer {
    pub fn new(cfg: &Config) -> Self {
        let slab_len = cfg.bs_ant_num * cfg.ofdm_data_num;
        Self {
            slabs: (0..cfg.frame_wnd * cfg.ue_ant_num)
                .map(|_| SharedSlab::new(slab_len))
                .collect(),
            ue_num: cfg.ue_ant_num,
        }
    }

    pub fn slab(&self, slot: usize, ue: usize) -> &SharedSlab<Complex32> {
        &self.slabs[slot * self.ue_num + ue]
    }
}

/// Uplink beam matrices, row-major `S x A`, one slab per
/// `(frame mod W, beam sc id)`. Written by the beam builder, read by
/// equalize.
pub struct BeamMatrixBuffer {
    slabs: Vec<SharedSlab<Complex32>>,
    beam_blocks: usize,
}

impl BeamMatrixBuffer {
    pub fn new(cfg: &Config) -> Self {
        let slab_len = cfg.spatial_streams * cfg.bs_ant_num;
        Self {
            slabs: (0..cfg.frame_wnd * cfg.beam_block_num)
                .map(|_| SharedSlab::new(slab_len))
                .collect(),
            beam_blocks: cfg.beam_block_num,
        }
    }

    pub fn slab(&self, slot: usize, beam_sc_id: usize) -> &SharedSlab<Complex32> {
        &self.slabs[slot * self.beam_blocks + beam_sc_id]
    }
}

/// Equalized samples kept for constellation export, layout `sc * S + s`,
/// one slab per `(frame mod W, uplink symbol)`.
pub struct EqualBuffer {
    slabs: Vec<SharedSlab<Complex32>>,
    ul_symbols: usize,
}

impl EqualBuffer {
    pub fn new(cfg: &Config) -> Self {
        let slab_len = cfg.ofdm_data_num * cfg.spatial_streams;
        let ul_symbols = cfg.ul_symbol_num();
        Self {
            slabs: (0..cfg.frame_wnd * ul_symbols)
                .map(|_| SharedSlab::new(slab_len))
                .collect(),
            ul_symbols,
        }
    }

    pub fn slab(&self, slot: usize, ul_sym: usize) -> &SharedSlab<Complex32> {
        &self.slabs[slot * self.ul_symbols + ul_sym]
    }
}

/// Demodulated output, `M` signed values per subcarrier (LLRs, or saturated
/// hard decisions), one slab per `(frame mod W, uplink symbol, stream)`.
pub struct DemodBuffer {
    slabs: Vec<SharedSlab<i8>>,
    ul_symbols: usize,
    streams: usize,
}

impl DemodBuffer {
    pub fn new(cfg: &Config) -> Self {
        let slab_len = cfg.mod_order_bits() * cfg.ofdm_data_num;
        let ul_symbols = cfg.ul_symbol_num();
        Self {
            slabs: (0..cfg.frame_wnd * ul_symbols * cfg.spatial_streams)
                .map(|_| SharedSlab::new(slab_len))
                .collect(),
            ul_symbols,
            streams: cfg.spatial_streams,
        }
    }

    pub fn slab(&self, slot: usize, ul_sym: usize, stream: usize) -> &SharedSlab<i8> {
        &self.slabs[(slot * self.ul_symbols + ul_sym) * self.streams + stream]
    }
}

/// Decoded payload bytes, one slab per
/// `(frame mod W, uplink data symbol, stream)`.
pub struct DecodedBuffer {
    slabs: Vec<SharedSlab<u8>>,
    data_symbols: usize,
    streams: usize,
}

impl DecodedBuffer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            slabs: (0..cfg.frame_wnd * cfg.ul_data_symbols * cfg.spatial_streams)
                .map(|_| SharedSlab::new(cfg.decoded_bytes()))
                .collect(),
            data_symbols: cfg.ul_data_symbols,
            streams: cfg.spatial_streams,
        }
    }

    pub fn slab(&self, slot: usize, data_sym: usize, stream: usize) -> &SharedSlab<u8> {
        &self.slabs[(slot * self.data_symbols + data_sym) * self.streams + stream]
    }
}

/// Running pilot correlation per `(frame mod W, pilot symbol, stream)`.
/// Concurrent equalize blocks of one pilot symbol accumulate into the same
/// cells, so the components are CAS-add atomics; per-component addition
/// commutes, which keeps the final sum exact regardless of interleaving.
pub struct PhaseBuffer {
    re: Vec<AtomicF32>,
    im: Vec<AtomicF32>,
    pilots: usize,
    streams: usize,
}

impl PhaseBuffer {
    pub fn new(cfg: &Config) -> Self {
        let per_slot = cfg.ul_pilot_symbols * cfg.spatial_streams;
        let len = cfg.frame_wnd * per_slot.max(1);
        Self {
            re: (0..len).map(|_| AtomicF32::default()).collect(),
            im: (0..len).map(|_| AtomicF32::default()).collect(),
            pilots: cfg.ul_pilot_symbols,
            streams: cfg.spatial_streams,
        }
    }

    fn index(&self, slot: usize, pilot_idx: usize, stream: usize) -> usize {
        (slot * self.pilots + pilot_idx) * self.streams + stream
    }

    pub fn add(&self, slot: usize, pilot_idx: usize, stream: usize, v: Complex32) {
        let i = self.index(slot, pilot_idx, stream);
        self.re[i].fetch_add(v.re);
        self.im[i].fetch_add(v.im);
    }

    pub fn read(&self, slot: usize, pilot_idx: usize, stream: usize) -> Complex32 {
        let i = self.index(slot, pilot_idx, stream);
        Complex32::new(self.re[i].load(), self.im[i].load())
    }

    /// Zero one frame slot (the lazy previous-frame reset)
    pub fn reset_slot(&self, slot: usize) {
        let per_slot = self.pilots * self.streams;
        for i in slot * per_slot..(slot + 1) * per_slot {
            self.re[i].store(0.0);
            self.im[i].store(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_shared_slab_disjoint_concurrent_writes() {
        let slab = Arc::new(SharedSlab::<u32>::new(4096));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let slab = Arc::clone(&slab);
            handles.push(std::thread::spawn(move || {
                // Each thread owns a disjoint quarter
                let region = unsafe { slab.slice_mut(t as usize * 1024, 1024) };
                for (i, v) in region.iter_mut().enumerate() {
                    *v = t * 1024 + i as u32;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let all = unsafe { slab.slice(0, 4096) };
        for (i, &v) in all.iter().enumerate() {
            assert_eq!(v, i as u32);
        }
    }

    #[test]
    fn test_atomic_f32_concurrent_adds() {
        let acc = Arc::new(AtomicF32::default());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let acc = Arc::clone(&acc);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    acc.fetch_add(1.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(acc.load(), 4000.0);
    }

    #[test]
    fn test_phase_buffer_accumulate_and_reset() {
        let cfg = crate::config::tests_support::small_config();
        let phase = PhaseBuffer::new(&cfg);
        phase.add(1, 0, 0, Complex32::new(0.5, -0.25));
        phase.add(1, 0, 0, Complex32::new(0.5, 0.75));
        let v = phase.read(1, 0, 0);
        assert!((v.re - 1.0).abs() < 1e-6);
        assert!((v.im - 0.5).abs() < 1e-6);

        phase.reset_slot(1);
        let v = phase.read(1, 0, 0);
        assert_eq!(v, Complex32::new(0.0, 0.0));
    }
}
