//! Ingress Packet Boundary
//!
//! Raw IQ packets land here: a fixed header
//! `{frame_id: u32, symbol_id: u16, ant_id: u16}` (little endian) followed
//! by `samps_per_symbol` complex samples, either 16-bit native or 12-bit
//! packed. The socket buffer is a `[ingress_thread][slot]` grid of packet
//! slots with an atomic occupancy flag per slot; the FFT stage frees a slot
//! by storing zero once it has dispatched the symbol.

use crate::buffers::SharedSlab;
use crate::PhyError;
use common::types::{AntennaId, FrameId, SymbolId};
use num_complex::Complex32;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Header bytes preceding the IQ payload
pub const HEADER_LEN: usize = 8;

const I16_SCALE: f32 = 1.0 / 32768.0;
const I12_SCALE: f32 = 1.0 / 2048.0;

/// Parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame: FrameId,
    pub symbol: SymbolId,
    pub antenna: AntennaId,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, PhyError> {
        if bytes.len() < HEADER_LEN {
            return Err(PhyError::MalformedPacket(format!(
                "{} bytes, need at least {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        Ok(Self {
            frame: FrameId(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            symbol: SymbolId(u16::from_le_bytes([bytes[4], bytes[5]])),
            antenna: AntennaId(u16::from_le_bytes([bytes[6], bytes[7]])),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.frame.0.to_le_bytes());
        out[4..6].copy_from_slice(&self.symbol.0.to_le_bytes());
        out[6..8].copy_from_slice(&self.antenna.0.to_le_bytes());
    }
}

/// Build a full packet with 16-bit native IQ samples
pub fn encode_packet(header: PacketHeader, iq: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN + iq.len() * 2];
    header.write(&mut out);
    for (k, v) in iq.iter().enumerate() {
        out[HEADER_LEN + 2 * k..HEADER_LEN + 2 * k + 2].copy_from_slice(&v.to_le_bytes());
    }
    out
}

/// Build a full packet with 12-bit packed IQ samples. Each complex sample
/// occupies three bytes: `i` in the low 12 bits, `q` in the high 12.
pub fn encode_packet_12bit(header: PacketHeader, iq: &[i16]) -> Vec<u8> {
    debug_assert!(iq.len() % 2 == 0);
    let mut out = vec![0u8; HEADER_LEN + (iq.len() / 2) * 3];
    header.write(&mut out);
    for (k, pair) in iq.chunks_exact(2).enumerate() {
        let i12 = (pair[0] >> 4) as u16 & 0x0FFF;
        let q12 = (pair[1] >> 4) as u16 & 0x0FFF;
        let base = HEADER_LEN + 3 * k;
        out[base] = (i12 & 0xFF) as u8;
        out[base + 1] = ((i12 >> 8) as u8 & 0x0F) | (((q12 & 0x0F) as u8) << 4);
        out[base + 2] = (q12 >> 4) as u8;
    }
    out
}

/// Decode `out.len()` complex samples from a packet payload, skipping
/// `skip` leading samples (the symbol-class zero prefix).
pub fn decode_iq(payload: &[u8], twelve_bit: bool, skip: usize, out: &mut [Complex32]) {
    if twelve_bit {
        for (k, dst) in out.iter_mut().enumerate() {
            let base = (skip + k) * 3;
            let b0 = payload[base] as u16;
            let b1 = payload[base + 1] as u16;
            let b2 = payload[base + 2] as u16;
            let i12 = b0 | ((b1 & 0x0F) << 8);
            let q12 = (b1 >> 4) | (b2 << 4);
            *dst = Complex32::new(
                sign_extend_12(i12) as f32 * I12_SCALE,
                sign_extend_12(q12) as f32 * I12_SCALE,
            );
        }
    } else {
        for (k, dst) in out.iter_mut().enumerate() {
            let base = (skip + k) * 4;
            let i = i16::from_le_bytes([payload[base], payload[base + 1]]);
            let q = i16::from_le_bytes([payload[base + 2], payload[base + 3]]);
            *dst = Complex32::new(i as f32 * I16_SCALE, q as f32 * I16_SCALE);
        }
    }
}

fn sign_extend_12(v: u16) -> i16 {
    ((v << 4) as i16) >> 4
}

/// `[ingress_thread][slot]` packet storage with atomic occupancy flags
pub struct RxSocketBuffer {
    data: Vec<SharedSlab<u8>>,
    status: Vec<AtomicU8>,
    cursor: Vec<AtomicUsize>,
    packet_len: usize,
    slots_per_thread: usize,
}

const SLOT_FREE: u8 = 0;
const SLOT_BUSY: u8 = 1;

impl RxSocketBuffer {
    pub fn new(ingress_threads: usize, slots_per_thread: usize, packet_len: usize) -> Self {
        Self {
            data: (0..ingress_threads)
                .map(|_| SharedSlab::new(slots_per_thread * packet_len))
                .collect(),
            status: (0..ingress_threads * slots_per_thread)
                .map(|_| AtomicU8::new(SLOT_FREE))
                .collect(),
            cursor: (0..ingress_threads).map(|_| AtomicUsize::new(0)).collect(),
            packet_len,
            slots_per_thread,
        }
    }

    /// Claim a free slot on an ingress thread, or None when all are busy
    pub fn try_claim(&self, thread: usize) -> Option<usize> {
        let start = self.cursor[thread].fetch_add(1, Ordering::Relaxed) % self.slots_per_thread;
        for i in 0..self.slots_per_thread {
            let slot = (start + i) % self.slots_per_thread;
            let flag = &self.status[thread * self.slots_per_thread + slot];
            if flag
                .compare_exchange(SLOT_FREE, SLOT_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(slot);
            }
        }
        None
    }

    /// Writable view of a claimed slot.
    ///
    /// # Safety
    /// The caller must have claimed `slot` via [`try_claim`] and not yet
    /// published the corresponding rx event.
    pub unsafe fn packet_mut(&self, thread: usize, slot: usize) -> &mut [u8] {
        self.data[thread].slice_mut(slot * self.packet_len, self.packet_len)
    }

    /// Read view of a filled slot.
    ///
    /// # Safety
    /// The caller must hold the rx work descriptor for this slot.
    pub unsafe fn packet(&self, thread: usize, slot: usize) -> &[u8] {
        self.data[thread].slice(slot * self.packet_len, self.packet_len)
    }

    /// Mark the slot free again (atomic store of zero)
    pub fn release(&self, thread: usize, slot: usize) {
        self.status[thread * self.slots_per_thread + slot].store(SLOT_FREE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = PacketHeader {
            frame: FrameId(123456),
            symbol: SymbolId(17),
            antenna: AntennaId(63),
        };
        let mut bytes = [0u8; HEADER_LEN];
        hdr.write(&mut bytes);
        assert_eq!(PacketHeader::parse(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(PacketHeader::parse(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_decode_16bit_with_prefix_skip() {
        let hdr = PacketHeader {
            frame: FrameId(0),
            symbol: SymbolId(0),
            antenna: AntennaId(0),
        };
        // Two prefix samples then one data sample
        let iq: Vec<i16> = vec![0, 0, 0, 0, 16384, -8192];
        let pkt = encode_packet(hdr, &iq);
        let mut out = [Complex32::new(0.0, 0.0); 1];
        decode_iq(&pkt[HEADER_LEN..], false, 2, &mut out);
        assert!((out[0].re - 0.5).abs() < 1e-6);
        assert!((out[0].im + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_decode_12bit_matches_16bit_to_quantization() {
        let hdr = PacketHeader {
            frame: FrameId(0),
            symbol: SymbolId(0),
            antenna: AntennaId(0),
        };
        let iq: Vec<i16> = vec![16384, -8192, -32768, 32752];
        let wide = encode_packet(hdr, &iq);
        let packed = encode_packet_12bit(hdr, &iq);

        let mut a = [Complex32::new(0.0, 0.0); 2];
        let mut b = [Complex32::new(0.0, 0.0); 2];
        decode_iq(&wide[HEADER_LEN..], false, 0, &mut a);
        decode_iq(&packed[HEADER_LEN..], true, 0, &mut b);
        for (x, y) in a.iter().zip(b.iter()) {
            // 12-bit quantization step is 1/2048
            assert!((x.re - y.re).abs() < 1.0 / 2048.0);
            assert!((x.im - y.im).abs() < 1.0 / 2048.0);
        }
    }

    #[test]
    fn test_slot_claim_release_cycle() {
        let buf = RxSocketBuffer::new(1, 2, 64);
        let a = buf.try_claim(0).unwrap();
        let b = buf.try_claim(0).unwrap();
        assert_ne!(a, b);
        assert!(buf.try_claim(0).is_none());
        buf.release(0, a);
        assert_eq!(buf.try_claim(0), Some(a));
    }
}
