//! Modulation Tables and Demodulators
//!
//! Gray-mapped QPSK / 16-QAM / 64-QAM with the per-axis bit layout used on
//! the uplink: even bits select the I axis, odd bits the Q axis, LSB first.
//! Demodulation is selectable between hard decisions (saturated ±127) and
//! per-bit max-log LLRs; both write `M` signed values per subcarrier.

use common::types::Modulation;
use num_complex::Complex32;

const QPSK_NORM: f32 = std::f32::consts::SQRT_2;
const QAM16_NORM: f32 = 3.162_277_7; // sqrt(10)
const QAM64_NORM: f32 = 6.480_741; // sqrt(42)

/// LLR quantization: one constellation level step maps to 8 counts
const LLR_UNIT: f32 = 8.0;

/// One modulation order's mapping and demapping tables
pub struct Constellation {
    order: Modulation,
    bits: usize,
    points: Vec<Complex32>,
}

impl Constellation {
    pub fn new(order: Modulation) -> Self {
        let bits = order.bits_per_symbol();
        let points = (0..1u16 << bits)
            .map(|sym| Self::map_symbol(order, sym as u8))
            .collect();
        Self { order, bits, points }
    }

    pub fn order(&self) -> Modulation {
        self.order
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.bits
    }

    /// Constellation point of a symbol index
    pub fn map(&self, sym: u8) -> Complex32 {
        self.points[sym as usize]
    }

    fn map_symbol(order: Modulation, sym: u8) -> Complex32 {
        let b = |k: u8| (sym >> k) & 1;
        let sgn = |bit: u8| 1.0 - 2.0 * bit as f32;
        match order {
            Modulation::Qpsk => {
                Complex32::new(sgn(b(0)) / QPSK_NORM, sgn(b(1)) / QPSK_NORM)
            }
            Modulation::Qam16 => Complex32::new(
                sgn(b(0)) * (2.0 - sgn(b(2))) / QAM16_NORM,
                sgn(b(1)) * (2.0 - sgn(b(3))) / QAM16_NORM,
            ),
            Modulation::Qam64 => Complex32::new(
                sgn(b(0)) * (4.0 - sgn(b(2)) * (2.0 - sgn(b(4)))) / QAM64_NORM,
                sgn(b(1)) * (4.0 - sgn(b(3)) * (2.0 - sgn(b(5)))) / QAM64_NORM,
            ),
        }
    }

    /// Nearest symbol index by per-axis slicing (Gray mapping makes the
    /// axes independent)
    pub fn hard_symbol(&self, y: Complex32) -> u8 {
        let (i_bits, q_bits) = match self.order {
            Modulation::Qpsk => (slice_axis_1(y.re * QPSK_NORM), slice_axis_1(y.im * QPSK_NORM)),
            Modulation::Qam16 => (slice_axis_2(y.re * QAM16_NORM), slice_axis_2(y.im * QAM16_NORM)),
            Modulation::Qam64 => (slice_axis_3(y.re * QAM64_NORM), slice_axis_3(y.im * QAM64_NORM)),
        };
        // Interleave: even bits from I, odd bits from Q
        let mut sym = 0u8;
        for k in 0..(self.bits / 2) as u8 {
            sym |= (((i_bits >> k) & 1) << (2 * k)) | (((q_bits >> k) & 1) << (2 * k + 1));
        }
        sym
    }

    /// Demodulate a run of equalized samples, `M` outputs per sample.
    /// Positive values vote for bit 0.
    pub fn demodulate(&self, syms: &[Complex32], out: &mut [i8], hard: bool) {
        debug_assert_eq!(out.len(), syms.len() * self.bits);
        if hard {
            for (k, &y) in syms.iter().enumerate() {
                let sym = self.hard_symbol(y);
                for b in 0..self.bits {
                    out[k * self.bits + b] = if (sym >> b) & 1 == 1 { -127 } else { 127 };
                }
            }
        } else {
            for (k, &y) in syms.iter().enumerate() {
                self.soft_bits(y, &mut out[k * self.bits..(k + 1) * self.bits]);
            }
        }
    }

    fn soft_bits(&self, y: Complex32, out: &mut [i8]) {
        match self.order {
            Modulation::Qpsk => {
                out[0] = quantize(y.re * QPSK_NORM);
                out[1] = quantize(y.im * QPSK_NORM);
            }
            Modulation::Qam16 => {
                let li = y.re * QAM16_NORM;
                let lq = y.im * QAM16_NORM;
                out[0] = quantize(li);
                out[1] = quantize(lq);
                out[2] = quantize(2.0 - li.abs());
                out[3] = quantize(2.0 - lq.abs());
            }
            Modulation::Qam64 => {
                let li = y.re * QAM64_NORM;
                let lq = y.im * QAM64_NORM;
                out[0] = quantize(li);
                out[1] = quantize(lq);
                out[2] = quantize(4.0 - li.abs());
                out[3] = quantize(4.0 - lq.abs());
                out[4] = quantize(2.0 - (li.abs() - 4.0).abs());
                out[5] = quantize(2.0 - (lq.abs() - 4.0).abs());
            }
        }
    }
}

fn quantize(metric: f32) -> i8 {
    (metric * LLR_UNIT).round().clamp(-127.0, 127.0) as i8
}

/// One-bit axis: sign only
fn slice_axis_1(level: f32) -> u8 {
    (level < 0.0) as u8
}

/// Two-bit axis, levels {1, 3}
fn slice_axis_2(level: f32) -> u8 {
    let b0 = (level < 0.0) as u8;
    let b1 = (level.abs() > 2.0) as u8;
    b0 | (b1 << 1)
}

/// Three-bit axis, levels {1, 3, 5, 7}
fn slice_axis_3(level: f32) -> u8 {
    let mag = level.abs();
    let b0 = (level < 0.0) as u8;
    let b1 = (mag > 4.0) as u8;
    let b2 = ((mag - 4.0).abs() > 2.0) as u8;
    b0 | (b1 << 1) | (b2 << 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_orders() -> [Constellation; 3] {
        [
            Constellation::new(Modulation::Qpsk),
            Constellation::new(Modulation::Qam16),
            Constellation::new(Modulation::Qam64),
        ]
    }

    #[test]
    fn test_unit_average_power() {
        for c in all_orders() {
            let n = 1usize << c.bits_per_symbol();
            let power: f32 =
                (0..n).map(|s| c.map(s as u8).norm_sqr()).sum::<f32>() / n as f32;
            assert!(
                (power - 1.0).abs() < 1e-5,
                "{:?} average power {}",
                c.order(),
                power
            );
        }
    }

    #[test]
    fn test_hard_roundtrip_every_symbol() {
        for c in all_orders() {
            for sym in 0..1u16 << c.bits_per_symbol() {
                let y = c.map(sym as u8);
                assert_eq!(c.hard_symbol(y), sym as u8, "{:?} symbol {}", c.order(), sym);
            }
        }
    }

    #[test]
    fn test_hard_decision_noise_tolerance() {
        let c = Constellation::new(Modulation::Qam16);
        for sym in 0..16u8 {
            let y = c.map(sym) + Complex32::new(0.03, -0.02);
            assert_eq!(c.hard_symbol(y), sym);
        }
    }

    #[test]
    fn test_soft_sign_matches_hard_bits() {
        for c in all_orders() {
            let m = c.bits_per_symbol();
            let mut soft = vec![0i8; m];
            let mut hard = vec![0i8; m];
            for sym in 0..1u16 << m {
                let y = [c.map(sym as u8)];
                c.demodulate(&y, &mut soft, false);
                c.demodulate(&y, &mut hard, true);
                for b in 0..m {
                    assert_eq!(
                        soft[b] < 0,
                        hard[b] < 0,
                        "{:?} symbol {} bit {}",
                        c.order(),
                        sym,
                        b
                    );
                    assert_ne!(soft[b], 0, "LLR must not be zero at a constellation point");
                }
            }
        }
    }

    #[test]
    fn test_demodulate_block_layout() {
        let c = Constellation::new(Modulation::Qpsk);
        let syms = [c.map(0b00), c.map(0b11)];
        let mut out = [0i8; 4];
        c.demodulate(&syms, &mut out, true);
        assert_eq!(out, [127, 127, -127, -127]);
    }
}
