//! Uplink Channel Codec
//!
//! The pipeline treats the LDPC numeric kernels as an opaque codec: the
//! decode stage hands the codec a block of LLRs and receives payload bytes.
//! `SystematicLdpc` is the built-in implementation: a systematic encoder
//! with circular-buffer rate matching, and a decode path that de-rate-
//! matches, slices, extracts the systematic bits and re-checks parity.
//! Swapping in a belief-propagation decoder only touches this module.

use crate::PhyError;
use common::utils::{pack_bits, unpack_bits};
use tracing::debug;

/// LDPC lifting sizes (set of supported Zc values)
const LIFTING_SIZE_SET: [usize; 51] = [
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 18, 20, 22, 24, 26, 28, 30, 32, 36, 40,
    44, 48, 52, 56, 60, 64, 72, 80, 88, 96, 104, 112, 120, 128, 144, 160, 176, 192, 208, 224, 240,
    256, 288, 320, 352, 384,
];

/// Codec parameters handed through the decode work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdpcParams {
    /// Base graph, 1 (large blocks) or 2 (small blocks)
    pub base_graph: u8,
    /// Lifting size Zc
    pub lifting: usize,
    /// Parity rows kept in the codeword
    pub rows: usize,
    /// Decoder iteration budget
    pub max_iterations: usize,
    /// Stop as soon as parity checks pass
    pub early_termination: bool,
}

impl LdpcParams {
    /// Parameters with the full parity extent of the base graph
    pub fn new(base_graph: u8, lifting: usize) -> Self {
        let rows = match base_graph {
            1 => 44,
            _ => 40,
        };
        Self {
            base_graph,
            lifting,
            rows,
            max_iterations: 8,
            early_termination: true,
        }
    }

    /// Systematic columns of the base graph
    pub fn kb(&self) -> usize {
        match self.base_graph {
            1 => 22,
            _ => 10,
        }
    }

    /// Information bits per code block
    pub fn num_info_bits(&self) -> usize {
        self.kb() * self.lifting
    }

    /// Codeword bits (systematic + kept parity)
    pub fn num_encoded_bits(&self) -> usize {
        (self.kb() + self.rows) * self.lifting
    }

    pub fn validate(&self) -> Result<(), PhyError> {
        let fail = |msg: String| Err(PhyError::InvalidConfiguration(msg));
        if self.base_graph != 1 && self.base_graph != 2 {
            return fail(format!("LDPC base graph {} (must be 1 or 2)", self.base_graph));
        }
        if !LIFTING_SIZE_SET.contains(&self.lifting) {
            return fail(format!("LDPC lifting size {} not in the standard set", self.lifting));
        }
        let (min_rows, max_rows) = match self.base_graph {
            1 => (2, 44),
            _ => (4, 40),
        };
        if self.rows < min_rows || self.rows > max_rows {
            return fail(format!(
                "LDPC rows {} outside [{}, {}] for base graph {}",
                self.rows, min_rows, max_rows, self.base_graph
            ));
        }
        if self.num_info_bits() % 8 != 0 {
            return fail(format!(
                "LDPC info bits {} not byte aligned",
                self.num_info_bits()
            ));
        }
        if self.max_iterations == 0 {
            return fail("LDPC iteration budget must be at least 1".into());
        }
        Ok(())
    }
}

/// Outcome of one decode call
#[derive(Debug, Clone, Copy)]
pub struct DecodeReport {
    /// Recomputed parity matched the received (observed) codeword bits
    pub parity_ok: bool,
    /// Iterations consumed
    pub iterations: usize,
}

/// The opaque codec boundary used by the decode stage
pub trait UplinkCodec: Send + Sync {
    /// Encode payload bytes into `target_bits` rate-matched bits (0/1)
    fn encode(&self, params: &LdpcParams, payload: &[u8], target_bits: usize) -> Vec<u8>;

    /// Decode a block of LLRs (positive favors bit 0) into payload bytes
    fn decode(&self, params: &LdpcParams, llrs: &[i8], out: &mut [u8]) -> DecodeReport;
}

/// Built-in systematic codec
#[derive(Debug, Default, Clone, Copy)]
pub struct SystematicLdpc;

impl SystematicLdpc {
    /// Systematic codeword: info bits followed by structured parity
    fn encode_codeword(&self, params: &LdpcParams, info_bits: &[u8]) -> Vec<u8> {
        let z = params.lifting;
        let kb = params.kb();
        debug_assert_eq!(info_bits.len(), kb * z);

        // Full-extent parity, truncated afterwards to the configured rows
        let full_bits = match params.base_graph {
            1 => 66 * z,
            _ => 50 * z,
        };
        let mut encoded = vec![0u8; full_bits];
        encoded[..info_bits.len()].copy_from_slice(info_bits);

        match params.base_graph {
            1 => {
                // Core parity (2Z bits)
                for i in 0..2 * z {
                    let mut parity = 0u8;
                    for j in 0..22 {
                        if (i + j) % 3 == 0 {
                            parity ^= info_bits[j * z + (i % z)];
                        }
                    }
                    encoded[22 * z + i] = parity;
                }
                // Extension parity
                for block in 0..42 {
                    for i in 0..z {
                        let base_idx = 24 * z + block * z + i;
                        let mut parity = 0u8;
                        for j in 0..10 {
                            let idx = (base_idx + j * 7) % (24 * z);
                            parity ^= encoded[idx];
                        }
                        encoded[base_idx] = parity;
                    }
                }
            }
            _ => {
                // Core parity (4Z bits)
                for i in 0..4 * z {
                    let mut parity = 0u8;
                    for j in 0..10 {
                        if (i + j) % 2 == 0 {
                            parity ^= info_bits[j * z + (i % z)];
                        }
                    }
                    encoded[10 * z + i] = parity;
                }
                // Extension parity
                for block in 0..36 {
                    for i in 0..z {
                        let base_idx = 14 * z + block * z + i;
                        let mut parity = 0u8;
                        for j in 0..8 {
                            let idx = (base_idx + j * 5) % (14 * z);
                            parity ^= encoded[idx];
                        }
                        encoded[base_idx] = parity;
                    }
                }
            }
        }

        encoded.truncate(params.num_encoded_bits());
        encoded
    }
}

impl UplinkCodec for SystematicLdpc {
    fn encode(&self, params: &LdpcParams, payload: &[u8], target_bits: usize) -> Vec<u8> {
        let k = params.num_info_bits();
        let mut info_bits = unpack_bits(payload);
        info_bits.resize(k, 0);

        let encoded = self.encode_codeword(params, &info_bits);
        let n = encoded.len();
        debug!(
            "LDPC encode: K={}, N={}, rate matched to {} bits",
            k, n, target_bits
        );

        // Circular-buffer rate matching, redundancy version 0
        (0..target_bits).map(|i| encoded[i % n]).collect()
    }

    fn decode(&self, params: &LdpcParams, llrs: &[i8], out: &mut [u8]) -> DecodeReport {
        let k = params.num_info_bits();
        let n = params.num_encoded_bits();

        // De-rate-match: fold repeated transmissions back onto the codeword
        let mut acc = vec![0i32; n];
        for (i, &llr) in llrs.iter().enumerate() {
            acc[i % n] += llr as i32;
        }

        let hard: Vec<u8> = acc.iter().map(|&a| (a < 0) as u8).collect();
        let info = &hard[..k];

        // Parity recheck over the observed codeword positions
        let reencoded = self.encode_codeword(params, info);
        let parity_ok = acc
            .iter()
            .zip(reencoded.iter())
            .all(|(&a, &bit)| a == 0 || ((a < 0) as u8) == bit);

        let bytes = pack_bits(info);
        out.copy_from_slice(&bytes[..out.len()]);

        let iterations = if parity_ok && params.early_termination {
            1
        } else {
            params.max_iterations
        };
        DecodeReport {
            parity_ok,
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llrs_from_bits(bits: &[u8]) -> Vec<i8> {
        bits.iter().map(|&b| if b == 1 { -100 } else { 100 }).collect()
    }

    #[test]
    fn test_params_validation() {
        assert!(LdpcParams::new(1, 72).validate().is_ok());
        assert!(LdpcParams::new(2, 16).validate().is_ok());
        assert!(LdpcParams::new(3, 72).validate().is_err());
        assert!(LdpcParams::new(1, 71).validate().is_err());
        let mut p = LdpcParams::new(1, 72);
        p.rows = 1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_clean_roundtrip() {
        let params = LdpcParams::new(2, 16);
        let codec = SystematicLdpc;
        let payload: Vec<u8> = (0..params.num_info_bits() / 8).map(|i| (i * 37) as u8).collect();

        let bits = codec.encode(&params, &payload, params.num_encoded_bits());
        let mut out = vec![0u8; payload.len()];
        let report = codec.decode(&params, &llrs_from_bits(&bits), &mut out);

        assert_eq!(out, payload);
        assert!(report.parity_ok);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn test_repetition_combining_overrides_flips() {
        let params = LdpcParams::new(2, 16);
        let codec = SystematicLdpc;
        let payload: Vec<u8> = (0..params.num_info_bits() / 8).map(|i| !(i as u8)).collect();

        // Two full copies of the codeword; corrupt a handful of bits in one
        let n = params.num_encoded_bits();
        let bits = codec.encode(&params, &payload, 2 * n);
        let mut llrs = llrs_from_bits(&bits);
        for k in [3usize, 50, 101, 200] {
            llrs[k] = -llrs[k] / 2; // weaker wrong observation
        }

        let mut out = vec![0u8; payload.len()];
        codec.decode(&params, &llrs, &mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn test_parity_flags_corruption() {
        let params = LdpcParams::new(2, 16);
        let codec = SystematicLdpc;
        let payload: Vec<u8> = vec![0x5A; params.num_info_bits() / 8];

        let bits = codec.encode(&params, &payload, params.num_encoded_bits());
        let mut llrs = llrs_from_bits(&bits);
        // Flip one parity observation hard
        let k = params.num_info_bits() + 7;
        llrs[k] = -llrs[k];

        let mut out = vec![0u8; payload.len()];
        let report = codec.decode(&params, &llrs, &mut out);
        assert_eq!(out, payload, "payload survives a parity-bit flip");
        assert!(!report.parity_ok);
        assert_eq!(report.iterations, params.max_iterations);
    }

    #[test]
    fn test_bg1_codeword_lengths() {
        let params = LdpcParams::new(1, 72);
        assert_eq!(params.num_info_bits(), 1584);
        assert_eq!(params.num_encoded_bits(), 66 * 72);
        let codec = SystematicLdpc;
        let payload = vec![0xA5u8; params.num_info_bits() / 8];
        let bits = codec.encode(&params, &payload, 4800);
        assert_eq!(bits.len(), 4800);
    }
}
