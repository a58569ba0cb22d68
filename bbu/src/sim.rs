//! Built-in Uplink Traffic Generator
//!
//! Synthesizes the packet stream a radio front-end would deliver: pilot and
//! data symbols per UE, pushed through a configured channel, inverse FFT,
//! peak-normalized and quantized to the 16-bit (or 12-bit packed) wire
//! format. Content is deterministic per seed so decoded output can be
//! checked against the generated payloads.

use baseband::config::GroundTruth;
use baseband::ldpc::{SystematicLdpc, UplinkCodec};
use baseband::modulation::Constellation;
use baseband::rx::{self, PacketHeader};
use baseband::Config;
use common::types::{AntennaId, FrameId, SymbolId};
use ndarray::Array2;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::info;

/// Channel model between the UE antennas and the array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelProfile {
    /// Stream `s` arrives only at antenna `s`
    Identity,
    /// Random orthonormal columns
    RandomUnitary,
}

impl ChannelProfile {
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        match name {
            "identity" => Ok(Self::Identity),
            "unitary" => Ok(Self::RandomUnitary),
            other => Err(anyhow::anyhow!("unknown channel profile: {other}")),
        }
    }
}

pub struct UplinkSimulator {
    channel: Array2<Complex32>,
    payloads: Vec<Vec<u8>>,
    data_symbols: Vec<Vec<Complex32>>,
    mod_symbols: Vec<u8>,
    ifft: Arc<dyn Fft<f32>>,
}

impl UplinkSimulator {
    pub fn new(cfg: &Config, profile: ChannelProfile, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let channel = match profile {
            ChannelProfile::Identity => Array2::from_shape_fn(
                (cfg.bs_ant_num, cfg.ue_ant_num),
                |(a, u)| {
                    if a == u {
                        Complex32::new(1.0, 0.0)
                    } else {
                        Complex32::new(0.0, 0.0)
                    }
                },
            ),
            ChannelProfile::RandomUnitary => {
                random_unitary(&mut rng, cfg.bs_ant_num, cfg.ue_ant_num)
            }
        };

        // One payload per stream, reused across data symbols so the EVM
        // reference stays a single symbol
        let payloads: Vec<Vec<u8>> = (0..cfg.spatial_streams)
            .map(|_| (0..cfg.decoded_bytes()).map(|_| rng.gen()).collect())
            .collect();

        let codec = SystematicLdpc;
        let constellation = Constellation::new(cfg.modulation);
        let m = cfg.mod_order_bits();
        let n_d = cfg.ofdm_data_num;
        let mut data_symbols = Vec::with_capacity(cfg.spatial_streams);
        let mut mod_symbols = vec![0u8; cfg.spatial_streams * n_d];
        for (stream, payload) in payloads.iter().enumerate() {
            let bits = codec.encode(&cfg.ldpc, payload, m * n_d);
            let points = (0..n_d)
                .map(|sc| {
                    let sym = (0..m).fold(0u8, |acc, k| acc | (bits[sc * m + k] << k));
                    mod_symbols[stream * n_d + sc] = sym;
                    constellation.map(sym)
                })
                .collect();
            data_symbols.push(points);
        }

        info!(
            "simulator: {:?} channel, {} streams, {} payload bytes per block",
            profile,
            cfg.spatial_streams,
            cfg.decoded_bytes()
        );

        Self {
            channel,
            payloads,
            data_symbols,
            mod_symbols,
            ifft: FftPlanner::<f32>::new().plan_fft_inverse(cfg.ofdm_ca_num),
        }
    }

    pub fn payloads(&self) -> &[Vec<u8>] {
        &self.payloads
    }

    /// Ground-truth tables matching the generated traffic
    pub fn ground_truth(&self, cfg: &Config) -> GroundTruth {
        let n_d = cfg.ofdm_data_num;
        let s = cfg.spatial_streams;
        let mut mod_symbols = Vec::with_capacity(cfg.ul_data_symbols * s * n_d);
        let mut payload = Vec::new();
        for _ in 0..cfg.ul_data_symbols {
            mod_symbols.extend_from_slice(&self.mod_symbols);
            for p in &self.payloads {
                payload.extend_from_slice(p);
            }
        }
        let mut evm_reference = vec![Complex32::new(0.0, 0.0); s * n_d];
        for stream in 0..s {
            evm_reference[stream * n_d..(stream + 1) * n_d]
                .copy_from_slice(&self.data_symbols[stream]);
        }
        GroundTruth {
            mod_symbols,
            payload,
            evm_reference,
        }
    }

    /// All packets of one frame, symbol-major then antenna order
    pub fn frame_packets(&self, cfg: &Config, frame: FrameId) -> Vec<Vec<u8>> {
        let n_ca = cfg.ofdm_ca_num;
        let n_d = cfg.ofdm_data_num;
        let ants = cfg.bs_ant_num;
        let total_syms = cfg.total_symbols();

        let mut time = vec![vec![Complex32::new(0.0, 0.0); n_ca]; total_syms * ants];
        for sym_id in 0..total_syms {
            let tx = self.transmit_vector(cfg, sym_id);
            for ant in 0..ants {
                let buf = &mut time[sym_id * ants + ant];
                for sc in 0..n_d {
                    let mut acc = Complex32::new(0.0, 0.0);
                    for ue in 0..cfg.ue_ant_num {
                        acc += self.channel[[ant, ue]] * tx[ue * n_d + sc];
                    }
                    buf[cfg.ofdm_data_start + sc] = acc;
                }
                self.ifft.process(buf);
                let inv_n = 1.0 / n_ca as f32;
                for v in buf.iter_mut() {
                    *v *= inv_n;
                }
            }
        }

        // One gain per frame: pilots and data see the same scale, so the
        // zero-forcing combiner cancels it
        let peak = time
            .iter()
            .flat_map(|sym| sym.iter())
            .map(|v| v.re.abs().max(v.im.abs()))
            .fold(0.0f32, f32::max);
        let gain = 0.9 * 32767.0 / peak.max(1e-9);

        let mut packets = Vec::with_capacity(total_syms * ants);
        for sym_id in 0..total_syms {
            for ant in 0..ants {
                let mut iq = vec![0i16; cfg.samps_per_symbol * 2];
                for (k, v) in time[sym_id * ants + ant].iter().enumerate() {
                    let idx = (cfg.rx_zero_prefix + k) * 2;
                    iq[idx] = (v.re * gain).round() as i16;
                    iq[idx + 1] = (v.im * gain).round() as i16;
                }
                let header = PacketHeader {
                    frame,
                    symbol: SymbolId(sym_id as u16),
                    antenna: AntennaId(ant as u16),
                };
                packets.push(if cfg.twelve_bit_iq {
                    rx::encode_packet_12bit(header, &iq)
                } else {
                    rx::encode_packet(header, &iq)
                });
            }
        }
        packets
    }

    /// Frequency-domain transmit vector per UE antenna for one symbol
    fn transmit_vector(&self, cfg: &Config, sym_id: usize) -> Vec<Complex32> {
        let n_d = cfg.ofdm_data_num;
        let mut tx = vec![Complex32::new(0.0, 0.0); cfg.ue_ant_num * n_d];
        if sym_id < cfg.ue_ant_num {
            // Channel-sounding pilot: only this UE transmits
            for sc in 0..n_d {
                tx[sym_id * n_d + sc] = Complex32::new(cfg.pilot_sign[sc], 0.0);
            }
        } else {
            let idx = sym_id - cfg.ue_ant_num;
            for stream in 0..cfg.spatial_streams {
                for sc in 0..n_d {
                    tx[stream * n_d + sc] = if idx < cfg.ul_pilot_symbols {
                        cfg.ue_pilot(stream)[sc]
                    } else {
                        self.data_symbols[stream][sc]
                    };
                }
            }
        }
        tx
    }
}

/// Random channel with orthonormal columns (Gram-Schmidt)
fn random_unitary(rng: &mut StdRng, ants: usize, ues: usize) -> Array2<Complex32> {
    let mut h = Array2::from_shape_fn((ants, ues), |_| {
        Complex32::new(rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5)
    });
    for j in 0..ues {
        for prev in 0..j {
            let dot: Complex32 = (0..ants).map(|i| h[[i, prev]].conj() * h[[i, j]]).sum();
            for i in 0..ants {
                let sub = h[[i, prev]] * dot;
                h[[i, j]] -= sub;
            }
        }
        let norm: f32 = (0..ants).map(|i| h[[i, j]].norm_sqr()).sum::<f32>().sqrt();
        for i in 0..ants {
            h[[i, j]] /= norm;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unitary_columns_are_orthonormal() {
        let mut rng = StdRng::seed_from_u64(3);
        let h = random_unitary(&mut rng, 8, 3);
        for a in 0..3 {
            for b in 0..3 {
                let dot: Complex32 = (0..8).map(|i| h[[i, a]].conj() * h[[i, b]]).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!(
                    (dot - Complex32::new(expected, 0.0)).norm() < 1e-5,
                    "columns {a},{b}"
                );
            }
        }
    }

    #[test]
    fn test_generator_is_deterministic() {
        let cfg = test_cfg();
        let a = UplinkSimulator::new(&cfg, ChannelProfile::RandomUnitary, 9);
        let b = UplinkSimulator::new(&cfg, ChannelProfile::RandomUnitary, 9);
        assert_eq!(a.payloads, b.payloads);
        assert_eq!(
            a.frame_packets(&cfg, FrameId(0)),
            b.frame_packets(&cfg, FrameId(0))
        );
    }

    #[test]
    fn test_packet_count_and_length() {
        let cfg = test_cfg();
        let sim = UplinkSimulator::new(&cfg, ChannelProfile::Identity, 1);
        let packets = sim.frame_packets(&cfg, FrameId(4));
        assert_eq!(packets.len(), cfg.total_symbols() * cfg.bs_ant_num);
        for pkt in &packets {
            assert_eq!(pkt.len(), cfg.packet_len());
        }
    }

    fn test_cfg() -> Config {
        use baseband::ldpc::LdpcParams;
        use baseband::message::EventType;
        use common::types::Modulation;
        let n_d = 96;
        Config {
            ofdm_ca_num: 128,
            ofdm_data_num: n_d,
            ofdm_data_start: 16,
            bs_ant_num: 4,
            ue_ant_num: 2,
            spatial_streams: 2,
            frame_wnd: 4,
            transpose_block_size: 16,
            sc_per_cacheline: 8,
            demul_block_size: 48,
            beam_block_num: 12,
            ul_pilot_symbols: 1,
            ul_data_symbols: 1,
            cal_dl_symbol: None,
            cal_ul_symbol: None,
            modulation: Modulation::Qam16,
            hard_demod: true,
            export_constellation: false,
            samps_per_symbol: 192,
            rx_zero_prefix: 64,
            rx_zero_prefix_cal_dl: 64,
            rx_zero_prefix_cal_ul: 64,
            twelve_bit_iq: false,
            worker_threads: 1,
            stage_priority: [
                EventType::Fft,
                EventType::Beam,
                EventType::Equalize,
                EventType::Decode,
            ],
            queue_capacity: 256,
            ingress_threads: 1,
            rx_slots_per_thread: 32,
            frame_deadline: None,
            ldpc: LdpcParams::new(2, 16),
            pilot_sign: Config::generate_pilot_sign(1, n_d),
            ue_pilots: Config::generate_ue_pilots(2, 2, n_d),
            ground_truth: None,
        }
    }
}
