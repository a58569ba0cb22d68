//! Uplink Baseband Processing Library
//!
//! Frequency-domain PHY pipeline for a software massive-MIMO base station:
//! FFT/CSI estimation, zero-forcing beam-matrix computation, per-subcarrier
//! equalization and demodulation, and channel decoding, orchestrated by a
//! single coordinator dispatching sub-block work items to worker threads
//! over lock-free queues.

pub mod beam;
pub mod buffers;
pub mod config;
pub mod decode;
pub mod equalize;
pub mod fft;
pub mod ldpc;
pub mod linalg;
pub mod message;
pub mod modulation;
pub mod pipeline;
pub mod rx;
pub mod scheduler;
pub mod stats;
pub mod worker;

use thiserror::Error;

// Re-export commonly used types
pub use config::{Config, GroundTruth, SymbolType};
pub use ldpc::{LdpcParams, SystematicLdpc, UplinkCodec};
pub use pipeline::UplinkPipeline;
pub use scheduler::RetiredFrame;
pub use stats::PhyStats;

/// Errors raised by the uplink baseband pipeline
#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Schedule error at frame {frame}, symbol {symbol}: {detail}")]
    Schedule {
        frame: u32,
        symbol: u16,
        detail: String,
    },

    #[error("Queue full after retry budget: {0}")]
    QueueFull(&'static str),

    #[error("Unsupported modulation order: {0} bits")]
    UnsupportedModulation(u8),

    #[error("No combine kernel for {0} spatial streams")]
    UnsupportedStreamCount(usize),

    #[error("Back-pressure: frame {frame} slot not retired")]
    Backpressure { frame: u32 },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Pipeline shut down")]
    ShutDown,
}
