//! Common Types for the Uplink Baseband
//!
//! Defines fundamental identifiers used throughout the processing pipeline

use serde::{Deserialize, Serialize};

/// OFDM frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Create a new frame id
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Ring slot for a frame window of depth `wnd` (`wnd` is a power of two)
    pub fn slot(&self, wnd: usize) -> usize {
        self.0 as usize & (wnd - 1)
    }

    /// Frame preceding this one, wrapping at zero
    pub fn prev(&self) -> Self {
        Self(self.0.wrapping_sub(1))
    }
}

/// OFDM symbol index within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u16);

/// Base-station antenna index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AntennaId(pub u16);

/// User-equipment antenna index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UeId(pub u16);

/// Spatial stream index (stream `s` carries UE antenna `s` here)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u16);

/// Uplink modulation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    /// QPSK (2 bits per symbol)
    Qpsk,
    /// 16-QAM (4 bits per symbol)
    Qam16,
    /// 64-QAM (6 bits per symbol)
    Qam64,
}

impl Modulation {
    /// Bits carried per modulated subcarrier
    pub fn bits_per_symbol(&self) -> usize {
        match self {
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
        }
    }

    /// Look up a modulation by its bit count
    pub fn from_order_bits(bits: u8) -> Option<Self> {
        match bits {
            2 => Some(Modulation::Qpsk),
            4 => Some(Modulation::Qam16),
            6 => Some(Modulation::Qam64),
            _ => None,
        }
    }
}
