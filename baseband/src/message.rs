//! Work Descriptors and Task Queues
//!
//! A work item is a `(event type, tag)` pair. The tag packs the work
//! coordinates into one opaque 64-bit word: either `(frame, symbol, block)`
//! for pipeline stages or `(ingress thread, slot)` for received packets.
//! Descriptors circulate through bounded lock-free MPMC queues between the
//! coordinator and the workers; the same descriptor shape is reused for the
//! completion event a worker posts when a stage finishes.

use crate::PhyError;
use common::types::{FrameId, SymbolId};
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stage or notification carried by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A packet landed in the socket buffer (tag: ingress thread + slot)
    RxPacket,
    /// FFT/CSI stage (request tag: thread + slot; completion: frame + symbol)
    Fft,
    /// Beam-matrix stage (tag: frame + beam sc id in the block field)
    Beam,
    /// Equalize + demodulate stage (tag: frame + symbol + base subcarrier)
    Equalize,
    /// Decode stage (tag: frame + uplink data symbol + stream)
    Decode,
    /// A worker hit a non-recoverable error; coordinator shuts down
    WorkerError,
}

/// Opaque tag word: `frame:32 | symbol:16 | block:16`
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(u64);

impl Tag {
    /// Tag for `(frame, symbol, block)` stage coordinates
    pub fn frame_sym_block(frame: FrameId, symbol: SymbolId, block: u16) -> Self {
        Self(((frame.0 as u64) << 32) | ((symbol.0 as u64) << 16) | block as u64)
    }

    /// Tag for `(frame, symbol)` coordinates
    pub fn frame_sym(frame: FrameId, symbol: SymbolId) -> Self {
        Self::frame_sym_block(frame, symbol, 0)
    }

    /// Tag addressing a packet slot in the socket buffer
    pub fn rx(thread: u16, slot: u16) -> Self {
        Self(((thread as u64) << 16) | slot as u64)
    }

    pub fn frame(&self) -> FrameId {
        FrameId((self.0 >> 32) as u32)
    }

    pub fn symbol(&self) -> SymbolId {
        SymbolId((self.0 >> 16) as u16)
    }

    pub fn block(&self) -> u16 {
        self.0 as u16
    }

    pub fn rx_thread(&self) -> usize {
        (self.0 >> 16) as u16 as usize
    }

    pub fn rx_slot(&self) -> usize {
        self.0 as u16 as usize
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag(frame={}, symbol={}, block={})",
            self.frame().0,
            self.symbol().0,
            self.block()
        )
    }
}

/// One work descriptor
#[derive(Debug, Clone, Copy)]
pub struct EventData {
    pub event_type: EventType,
    pub tag: Tag,
}

impl EventData {
    pub fn new(event_type: EventType, tag: Tag) -> Self {
        Self { event_type, tag }
    }
}

/// Enqueue retry budget before the pipeline hard-fails on back-pressure
const ENQUEUE_RETRIES: usize = 4096;

/// Push with exponential backoff; a persistently full queue is fatal.
pub fn enqueue_with_backoff(
    queue: &ArrayQueue<EventData>,
    mut event: EventData,
    context: &'static str,
) -> Result<(), PhyError> {
    let backoff = Backoff::new();
    for attempt in 0..ENQUEUE_RETRIES {
        match queue.push(event) {
            Ok(()) => return Ok(()),
            Err(rejected) => event = rejected,
        }
        if backoff.is_completed() {
            // Past the spin budget, sleep with doubling delay
            let shift = (attempt / 64).min(6) as u32;
            std::thread::sleep(Duration::from_micros(1 << shift));
        } else {
            backoff.snooze();
        }
    }
    Err(PhyError::QueueFull(context))
}

/// The per-stage input queues plus the shared completion queue
pub struct TaskQueues {
    pub fft: ArrayQueue<EventData>,
    pub beam: ArrayQueue<EventData>,
    pub equalize: ArrayQueue<EventData>,
    pub decode: ArrayQueue<EventData>,
    /// Completion and ingress notifications, drained by the coordinator
    pub completion: ArrayQueue<EventData>,
}

impl TaskQueues {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            fft: ArrayQueue::new(capacity),
            beam: ArrayQueue::new(capacity),
            equalize: ArrayQueue::new(capacity),
            decode: ArrayQueue::new(capacity),
            completion: ArrayQueue::new(capacity * 4),
        })
    }

    /// Stage input queue for a work type
    pub fn stage(&self, event_type: EventType) -> &ArrayQueue<EventData> {
        match event_type {
            EventType::Fft => &self.fft,
            EventType::Beam => &self.beam,
            EventType::Equalize => &self.equalize,
            EventType::Decode => &self.decode,
            EventType::RxPacket | EventType::WorkerError => &self.completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag::frame_sym_block(FrameId(0xDEADBEEF), SymbolId(0x1234), 0x00AB);
        assert_eq!(tag.frame(), FrameId(0xDEADBEEF));
        assert_eq!(tag.symbol(), SymbolId(0x1234));
        assert_eq!(tag.block(), 0x00AB);
    }

    #[test]
    fn test_rx_tag_roundtrip() {
        let tag = Tag::rx(3, 41);
        assert_eq!(tag.rx_thread(), 3);
        assert_eq!(tag.rx_slot(), 41);
    }

    #[test]
    fn test_enqueue_backoff_fails_when_full() {
        let q = ArrayQueue::new(1);
        let ev = EventData::new(EventType::Fft, Tag::rx(0, 0));
        enqueue_with_backoff(&q, ev, "test").unwrap();
        // Queue is full and nobody drains it
        assert!(matches!(
            enqueue_with_backoff(&q, ev, "test"),
            Err(PhyError::QueueFull("test"))
        ));
    }

    #[test]
    fn test_queue_is_mpmc() {
        let q = Arc::new(ArrayQueue::new(1024));
        let mut producers = Vec::new();
        for t in 0..4u16 {
            let q = Arc::clone(&q);
            producers.push(std::thread::spawn(move || {
                for i in 0..100u16 {
                    let ev = EventData::new(EventType::Equalize, Tag::rx(t, i));
                    enqueue_with_backoff(&q, ev, "mpmc").unwrap();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        let mut count = 0;
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 400);
    }
}
