//! Scheduler and Frame State Machine
//!
//! The coordinator is the only thread that mutates frame state. It drains
//! the completion queue, advances per-frame counters, and enqueues
//! downstream work exactly when the upstream dependencies are complete:
//! all pilot FFTs before the beam items, all beams plus a symbol's FFTs
//! before that symbol's equalize items (data symbols additionally wait for
//! the pilot symbols' equalize so the phase correlations are final), all
//! equalize items of a data symbol before its decode items. A frame
//! retires when every data symbol is decoded; only then may its ring slot
//! be admitted again.

use crate::config::{Config, SymbolType};
use crate::message::{enqueue_with_backoff, EventData, EventType, Tag, TaskQueues};
use crate::rx::{PacketHeader, RxSocketBuffer};
use crate::stats::PhyStats;
use crate::PhyError;
use common::types::{FrameId, SymbolId};
use crossbeam::channel::Sender;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of one in-flight frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Empty,
    ReceivingPilots,
    ReceivingData,
    BeamReady,
    Equalizing,
    Decoding,
    Retired,
}

/// Notification emitted when a frame finishes processing
#[derive(Debug, Clone, Copy)]
pub struct RetiredFrame {
    pub frame: FrameId,
    pub deadline_missed: bool,
}

/// Completion counters for one ring slot
struct FrameState {
    frame: FrameId,
    phase: FramePhase,
    pilot_ffts: usize,
    data_ffts: Vec<usize>,
    fft_done: Vec<bool>,
    beams_done: usize,
    equal_enqueued: Vec<bool>,
    equalized: Vec<usize>,
    equal_done: Vec<bool>,
    pilot_symbols_equalized: usize,
    decoded: Vec<usize>,
    symbols_decoded: usize,
    admitted_at: Instant,
    deadline_missed: bool,
}

impl FrameState {
    fn idle(ul_symbols: usize, data_symbols: usize) -> Self {
        Self {
            frame: FrameId(0),
            phase: FramePhase::Empty,
            pilot_ffts: 0,
            data_ffts: vec![0; ul_symbols],
            fft_done: vec![false; ul_symbols],
            beams_done: 0,
            equal_enqueued: vec![false; ul_symbols],
            equalized: vec![0; ul_symbols],
            equal_done: vec![false; ul_symbols],
            pilot_symbols_equalized: 0,
            decoded: vec![0; data_symbols],
            symbols_decoded: 0,
            admitted_at: Instant::now(),
            deadline_missed: false,
        }
    }

    fn activate(&mut self, frame: FrameId) {
        self.frame = frame;
        self.phase = FramePhase::ReceivingPilots;
        self.pilot_ffts = 0;
        self.data_ffts.fill(0);
        self.fft_done.fill(false);
        self.beams_done = 0;
        self.equal_enqueued.fill(false);
        self.equalized.fill(0);
        self.equal_done.fill(false);
        self.pilot_symbols_equalized = 0;
        self.decoded.fill(0);
        self.symbols_decoded = 0;
        self.admitted_at = Instant::now();
        self.deadline_missed = false;
    }

    fn active(&self) -> bool {
        !matches!(self.phase, FramePhase::Empty | FramePhase::Retired)
    }
}

/// Single-threaded frame scheduler
pub struct Coordinator {
    cfg: Arc<Config>,
    queues: Arc<TaskQueues>,
    rx: Arc<RxSocketBuffer>,
    stats: Arc<PhyStats>,
    states: Vec<FrameState>,
    retired_tx: Sender<RetiredFrame>,
    /// Number of contiguously retired frames from frame 0; frames at
    /// `watermark + W` and beyond are refused admission
    watermark: Arc<AtomicU64>,
    run: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<Config>,
        queues: Arc<TaskQueues>,
        rx: Arc<RxSocketBuffer>,
        stats: Arc<PhyStats>,
        retired_tx: Sender<RetiredFrame>,
        watermark: Arc<AtomicU64>,
        run: Arc<AtomicBool>,
    ) -> Self {
        let states = (0..cfg.frame_wnd)
            .map(|_| FrameState::idle(cfg.ul_symbol_num(), cfg.ul_data_symbols))
            .collect();
        Self {
            cfg,
            queues,
            rx,
            stats,
            states,
            retired_tx,
            watermark,
            run,
        }
    }

    /// Drain completions until shutdown; on a fatal error drain the queues
    /// and release every ring slot before returning.
    pub fn run(&mut self) {
        let backoff = Backoff::new();
        let result = loop {
            match self.queues.completion.pop() {
                Some(ev) => {
                    backoff.reset();
                    if let Err(e) = self.handle(ev) {
                        break Err(e);
                    }
                }
                None => {
                    self.check_deadlines();
                    if !self.run.load(Ordering::Acquire) {
                        break Ok(());
                    }
                    if backoff.is_completed() {
                        std::thread::sleep(Duration::from_micros(50));
                    } else {
                        backoff.snooze();
                    }
                }
            }
        };

        if let Err(e) = result {
            error!("coordinator shutting down after error: {}", e);
            self.drain();
        }
        self.run.store(false, Ordering::Release);
    }

    fn handle(&mut self, ev: EventData) -> Result<(), PhyError> {
        match ev.event_type {
            EventType::RxPacket => self.on_packet(ev.tag),
            EventType::Fft => self.on_fft(ev.tag),
            EventType::Beam => self.on_beam(ev.tag),
            EventType::Equalize => self.on_equalize(ev.tag),
            EventType::Decode => self.on_decode(ev.tag),
            EventType::WorkerError => {
                error!("a worker reported a fatal error");
                Err(PhyError::ShutDown)
            }
        }
    }

    fn state_mut(&mut self, frame: FrameId) -> Result<&mut FrameState, PhyError> {
        let slot = frame.slot(self.cfg.frame_wnd);
        let st = &mut self.states[slot];
        if !st.active() || st.frame != frame {
            return Err(PhyError::Schedule {
                frame: frame.0,
                symbol: 0,
                detail: format!("event for inactive frame (slot holds {})", st.frame.0),
            });
        }
        Ok(st)
    }

    fn on_packet(&mut self, tag: Tag) -> Result<(), PhyError> {
        // SAFETY: the rx descriptor travels with the packet; only the
        // header is peeked before the FFT worker takes over.
        let pkt = unsafe { self.rx.packet(tag.rx_thread(), tag.rx_slot()) };
        let header = PacketHeader::parse(pkt)?;

        let slot = header.frame.slot(self.cfg.frame_wnd);
        let st = &mut self.states[slot];
        if !st.active() {
            debug!("admitting frame {} into slot {}", header.frame.0, slot);
            st.activate(header.frame);
            self.stats.reset_slot(slot);
        } else if st.frame != header.frame {
            // Admission control in ingest() refuses un-retired slots, so a
            // collision here is an impossible transition.
            return Err(PhyError::Schedule {
                frame: header.frame.0,
                symbol: header.symbol.0,
                detail: format!("ring slot {} still owned by frame {}", slot, st.frame.0),
            });
        }

        enqueue_with_backoff(
            &self.queues.fft,
            EventData::new(EventType::Fft, tag),
            "fft task queue",
        )
    }

    fn on_fft(&mut self, tag: Tag) -> Result<(), PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let frame = tag.frame();
        let symbol = tag.symbol();

        match cfg.symbol_type(symbol)? {
            SymbolType::Pilot => {
                let st = self.state_mut(frame)?;
                st.pilot_ffts += 1;
                if st.pilot_ffts == cfg.ue_ant_num * cfg.bs_ant_num {
                    st.phase = FramePhase::ReceivingData;
                    debug!("frame {}: all pilots in, scheduling beams", frame.0);
                    for beam_id in 0..cfg.beam_block_num {
                        enqueue_with_backoff(
                            &self.queues.beam,
                            EventData::new(
                                EventType::Beam,
                                Tag::frame_sym_block(frame, SymbolId(0), beam_id as u16),
                            ),
                            "beam task queue",
                        )?;
                    }
                }
            }
            SymbolType::UplinkData => {
                let idx = cfg.ul_symbol_idx(symbol).expect("classified uplink symbol");
                let st = self.state_mut(frame)?;
                st.data_ffts[idx] += 1;
                if st.data_ffts[idx] == cfg.bs_ant_num {
                    st.fft_done[idx] = true;
                    self.schedule_equalize(frame)?;
                }
            }
            SymbolType::CalDl | SymbolType::CalUl => {}
        }
        Ok(())
    }

    fn on_beam(&mut self, tag: Tag) -> Result<(), PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let frame = tag.frame();
        let st = self.state_mut(frame)?;
        st.beams_done += 1;
        if st.beams_done == cfg.beam_block_num {
            st.phase = FramePhase::BeamReady;
            self.schedule_equalize(frame)?;
        }
        Ok(())
    }

    /// Enqueue equalize items for every symbol whose dependencies are met.
    /// Data symbols additionally wait for the pilot symbols' equalize, so
    /// the phase correlations they read are complete.
    fn schedule_equalize(&mut self, frame: FrameId) -> Result<(), PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let slot = frame.slot(cfg.frame_wnd);
        if self.states[slot].beams_done < cfg.beam_block_num {
            return Ok(());
        }
        let pilots_done =
            self.states[slot].pilot_symbols_equalized == cfg.ul_pilot_symbols;

        for idx in 0..cfg.ul_symbol_num() {
            let st = &mut self.states[slot];
            let gated = idx >= cfg.ul_pilot_symbols && !pilots_done;
            if !st.fft_done[idx] || st.equal_enqueued[idx] || gated {
                continue;
            }
            st.equal_enqueued[idx] = true;
            st.phase = FramePhase::Equalizing;
            let symbol = cfg.ul_symbol_id(idx);
            for block in 0..cfg.demul_block_num() {
                let base_sc = (block * cfg.demul_block_size) as u16;
                enqueue_with_backoff(
                    &self.queues.equalize,
                    EventData::new(
                        EventType::Equalize,
                        Tag::frame_sym_block(frame, symbol, base_sc),
                    ),
                    "equalize task queue",
                )?;
            }
        }
        Ok(())
    }

    fn on_equalize(&mut self, tag: Tag) -> Result<(), PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let frame = tag.frame();
        let idx = cfg
            .ul_symbol_idx(tag.symbol())
            .ok_or_else(|| PhyError::Schedule {
                frame: frame.0,
                symbol: tag.symbol().0,
                detail: "equalize completion for a non-uplink symbol".into(),
            })?;

        let st = self.state_mut(frame)?;
        st.equalized[idx] += 1;
        if st.equalized[idx] < cfg.demul_block_num() {
            return Ok(());
        }
        st.equal_done[idx] = true;

        if idx < cfg.ul_pilot_symbols {
            st.pilot_symbols_equalized += 1;
            self.schedule_equalize(frame)?;
        } else {
            st.phase = FramePhase::Decoding;
            let data_sym = idx - cfg.ul_pilot_symbols;
            for stream in 0..cfg.spatial_streams {
                enqueue_with_backoff(
                    &self.queues.decode,
                    EventData::new(
                        EventType::Decode,
                        Tag::frame_sym_block(frame, SymbolId(data_sym as u16), stream as u16),
                    ),
                    "decode task queue",
                )?;
            }
        }
        Ok(())
    }

    fn on_decode(&mut self, tag: Tag) -> Result<(), PhyError> {
        let cfg = Arc::clone(&self.cfg);
        let frame = tag.frame();
        let data_sym = tag.symbol().0 as usize;
        let st = self.state_mut(frame)?;
        st.decoded[data_sym] += 1;
        if st.decoded[data_sym] == cfg.spatial_streams {
            st.symbols_decoded += 1;
            if st.symbols_decoded == cfg.ul_data_symbols {
                self.retire(frame);
            }
        }
        Ok(())
    }

    fn retire(&mut self, frame: FrameId) {
        let cfg = Arc::clone(&self.cfg);
        let slot = frame.slot(cfg.frame_wnd);
        let st = &mut self.states[slot];

        if let Some(deadline) = cfg.frame_deadline {
            if !st.deadline_missed && st.admitted_at.elapsed() > deadline {
                st.deadline_missed = true;
                self.stats.increment_deadline_missed();
                warn!("frame {} missed its deadline", frame.0);
            }
        }
        let deadline_missed = st.deadline_missed;
        st.phase = FramePhase::Retired;

        self.stats.frame_report(frame.0, slot);

        // Advance the admission watermark over contiguously retired frames
        let mut wm = self.watermark.load(Ordering::Acquire);
        while (wm as usize) < u32::MAX as usize {
            let s = &self.states[FrameId(wm as u32).slot(cfg.frame_wnd)];
            if s.phase == FramePhase::Retired && s.frame.0 as u64 == wm {
                wm += 1;
            } else {
                break;
            }
        }
        self.watermark.store(wm, Ordering::Release);

        debug!("frame {} retired (watermark {})", frame.0, wm);
        let _ = self.retired_tx.send(RetiredFrame {
            frame,
            deadline_missed,
        });
    }

    /// Flag frames that blew past the soft deadline; processing continues.
    fn check_deadlines(&mut self) {
        let Some(deadline) = self.cfg.frame_deadline else {
            return;
        };
        for st in &mut self.states {
            if st.active() && !st.deadline_missed && st.admitted_at.elapsed() > deadline {
                st.deadline_missed = true;
                self.stats.increment_deadline_missed();
                warn!("frame {} missed its deadline", st.frame.0);
            }
        }
    }

    /// Discard queued work and release every ring slot
    fn drain(&mut self) {
        while self.queues.fft.pop().is_some() {}
        while self.queues.beam.pop().is_some() {}
        while self.queues.equalize.pop().is_some() {}
        while self.queues.decode.pop().is_some() {}
        while self.queues.completion.pop().is_some() {}
        for st in &mut self.states {
            if st.active() {
                info!("releasing ring slot of frame {}", st.frame.0);
                st.phase = FramePhase::Retired;
            }
        }
    }
}
