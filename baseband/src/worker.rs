//! Symmetric Stage Workers
//!
//! Every worker owns one instance of each stage and polls the stage queues
//! in the configured priority order, executing whichever descriptor it
//! wins. Workers never block inside a kernel; the only yield point is the
//! dequeue boundary, where a failed poll spins briefly and then sleeps.

use crate::beam::BeamStage;
use crate::decode::DecodeStage;
use crate::equalize::EqualizeStage;
use crate::fft::FftStage;
use crate::message::{enqueue_with_backoff, EventData, EventType, TaskQueues};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub struct Worker {
    id: usize,
    queues: Arc<TaskQueues>,
    run: Arc<AtomicBool>,
    priority: [EventType; 4],
    fft: FftStage,
    beam: BeamStage,
    equalize: EqualizeStage,
    decode: DecodeStage,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queues: Arc<TaskQueues>,
        run: Arc<AtomicBool>,
        priority: [EventType; 4],
        fft: FftStage,
        beam: BeamStage,
        equalize: EqualizeStage,
        decode: DecodeStage,
    ) -> Self {
        Self {
            id,
            queues,
            run,
            priority,
            fft,
            beam,
            equalize,
            decode,
        }
    }

    pub fn run(mut self) {
        debug!("worker {} up", self.id);
        let backoff = Backoff::new();
        while self.run.load(Ordering::Acquire) {
            let mut event = None;
            for stage in self.priority {
                if let Some(ev) = self.queues.stage(stage).pop() {
                    event = Some(ev);
                    break;
                }
            }
            match event {
                Some(ev) => {
                    backoff.reset();
                    self.dispatch(ev);
                }
                None if backoff.is_completed() => {
                    std::thread::sleep(Duration::from_micros(100));
                }
                None => backoff.snooze(),
            }
        }
        debug!("worker {} down", self.id);
    }

    fn dispatch(&mut self, ev: EventData) {
        let result = match ev.event_type {
            EventType::Fft => self.fft.launch(ev.tag),
            EventType::Beam => self.beam.launch(ev.tag),
            EventType::Equalize => self.equalize.launch(ev.tag),
            EventType::Decode => self.decode.launch(ev.tag),
            EventType::RxPacket | EventType::WorkerError => {
                debug!("worker {}: spurious {:?} descriptor", self.id, ev.event_type);
                return;
            }
        };

        match result {
            Ok(done) => {
                if let Err(e) =
                    enqueue_with_backoff(&self.queues.completion, done, "completion queue")
                {
                    error!("worker {}: {}", self.id, e);
                    let _ = self
                        .queues
                        .completion
                        .push(EventData::new(EventType::WorkerError, ev.tag));
                }
            }
            Err(e) => {
                error!("worker {} failed on {:?}: {}", self.id, ev.tag, e);
                let _ = self
                    .queues
                    .completion
                    .push(EventData::new(EventType::WorkerError, ev.tag));
            }
        }
    }
}
