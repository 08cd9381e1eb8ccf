//! Interleaving of the reading and event sources.
//!
//! Historical: strict timestamp order, an event wins a tie with a batch (the
//! dose precedes the reading that observes it). Live: arrival order, with
//! pending events drained before each reading poll.
use std::time::{Duration, Instant};

use growth_traits::Clock;

use crate::source::{EventSource, Pulled, ReadingSource, StopSignal};
use crate::types::{DosingEvent, ReadingBatch, Timestamp};
use crate::util;

/// When an element became available to the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arrival {
    /// Historical: the recorded timestamp.
    Recorded(Timestamp),
    /// Live: when the merge loop received it.
    Received(Instant),
}

impl Arrival {
    /// Time from `earlier` to `self`; zero if reversed or of different kinds.
    pub fn since(&self, earlier: &Self) -> Duration {
        match (earlier, self) {
            (Self::Recorded(a), Self::Recorded(b)) => util::gap(*a, *b),
            (Self::Received(a), Self::Received(b)) => b.saturating_duration_since(*a),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Merged {
    Batch {
        batch: ReadingBatch,
        arrival: Arrival,
    },
    Event {
        event: DosingEvent,
        arrival: Arrival,
    },
    /// Live only: no batch for `stalled_ms`.
    Stale { stalled_ms: u64 },
}

/// Lazy merge of a reading source and an event source.
///
/// Ends when the reading source is exhausted (or, live, when the stop signal
/// is raised); events left over at that point cannot affect any estimate.
pub struct Merger<R, E, C> {
    readings: R,
    events: E,
    clock: C,
    live: bool,
    stop: Option<StopSignal>,
    poll: Duration,
    max_staleness_ms: u64,
    reading_head: Option<ReadingBatch>,
    event_head: Option<DosingEvent>,
    events_done: bool,
    finished: bool,
    last_reading: Instant,
    stale_windows: u64,
}

impl<R: ReadingSource, E: EventSource, C: Clock> Merger<R, E, C> {
    pub fn new(readings: R, events: E, clock: C, poll: Duration, max_staleness_ms: u64) -> Self {
        let live = readings.is_live();
        let last_reading = clock.now();
        Self {
            readings,
            events,
            clock,
            live,
            stop: None,
            poll,
            max_staleness_ms: max_staleness_ms.max(1),
            reading_head: None,
            event_head: None,
            events_done: false,
            finished: false,
            last_reading,
            stale_windows: 0,
        }
    }

    /// Checked between elements; an element already handed out is unaffected.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_raised)
    }

    fn next_historical(&mut self) -> Option<Merged> {
        loop {
            if self.finished {
                return None;
            }
            if self.reading_head.is_none() {
                match self.readings.pull(Duration::ZERO) {
                    Pulled::Ready(b) => self.reading_head = Some(b),
                    Pulled::Pending => {
                        self.clock.sleep(self.poll);
                        continue;
                    }
                    Pulled::Exhausted => {
                        self.finished = true;
                        return None;
                    }
                }
            }
            if self.event_head.is_none() && !self.events_done {
                match self.events.pull(Duration::ZERO) {
                    Pulled::Ready(e) => self.event_head = Some(e),
                    Pulled::Pending => {
                        self.clock.sleep(self.poll);
                        continue;
                    }
                    Pulled::Exhausted => self.events_done = true,
                }
            }
            let event_first = match (&self.event_head, &self.reading_head) {
                (Some(e), Some(b)) => e.timestamp <= b.timestamp,
                _ => false,
            };
            if event_first {
                let event = self.event_head.take()?;
                return Some(Merged::Event {
                    arrival: Arrival::Recorded(event.timestamp),
                    event,
                });
            }
            let batch = self.reading_head.take()?;
            return Some(Merged::Batch {
                arrival: Arrival::Recorded(batch.timestamp),
                batch,
            });
        }
    }

    fn next_live(&mut self) -> Option<Merged> {
        loop {
            if self.finished || self.stopped() {
                return None;
            }
            if !self.events_done {
                match self.events.pull(Duration::ZERO) {
                    Pulled::Ready(event) => {
                        return Some(Merged::Event {
                            event,
                            arrival: Arrival::Received(self.clock.now()),
                        });
                    }
                    Pulled::Pending => {}
                    Pulled::Exhausted => self.events_done = true,
                }
            }
            match self.readings.pull(self.poll) {
                Pulled::Ready(batch) => {
                    let now = self.clock.now();
                    self.last_reading = now;
                    self.stale_windows = 0;
                    return Some(Merged::Batch {
                        batch,
                        arrival: Arrival::Received(now),
                    });
                }
                Pulled::Pending => {}
                Pulled::Exhausted => {
                    self.finished = true;
                    return None;
                }
            }
            let stalled_ms = self.clock.ms_since(self.last_reading);
            let windows = stalled_ms / self.max_staleness_ms;
            if windows > self.stale_windows {
                self.stale_windows = windows;
                return Some(Merged::Stale { stalled_ms });
            }
        }
    }
}

impl<R: ReadingSource, E: EventSource, C: Clock> Iterator for Merger<R, E, C> {
    type Item = Merged;

    fn next(&mut self) -> Option<Merged> {
        if self.live {
            self.next_live()
        } else {
            self.next_historical()
        }
    }
}
