//! Reading and dosing-event sources.
//!
//! A source is either historical (a finished recording, restartable) or live
//! (fed as data arrives, not restartable). Only live sources accept a stop
//! signal; a historical source always runs to exhaustion.
use crossbeam_channel as xch;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{EstimationError, Result};
use crate::types::{DosingEvent, ReadingBatch, Timestamped};

/// Shared stop flag.
#[derive(Debug, Default, Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of one pull.
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled<T> {
    Ready(T),
    /// Nothing arrived within the wait (live only).
    Pending,
    /// No further items will ever be produced.
    Exhausted,
}

pub trait Source: Send {
    type Item: Timestamped + Send;

    /// Fixed for the lifetime of the source.
    fn is_live(&self) -> bool;

    /// Request early termination. Historical sources return `NotSupported`.
    fn set_stop_event(&mut self, stop: StopSignal) -> Result<()>;

    /// Next item, blocking at most `wait` (historical sources never block).
    fn pull(&mut self, wait: Duration) -> Pulled<Self::Item>;
}

/// Source of `ReadingBatch`es, ordered by timestamp.
pub trait ReadingSource: Source<Item = ReadingBatch> {}
impl<T: Source<Item = ReadingBatch>> ReadingSource for T {}

/// Source of `DosingEvent`s, ordered by timestamp.
pub trait EventSource: Source<Item = DosingEvent> {}
impl<T: Source<Item = DosingEvent>> EventSource for T {}

/// A finished recording.
#[derive(Debug, Clone)]
pub struct HistoricalSource<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> HistoricalSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Start again from the first item.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Timestamped + Clone + Send> Source for HistoricalSource<T> {
    type Item = T;

    fn is_live(&self) -> bool {
        false
    }

    fn set_stop_event(&mut self, _stop: StopSignal) -> Result<()> {
        Err(EstimationError::NotSupported(
            "historical sources run to exhaustion and take no stop signal",
        ))
    }

    fn pull(&mut self, _wait: Duration) -> Pulled<T> {
        match self.items.get(self.cursor) {
            Some(item) => {
                self.cursor += 1;
                Pulled::Ready(item.clone())
            }
            None => Pulled::Exhausted,
        }
    }
}

/// Sending half of a live source. Cloneable; the source is exhausted once
/// every feed is dropped.
#[derive(Debug, Clone)]
pub struct LiveFeed<T> {
    tx: xch::Sender<T>,
}

impl<T> LiveFeed<T> {
    pub fn send(&self, item: T) -> std::result::Result<(), xch::SendError<T>> {
        self.tx.send(item)
    }
}

/// Items pushed as they arrive (e.g. from a bus subscription).
#[derive(Debug)]
pub struct LiveSource<T> {
    rx: xch::Receiver<T>,
    stop: Option<StopSignal>,
}

impl<T> LiveSource<T> {
    pub fn channel() -> (LiveFeed<T>, Self) {
        let (tx, rx) = xch::unbounded();
        (LiveFeed { tx }, Self { rx, stop: None })
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_raised)
    }
}

impl<T: Timestamped + Send> Source for LiveSource<T> {
    type Item = T;

    fn is_live(&self) -> bool {
        true
    }

    fn set_stop_event(&mut self, stop: StopSignal) -> Result<()> {
        self.stop = Some(stop);
        Ok(())
    }

    fn pull(&mut self, wait: Duration) -> Pulled<T> {
        if self.stopped() {
            return Pulled::Exhausted;
        }
        let got = if wait.is_zero() {
            self.rx.try_recv().map_err(|e| e.is_disconnected())
        } else {
            self.rx.recv_timeout(wait).map_err(|e| e.is_disconnected())
        };
        match got {
            Ok(item) => Pulled::Ready(item),
            Err(true) => Pulled::Exhausted,
            Err(false) => Pulled::Pending,
        }
    }
}
