//! Background execution of an estimation job.
//!
//! Spawns one thread that drives the `EstimateStream`, pushes every estimate
//! through an unbounded channel, and tracks the last-ok time for staleness.
//! Callers can block on initialization with a timeout; timing out does not
//! affect the worker.
//!
//! Each `BackgroundJob` owns exactly one thread, stopped (live) and joined
//! when the handle is dropped.
use crossbeam_channel as xch;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use growth_traits::Clock;

use crate::error::{EstimationError, Result};
use crate::job::{GrowthRateEstimationJob, check_modes};
use crate::source::{EventSource, ReadingSource, StopSignal};
use crate::status::JobState;
use crate::types::GrowthEstimate;

#[derive(Default)]
struct Barrier {
    initialized: bool,
    finished: bool,
}

struct Shared {
    barrier: Mutex<Barrier>,
    cv: Condvar,
    state: AtomicU8,
    last_ok: AtomicU64,
    latest: Mutex<Option<GrowthEstimate>>,
    last_error: Mutex<Option<EstimationError>>,
}

impl Shared {
    fn mark(&self, f: impl FnOnce(&mut Barrier)) {
        if let Ok(mut b) = self.barrier.lock() {
            f(&mut b);
        }
        self.cv.notify_all();
    }
}

pub struct BackgroundJob {
    rx: xch::Receiver<GrowthEstimate>,
    shared: Arc<Shared>,
    stop: Option<StopSignal>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    max_staleness_ms: u64,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl GrowthRateEstimationJob {
    /// Run `process` on a dedicated thread.
    ///
    /// Live sources get a stop signal installed; historical sources run to
    /// exhaustion.
    pub fn process_in_background<R, E>(
        self,
        mut od_source: R,
        mut event_source: E,
    ) -> Result<BackgroundJob>
    where
        R: ReadingSource + 'static,
        E: EventSource + 'static,
    {
        check_modes(&od_source, &event_source)?;
        let live = od_source.is_live();
        let stop = if live {
            let stop = StopSignal::new();
            od_source.set_stop_event(stop.clone())?;
            event_source.set_stop_event(stop.clone())?;
            Some(stop)
        } else {
            None
        };

        let clock = Arc::clone(&self.clock);
        let max_staleness_ms = self.cfg.runner.max_staleness_ms;
        let mut stream = self.process(od_source, event_source)?;
        if let Some(stop) = &stop {
            stream = stream.with_stop(stop.clone());
        }

        let shared = Arc::new(Shared {
            barrier: Mutex::new(Barrier::default()),
            cv: Condvar::new(),
            state: AtomicU8::new(JobState::Initializing.as_u8()),
            last_ok: AtomicU64::new(0),
            latest: Mutex::new(None),
            last_error: Mutex::new(None),
        });
        let released = Arc::clone(&shared);
        let mut stream = stream.on_initialized(move || {
            // state first, so a released waiter never reads Initializing
            released
                .state
                .store(JobState::SteadyState.as_u8(), Ordering::Relaxed);
            released.mark(|b| b.initialized = true);
        });

        let (tx, rx) = xch::unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker_clock = Arc::clone(&clock);
        let epoch = clock.now();

        let join_handle = std::thread::spawn(move || {
            while let Some(item) = stream.next() {
                match item {
                    Ok(estimate) => {
                        worker_shared
                            .last_ok
                            .store(worker_clock.ms_since(epoch), Ordering::Relaxed);
                        if let Ok(mut latest) = worker_shared.latest.lock() {
                            *latest = Some(estimate.clone());
                        }
                        // receiver lives in the handle; a failed send means nobody listens
                        let _ = tx.send(estimate);
                    }
                    Err(e) => {
                        if let Ok(mut last) = worker_shared.last_error.lock() {
                            *last = Some(e);
                        }
                    }
                }
                worker_shared
                    .state
                    .store(stream.state().as_u8(), Ordering::Relaxed);
            }
            worker_shared
                .state
                .store(stream.state().as_u8(), Ordering::Relaxed);
            worker_shared.mark(|b| b.finished = true);
            tracing::trace!("growth-rate worker exiting cleanly");
        });

        Ok(BackgroundJob {
            rx,
            shared,
            stop,
            clock,
            epoch,
            max_staleness_ms,
            join_handle: Some(join_handle),
        })
    }
}

impl BackgroundJob {
    /// Block until the filter is initialized or `timeout` elapses.
    ///
    /// A worker that ended before initializing reports its last error.
    pub fn wait_until_initialized(&self, timeout: Duration) -> Result<()> {
        let guard = self
            .shared
            .barrier
            .lock()
            .map_err(|_| EstimationError::InitializationTimeout(timeout))?;
        let (guard, _) = self
            .shared
            .cv
            .wait_timeout_while(guard, timeout, |b| !b.initialized && !b.finished)
            .map_err(|_| EstimationError::InitializationTimeout(timeout))?;
        if guard.initialized {
            return Ok(());
        }
        if guard.finished {
            if let Some(e) = self.last_error() {
                return Err(e);
            }
        }
        Err(EstimationError::InitializationTimeout(timeout))
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    pub fn is_live(&self) -> bool {
        self.stop.is_some()
    }

    pub fn last_error(&self) -> Option<EstimationError> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Milliseconds since the last estimate (or since spawn, before the first).
    pub fn stalled_for_now(&self) -> u64 {
        self.clock
            .ms_since(self.epoch)
            .saturating_sub(self.shared.last_ok.load(Ordering::Relaxed))
    }

    /// Most recent estimate. Live runs report `Stale` once it is older than
    /// the staleness window.
    pub fn latest(&self) -> Result<Option<GrowthEstimate>> {
        let latest = self.shared.latest.lock().ok().and_then(|l| l.clone());
        if latest.is_some() && self.is_live() {
            let stalled_ms = self.stalled_for_now();
            if stalled_ms > self.max_staleness_ms {
                return Err(EstimationError::Stale { stalled_ms });
            }
        }
        Ok(latest)
    }

    /// Estimates produced since the last call, without blocking.
    pub fn try_iter(&self) -> xch::TryIter<'_, GrowthEstimate> {
        self.rx.try_iter()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<GrowthEstimate> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Ask a live worker to stop after the element in hand.
    pub fn stop(&self) -> Result<()> {
        match &self.stop {
            Some(stop) => {
                stop.raise();
                Ok(())
            }
            None => Err(EstimationError::NotSupported(
                "historical runs cannot be stopped early",
            )),
        }
    }

    /// Wait for the worker to finish (live runs must be stopped first).
    pub fn join(mut self) -> JobState {
        self.join_worker();
        self.state()
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("growth-rate worker joined successfully"),
                Err(e) => tracing::warn!(?e, "growth-rate worker panicked"),
            }
        }
    }
}

impl Drop for BackgroundJob {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.raise();
        }
        self.join_worker();
    }
}
