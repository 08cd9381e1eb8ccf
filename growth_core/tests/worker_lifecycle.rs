use std::time::Duration;

use chrono::{TimeZone, Utc};
use growth_core::{
    DosingEvent, EstimationError, GrowthRateEstimationJob, HistoricalSource, JobState, LiveSource,
    MemoryStore, ReadingBatch,
};
use growth_traits::{KeyValueStore, ManualClock};
use rstest::rstest;

const WAIT: Duration = Duration::from_secs(5);

fn batch(i: i64, od: f64) -> ReadingBatch {
    let ts = Utc.timestamp_opt(1_709_294_400 + 5 * i, 0).unwrap();
    ReadingBatch::from_ods(ts, [("1", od)])
}

fn calibrated() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .set("od_normalization_mean", "exp", r#"{"1":0.5}"#)
        .unwrap();
    store
}

fn job(store: MemoryStore) -> GrowthRateEstimationJob {
    GrowthRateEstimationJob::builder()
        .experiment("exp")
        .store(store)
        .try_build()
        .unwrap()
}

#[rstest]
fn historical_worker_runs_to_exhaustion() {
    let readings: Vec<_> = (0..20).map(|i| batch(i, 0.5)).collect();
    let bg = job(calibrated())
        .process_in_background(HistoricalSource::new(readings), HistoricalSource::empty())
        .unwrap();
    bg.wait_until_initialized(WAIT).unwrap();
    assert!(!bg.is_live());

    let mut received = 0;
    while bg.recv_timeout(WAIT).is_some() {
        received += 1;
        if received == 20 {
            break;
        }
    }
    assert_eq!(received, 20);
    assert!(matches!(bg.stop(), Err(EstimationError::NotSupported(_))));
    assert_eq!(bg.join(), JobState::Exhausted);
}

#[rstest]
fn mixed_modes_are_rejected_up_front() {
    let (_feed, od) = LiveSource::<ReadingBatch>::channel();
    let result = job(calibrated())
        .process_in_background(od, HistoricalSource::<DosingEvent>::empty())
        .map(|_| ());
    assert_eq!(
        result,
        Err(EstimationError::MixedSourceMode {
            od_live: true,
            events_live: false
        })
    );
}

#[rstest]
fn live_worker_stops_on_request() {
    let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
    let (_ev_feed, ev) = LiveSource::<DosingEvent>::channel();
    let bg = job(calibrated()).process_in_background(od, ev).unwrap();
    assert!(bg.is_live());

    od_feed.send(batch(0, 0.5)).unwrap();
    bg.wait_until_initialized(WAIT).unwrap();
    od_feed.send(batch(1, 0.5)).unwrap();
    assert!(bg.recv_timeout(WAIT).is_some());
    assert!(bg.recv_timeout(WAIT).is_some());

    bg.stop().unwrap();
    assert_eq!(bg.join(), JobState::Disconnected);
}

#[rstest]
fn waiting_times_out_without_data_and_leaves_worker_running() {
    let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
    let (_ev_feed, ev) = LiveSource::<DosingEvent>::channel();
    let bg = job(calibrated()).process_in_background(od, ev).unwrap();

    assert!(matches!(
        bg.wait_until_initialized(Duration::from_millis(50)),
        Err(EstimationError::InitializationTimeout(_))
    ));
    assert_eq!(bg.state(), JobState::Initializing);

    od_feed.send(batch(0, 0.5)).unwrap();
    bg.wait_until_initialized(WAIT).unwrap();
    assert_eq!(bg.state(), JobState::SteadyState);
}

#[rstest]
fn released_waiters_see_the_initialized_state() {
    for _ in 0..20 {
        let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
        let (_ev_feed, ev) = LiveSource::<DosingEvent>::channel();
        let bg = job(calibrated()).process_in_background(od, ev).unwrap();
        od_feed.send(batch(0, 0.5)).unwrap();
        bg.wait_until_initialized(WAIT).unwrap();
        assert_eq!(bg.state(), JobState::SteadyState);
        bg.stop().unwrap();
        bg.join();
    }
}

#[rstest]
fn worker_that_fails_before_initializing_reports_its_error() {
    // baseline only knows channel 1; the feed reports channel 2
    let readings = vec![ReadingBatch::from_ods(batch(0, 0.0).timestamp, [("2", 0.5)])];
    let bg = job(calibrated())
        .process_in_background(HistoricalSource::new(readings), HistoricalSource::empty())
        .unwrap();
    assert!(matches!(
        bg.wait_until_initialized(WAIT),
        Err(EstimationError::Config(_))
    ));
    assert_eq!(bg.join(), JobState::Failed);
}

#[rstest]
fn latest_goes_stale_when_readings_stop() {
    let clock = ManualClock::new();
    let job = GrowthRateEstimationJob::builder()
        .experiment("exp")
        .store(calibrated())
        .clock(clock.clone())
        .try_build()
        .unwrap();
    let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
    let (_ev_feed, ev) = LiveSource::<DosingEvent>::channel();
    let bg = job.process_in_background(od, ev).unwrap();

    od_feed.send(batch(0, 0.5)).unwrap();
    let first = bg.recv_timeout(WAIT).unwrap();
    assert_eq!(bg.latest().unwrap(), Some(first));

    clock.advance(Duration::from_secs(61));
    assert!(matches!(bg.latest(), Err(EstimationError::Stale { .. })));
    assert!(bg.stalled_for_now() >= 61_000);
}
