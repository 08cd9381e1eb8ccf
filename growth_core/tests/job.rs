use std::time::Duration;

use chrono::{TimeZone, Utc};
use growth_core::publish::MemoryPublisher;
use growth_core::{
    DosingEvent, DosingKind, EstimationError, EstimatorCfg, GeometricMeanReducer, GrowthEstimate,
    GrowthRateEstimationJob, HistoricalSource, JobBuilder, JobState, LiveSource, MemoryStore,
    ReadingBatch, Source, StopSignal, Timestamp,
};
use growth_traits::{KeyValueStore, ManualClock};
use rstest::rstest;

// 2024-03-01T12:00:00Z
const BASE: i64 = 1_709_294_400;

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(BASE + secs, 0).unwrap()
}

/// One single-channel batch per 5 s.
fn batch(i: i64, od: f64) -> ReadingBatch {
    ReadingBatch::from_ods(t(5 * i), [("1", od)])
}

fn dose(at_secs: i64, kind: DosingKind) -> DosingEvent {
    DosingEvent {
        volume_change: 0.5,
        kind,
        source_of_event: "chemostat".into(),
        timestamp: t(at_secs),
    }
}

fn calibrated(mean_json: &str) -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .set("od_normalization_mean", "exp", mean_json)
        .unwrap();
    store
}

fn builder(store: MemoryStore) -> JobBuilder {
    GrowthRateEstimationJob::builder()
        .experiment("exp")
        .unit("unit-1")
        .channels(["1"])
        .store(store)
}

fn replay(
    job: GrowthRateEstimationJob,
    readings: Vec<ReadingBatch>,
    events: Vec<DosingEvent>,
) -> Vec<GrowthEstimate> {
    job.process(HistoricalSource::new(readings), HistoricalSource::new(events))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

fn cached(store: &MemoryStore, cache: &str) -> Option<f64> {
    store
        .get(cache, "exp")
        .unwrap()
        .map(|s| s.parse::<f64>().unwrap())
}

#[rstest]
#[case(true, false)]
#[case(false, true)]
fn mixed_source_modes_fail_before_processing(#[case] od_live: bool, #[case] events_live: bool) {
    let job = builder(calibrated(r#"{"1":0.5}"#)).try_build().unwrap();
    let result = match (od_live, events_live) {
        (true, false) => {
            let (_feed, od) = LiveSource::<ReadingBatch>::channel();
            job.process(od, HistoricalSource::<DosingEvent>::empty())
                .map(|_| ())
        }
        _ => {
            let (_feed, ev) = LiveSource::<DosingEvent>::channel();
            job.process(HistoricalSource::new(vec![batch(0, 0.5)]), ev)
                .map(|_| ())
        }
    };
    assert_eq!(
        result,
        Err(EstimationError::MixedSourceMode {
            od_live,
            events_live
        })
    );
}

#[rstest]
fn historical_run_without_baseline_fails_fast() {
    let job = builder(MemoryStore::new()).try_build().unwrap();
    let Err(err) = job.process(
        HistoricalSource::new(vec![batch(0, 0.5)]),
        HistoricalSource::empty(),
    ) else {
        panic!("expected missing calibration");
    };
    assert_eq!(err, EstimationError::MissingCalibration("exp".into()));
}

#[rstest]
fn historical_source_rejects_stop_signal() {
    let mut src = HistoricalSource::new(vec![batch(0, 0.5)]);
    assert!(matches!(
        src.set_stop_event(StopSignal::new()),
        Err(EstimationError::NotSupported(_))
    ));
}

fn noisy_growth(n: i64) -> Vec<ReadingBatch> {
    (0..n)
        .map(|i| {
            let hours = (5 * i) as f64 / 3600.0;
            let wobble = 0.002 * ((i as f64) * 1.7).sin();
            batch(i, 0.5 * (0.3 * hours).exp() + wobble)
        })
        .collect()
}

#[rstest]
fn replay_is_bit_identical() {
    let readings = noisy_growth(400);
    let events = vec![
        dose(5 * 120, DosingKind::AddMedia),
        dose(5 * 120 + 2, DosingKind::RemoveWaste),
        dose(5 * 300 + 1, DosingKind::AddAltMedia),
    ];
    let run = || {
        let job = builder(calibrated(r#"{"1":0.5}"#)).try_build().unwrap();
        replay(job, readings.clone(), events.clone())
            .iter()
            .map(|e| {
                (
                    e.growth_rate.growth_rate.to_bits(),
                    e.od_filtered.od_filtered.to_bits(),
                    e.growth_rate.timestamp,
                )
            })
            .collect::<Vec<_>>()
    };
    let first = run();
    assert_eq!(first.len(), 400);
    assert_eq!(first, run());
}

#[rstest]
fn restart_seeds_from_cached_samples() {
    let mut store = calibrated(r#"{"1":0.5}"#);
    store.set("growth_rate", "exp", "1.0").unwrap();
    store.set("od_filtered", "exp", "1.00922563").unwrap();

    let job = builder(store).try_build().unwrap();
    let out = replay(job, vec![batch(0, 0.51), batch(1, 0.51)], vec![]);
    assert_eq!(out[0].growth_rate.growth_rate, 1.0);
    assert_eq!(out[0].od_filtered.od_filtered, 1.00922563);
    assert_eq!(out[0].kalman_filter_output.state, vec![1.00922563, 1.0, 0.0]);
    // the run continues from there rather than from a cold prior
    assert!((out[1].growth_rate.growth_rate - 1.0).abs() < 0.05);
}

#[rstest]
fn every_accepted_estimate_is_persisted_for_the_next_instance() {
    let store = calibrated(r#"{"1":0.5}"#);
    let first = replay(
        builder(store.clone()).try_build().unwrap(),
        noisy_growth(50),
        vec![],
    );
    let last = first.last().unwrap();
    assert_eq!(cached(&store, "growth_rate"), Some(last.growth_rate.growth_rate));
    assert_eq!(cached(&store, "od_filtered"), Some(last.od_filtered.od_filtered));

    let second = replay(
        builder(store.clone()).try_build().unwrap(),
        vec![batch(50, 0.6)],
        vec![],
    );
    assert_eq!(second[0].growth_rate.growth_rate, last.growth_rate.growth_rate);
    assert_eq!(second[0].od_filtered.od_filtered, last.od_filtered.od_filtered);
}

#[rstest]
fn outlier_is_rejected_and_previous_values_reemitted() {
    let store = calibrated(r#"{"1":0.5}"#);
    let publisher = MemoryPublisher::new();
    let job = builder(store.clone())
        .publisher(publisher.clone())
        .try_build()
        .unwrap();

    let mut readings: Vec<_> = (0..1000).map(|i| batch(i, 0.5)).collect();
    readings.push(batch(1000, 1.0));
    let mut stream = job
        .process(HistoricalSource::new(readings), HistoricalSource::empty())
        .unwrap();
    let out: Vec<_> = stream.by_ref().map(|r| r.unwrap()).collect();

    assert_eq!(out.len(), 1001);
    let before = &out[999];
    let spike = &out[1000];
    assert_eq!(spike.growth_rate.growth_rate, before.growth_rate.growth_rate);
    assert_eq!(spike.od_filtered.od_filtered, before.od_filtered.od_filtered);
    assert_eq!(spike.kalman_filter_output.state, before.kalman_filter_output.state);
    assert_eq!(spike.growth_rate.timestamp, t(5000));

    assert_eq!(stream.stats().rejected_outliers, 1);
    assert_eq!(stream.state(), JobState::Exhausted);
    // published, not persisted
    assert_eq!(publisher.payloads("growth_rate").len(), 1001);
    assert_eq!(cached(&store, "od_filtered"), Some(before.od_filtered.od_filtered));
}

#[rstest]
fn persistent_level_shift_is_eventually_accepted() {
    let mut cfg = EstimatorCfg::default();
    cfg.kalman.max_consecutive_outliers = 3;
    let job = builder(calibrated(r#"{"1":0.5}"#))
        .config(cfg)
        .try_build()
        .unwrap();

    let mut readings: Vec<_> = (0..200).map(|i| batch(i, 0.5)).collect();
    readings.extend((200..205).map(|i| batch(i, 1.0)));
    let mut stream = job
        .process(HistoricalSource::new(readings), HistoricalSource::empty())
        .unwrap();
    let out: Vec<_> = stream.by_ref().map(|r| r.unwrap()).collect();

    for i in 200..203 {
        assert_eq!(out[i].od_filtered.od_filtered, out[199].od_filtered.od_filtered);
    }
    assert!(out[203].od_filtered.od_filtered > out[199].od_filtered.od_filtered);
    assert!(stream.stats().rejected_outliers >= 3);
}

#[rstest]
fn disabled_gate_accepts_everything() {
    let mut cfg = EstimatorCfg::default();
    cfg.kalman.outlier_std_threshold = 0.0;
    let job = builder(calibrated(r#"{"1":0.5}"#))
        .config(cfg)
        .try_build()
        .unwrap();
    let mut readings: Vec<_> = (0..300).map(|i| batch(i, 0.5)).collect();
    readings.push(batch(300, 1.0));
    let out = replay(job, readings, vec![]);
    assert!(out[300].od_filtered.od_filtered > out[299].od_filtered.od_filtered);
}

#[rstest]
fn dosing_event_is_absorbed_without_moving_growth_rate() {
    let job = builder(calibrated(r#"{"1":0.5}"#)).try_build().unwrap();
    let mut readings: Vec<_> = (0..300).map(|i| batch(i, 0.5)).collect();
    // the dose dilutes the culture to 95 %
    readings.extend((300..700).map(|i| batch(i, 0.475)));
    let events = vec![dose(5 * 300, DosingKind::AddMedia)];

    let mut stream = job
        .process(HistoricalSource::new(readings), HistoricalSource::new(events))
        .unwrap();
    let out: Vec<_> = stream.by_ref().map(|r| r.unwrap()).collect();

    let rate_before = out[299].growth_rate.growth_rate;
    let max_dev = out[300..]
        .iter()
        .map(|e| (e.growth_rate.growth_rate - rate_before).abs())
        .fold(0.0, f64::max);
    assert!(max_dev < 0.01, "growth rate moved by {max_dev}");
    assert!((out[699].od_filtered.od_filtered - 0.95).abs() < 0.005);
    assert_eq!(stream.stats().rejected_outliers, 0);
    assert_eq!(stream.stats().dosing_events, 1);
}

#[rstest]
fn initialization_waits_for_a_complete_batch() {
    let store = calibrated(r#"{"1":0.5,"2":0.8}"#);
    let job = GrowthRateEstimationJob::builder()
        .experiment("exp")
        .channels(["1", "2"])
        .store(store)
        .try_build()
        .unwrap();
    let readings = vec![
        ReadingBatch::from_ods(t(0), [("1", 0.5)]),
        ReadingBatch::from_ods(t(5), [("1", 0.5), ("2", 0.8)]),
        ReadingBatch::from_ods(t(10), [("1", 0.5), ("2", 0.8)]),
    ];
    // before initialization: ignored
    let events = vec![dose(1, DosingKind::AddMedia)];

    let mut stream = job
        .process(HistoricalSource::new(readings), HistoricalSource::new(events))
        .unwrap();
    let out: Vec<_> = stream.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].growth_rate.timestamp, t(5));
    assert_eq!(out[0].kalman_filter_output.state.len(), 4);
    assert_eq!(stream.stats().skipped_batches, 1);
    assert_eq!(stream.stats().dosing_events, 0);
}

#[rstest]
fn channels_default_to_the_first_batch() {
    let store = calibrated(r#"{"1":0.5,"2":0.8}"#);
    let job = GrowthRateEstimationJob::builder()
        .experiment("exp")
        .store(store)
        .try_build()
        .unwrap();
    let readings = vec![ReadingBatch::from_ods(t(0), [("2", 0.8), ("1", 0.5)])];
    let mut stream = job
        .process(HistoricalSource::new(readings), HistoricalSource::empty())
        .unwrap();
    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.kalman_filter_output.state, vec![1.0, 1.0, 0.0, 0.0]);
    let names: Vec<_> = stream.channels().iter().map(|c| c.as_str()).collect();
    assert_eq!(names, ["1", "2"]);
    assert_eq!(stream.kalman_filter().map(|f| f.n_channels()), Some(2));
}

#[rstest]
fn geometric_pooling_of_an_empty_channel_still_persists() {
    let store = calibrated(r#"{"1":0.5,"2":0.8}"#);
    let job = builder(store.clone())
        .channels(["1", "2"])
        .reducer(GeometricMeanReducer)
        .try_build()
        .unwrap();
    let out = replay(
        job,
        vec![ReadingBatch::from_ods(t(0), [("1", 0.5), ("2", 0.0)])],
        vec![],
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].od_filtered.od_filtered, 0.5);
    assert_eq!(cached(&store, "od_filtered"), Some(0.5));
}

#[rstest]
fn numerical_instability_terminates_the_job() {
    let mut store = calibrated(r#"{"1":0.5}"#);
    store.set("growth_rate", "exp", "1e6").unwrap();
    let job = builder(store).try_build().unwrap();
    let mut stream = job
        .process(
            HistoricalSource::new((0..5).map(|i| batch(i, 0.5)).collect()),
            HistoricalSource::empty(),
        )
        .unwrap();

    assert!(stream.next().unwrap().is_ok());
    assert!(matches!(
        stream.next(),
        Some(Err(EstimationError::NumericalInstability(_)))
    ));
    assert!(stream.next().is_none());
    assert_eq!(stream.state(), JobState::Failed);
}

/// Reads work, writes fail.
struct ReadOnlyStore(MemoryStore);

impl KeyValueStore for ReadOnlyStore {
    fn get(
        &self,
        cache: &str,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        self.0.get(cache, key)
    }

    fn set(
        &mut self,
        _cache: &str,
        _key: &str,
        _value: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("read-only".into())
    }
}

#[rstest]
fn store_failure_is_reported_once_and_not_fatal() {
    let job = GrowthRateEstimationJob::builder()
        .experiment("exp")
        .store(ReadOnlyStore(calibrated(r#"{"1":0.5}"#)))
        .try_build()
        .unwrap();
    let mut stream = job
        .process(
            HistoricalSource::new((0..5).map(|i| batch(i, 0.5)).collect()),
            HistoricalSource::empty(),
        )
        .unwrap();
    let items: Vec<_> = stream.by_ref().collect();
    let oks = items.iter().filter(|r| r.is_ok()).count();
    let store_errs = items
        .iter()
        .filter(|r| matches!(r, Err(EstimationError::Store(_))))
        .count();
    assert_eq!(oks, 5);
    assert_eq!(store_errs, 1);
    assert_eq!(stream.state(), JobState::Exhausted);
}

#[rstest]
fn each_estimate_is_published_on_three_topics() {
    let publisher = MemoryPublisher::new();
    let job = builder(calibrated(r#"{"1":0.5}"#))
        .publisher(publisher.clone())
        .try_build()
        .unwrap();
    replay(job, (0..3).map(|i| batch(i, 0.5)).collect(), vec![]);

    let messages = publisher.messages();
    assert_eq!(messages.len(), 9);
    assert_eq!(
        messages[0].0,
        "bioreactor/unit-1/exp/growth_rate_calculating/growth_rate"
    );
    let payload: serde_json::Value =
        serde_json::from_str(&publisher.payloads("od_filtered")[0]).unwrap();
    assert_eq!(payload["od_filtered"], 1.0);
    assert!(payload["timestamp"].as_str().unwrap().starts_with("2024-03-01T12:00:00"));
    let kfo: serde_json::Value =
        serde_json::from_str(&publisher.payloads("kalman_filter_outputs")[0]).unwrap();
    assert_eq!(kfo["state"].as_array().unwrap().len(), 3);
    assert_eq!(kfo["covariance"].as_array().unwrap().len(), 3);
}

#[rstest]
fn live_run_bootstraps_and_persists_baseline() {
    let store = MemoryStore::new();
    let job = builder(store.clone()).try_build().unwrap();
    let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
    let (ev_feed, ev) = LiveSource::<DosingEvent>::channel();
    for i in 0..3 {
        od_feed.send(batch(i, 0.4)).unwrap();
    }
    drop(od_feed);
    drop(ev_feed);

    let mut stream = job.process(od, ev).unwrap();
    let out: Vec<_> = stream.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].od_filtered.od_filtered, 1.0);
    assert_eq!(stream.state(), JobState::Disconnected);
    assert_eq!(
        store.get("od_normalization_mean", "exp").unwrap().as_deref(),
        Some(r#"{"1":0.4}"#)
    );
}

#[rstest]
fn live_and_historical_runs_agree() {
    let readings = noisy_growth(120);
    // ties with batch 60, so both modes see it right before that batch
    let event = dose(5 * 60, DosingKind::AddMedia);

    let historical = replay(
        builder(calibrated(r#"{"1":0.5}"#)).try_build().unwrap(),
        readings.clone(),
        vec![event.clone()],
    );

    let clock = ManualClock::new();
    let job = builder(calibrated(r#"{"1":0.5}"#))
        .clock(clock.clone())
        .try_build()
        .unwrap();
    let (od_feed, od) = LiveSource::<ReadingBatch>::channel();
    let (ev_feed, ev) = LiveSource::<DosingEvent>::channel();
    let mut stream = job.process(od, ev).unwrap();
    let mut live = Vec::new();
    for (i, b) in readings.into_iter().enumerate() {
        if i > 0 {
            clock.advance(Duration::from_secs(5));
        }
        if i == 60 {
            ev_feed.send(event.clone()).unwrap();
        }
        od_feed.send(b).unwrap();
        live.push(stream.next().unwrap().unwrap());
    }
    drop(od_feed);
    assert!(stream.next().is_none());

    let bits = |v: &[GrowthEstimate]| {
        v.iter()
            .map(|e| {
                (
                    e.growth_rate.growth_rate.to_bits(),
                    e.od_filtered.od_filtered.to_bits(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(bits(&historical), bits(&live));
}
