use chrono::{TimeZone, Utc};
use growth_core::{GrowthRateEstimationJob, HistoricalSource, JsonFileStore, ReadingBatch};
use growth_traits::KeyValueStore;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

fn batches(n: i64, od: f64) -> Vec<ReadingBatch> {
    (0..n)
        .map(|i| {
            let ts = Utc.timestamp_opt(1_709_294_400 + 5 * i, 0).unwrap();
            ReadingBatch::from_ods(ts, [("1", od)])
        })
        .collect()
}

#[rstest]
fn experiments_share_cache_files_without_clobbering(dir: TempDir) {
    let mut store = JsonFileStore::open(dir.path()).unwrap();
    store.set("growth_rate", "exp-a", "0.1").unwrap();
    store.set("growth_rate", "exp-b", "0.2").unwrap();

    let reopened = JsonFileStore::open(dir.path()).unwrap();
    assert_eq!(reopened.get("growth_rate", "exp-a").unwrap().as_deref(), Some("0.1"));
    assert_eq!(reopened.get("growth_rate", "exp-b").unwrap().as_deref(), Some("0.2"));
    assert_eq!(reopened.get("od_filtered", "exp-a").unwrap(), None);
    assert!(dir.path().join("growth_rate.json").exists());
}

#[rstest]
fn restarted_job_resumes_from_files(dir: TempDir) {
    let mut store = JsonFileStore::open(dir.path()).unwrap();
    store
        .set("od_normalization_mean", "exp", r#"{"1":0.5}"#)
        .unwrap();

    let run = |readings: Vec<ReadingBatch>| {
        let job = GrowthRateEstimationJob::builder()
            .experiment("exp")
            .store(JsonFileStore::open(dir.path()).unwrap())
            .try_build()
            .unwrap();
        job.process(HistoricalSource::new(readings), HistoricalSource::empty())
            .unwrap()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
    };

    let first = run(batches(30, 0.52));
    let last = first.last().unwrap();
    let second = run(batches(1, 0.52));
    assert_eq!(second[0].growth_rate.growth_rate, last.growth_rate.growth_rate);
    assert_eq!(second[0].od_filtered.od_filtered, last.od_filtered.od_filtered);
}
