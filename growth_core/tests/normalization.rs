use approx::assert_abs_diff_eq;
use growth_core::{ChannelId, ChannelMap, MemoryStore, NormalizationModel};
use growth_traits::KeyValueStore;
use rstest::rstest;

fn map(pairs: &[(&str, f64)]) -> ChannelMap {
    pairs.iter().map(|(k, v)| (ChannelId::from(*k), *v)).collect()
}

#[rstest]
fn blank_offsets_both_reading_and_mean() {
    let model = NormalizationModel::new(
        map(&[("1", 0.5), ("2", 0.8)]),
        ChannelMap::new(),
        map(&[("1", 0.25), ("2", 0.4)]),
    );
    let out = model.normalize(&map(&[("1", 0.6), ("2", 1.0)])).unwrap();
    assert_abs_diff_eq!(out[&ChannelId::from("1")], 1.4, epsilon = 1e-9);
    assert_abs_diff_eq!(out[&ChannelId::from("2")], 1.5, epsilon = 1e-9);
}

#[rstest]
#[case(&[("1", 0.5), ("2", 2.0)])]
#[case(&[("2", 2.0), ("1", 0.5)])]
fn missing_blank_reduces_to_ratio_in_any_key_order(#[case] input: &[(&str, f64)]) {
    let model = NormalizationModel::new(
        map(&[("1", 2.0), ("2", 1.0)]),
        ChannelMap::new(),
        ChannelMap::new(),
    );
    let out = model.normalize(&map(input)).unwrap();
    let keys: Vec<_> = out.keys().map(ChannelId::as_str).collect();
    assert_eq!(keys, ["1", "2"]);
    assert_abs_diff_eq!(out[&ChannelId::from("1")], 0.25, epsilon = 1e-9);
    assert_abs_diff_eq!(out[&ChannelId::from("2")], 2.0, epsilon = 1e-9);
}

#[rstest]
fn unknown_channel_cannot_be_normalized() {
    let model = NormalizationModel::new(map(&[("1", 0.5)]), ChannelMap::new(), ChannelMap::new());
    assert!(model.normalize(&map(&[("3", 0.5)])).is_err());
}

#[rstest]
fn bootstrap_uses_first_reading_as_mean() {
    let first = map(&[("1", 0.42), ("2", 0.9)]);
    let model = NormalizationModel::bootstrap(&first, 2e-6, map(&[("1", 0.02)]));
    assert_eq!(model.mean(), &first);
    assert_eq!(model.variance(), &map(&[("1", 2e-6), ("2", 2e-6)]));

    let out = model.normalize(&first).unwrap();
    assert!(out.values().all(|v| (v - 1.0).abs() < 1e-12));
}

#[rstest]
fn baseline_is_read_from_the_experiment_caches() {
    let mut store = MemoryStore::new();
    store
        .set("od_normalization_mean", "exp-a", r#"{"1":0.5,"2":0.8}"#)
        .unwrap();
    store
        .set("od_normalization_variance", "exp-a", r#"{"1":1e-6,"2":4e-6}"#)
        .unwrap();
    store.set("od_blank", "exp-a", r#"{"1":0.25}"#).unwrap();
    // another experiment does not leak in
    store
        .set("od_normalization_mean", "exp-b", r#"{"1":9.0}"#)
        .unwrap();

    let model = NormalizationModel::load(&store, "exp-a", 1e-6)
        .unwrap()
        .expect("baseline present");
    assert_eq!(model.mean(), &map(&[("1", 0.5), ("2", 0.8)]));
    assert_eq!(model.blank(&ChannelId::from("1")), 0.25);
    assert_eq!(model.blank(&ChannelId::from("2")), 0.0);
}
