mod common;

use gridiron_ensemble::artifacts::read_json;
use gridiron_ensemble::features::{build_differential_features, build_features};
use gridiron_ensemble::models::set::WarmStart;
use gridiron_ensemble::temporal::WeekKey;
use gridiron_ensemble::trainer::{GamePrediction, WeekOutcome, WeeklyTrainer};

#[test]
fn reported_paired_comparison_probability_is_the_bootstrap_mean() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2022);
    let tables = vec![common::season(2022, 8, 8)];
    let team_rows = build_features(&tables);
    let diff_rows = build_differential_features(&tables);
    let trainer = WeeklyTrainer::new(&cfg);

    let target = WeekKey::new(2022, 7);
    let outcome = trainer
        .train_week(target, &team_rows, &diff_rows, WarmStart::default())
        .expect("train");
    let WeekOutcome::Trained(week) = outcome else {
        panic!("expected a trained week, got {outcome:?}");
    };

    let simulated = week.predictions.iter().filter(|p| !p.interval.fallback).count();
    assert!(simulated > 0, "six weeks of history should allow resampling");
    for pred in &week.predictions {
        assert_eq!(
            pred.probabilities.bradley_terry, pred.interval.mean,
            "{} reports a probability the interval is not centred on",
            pred.game_id
        );
        assert!(pred.interval.lower <= pred.interval.upper);
    }

    let stored: Vec<GamePrediction> = read_json(&trainer.store().predictions_path(target))
        .expect("read")
        .expect("predictions written");
    for pred in &stored {
        assert!((pred.probabilities.bradley_terry - pred.interval.mean).abs() < 1e-12);
    }
}
