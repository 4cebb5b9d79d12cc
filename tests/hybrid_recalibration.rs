mod common;

use gridiron_ensemble::artifacts::{ArtifactStore, read_json, write_json_atomic};
use gridiron_ensemble::bootstrap::HistoricalBootstrap;
use gridiron_ensemble::error::TrainerError;
use gridiron_ensemble::hybrid::{HybridRecalibrator, HybridRecord, WeightSource};
use gridiron_ensemble::outcomes::grade_week;
use gridiron_ensemble::stacking::BlendWeights;
use gridiron_ensemble::temporal::WeekKey;
use gridiron_ensemble::trainer::{Diagnostics, GamePrediction, WeeklyTrainer};
use gridiron_ensemble::training_state::{HYBRID_V2, JsonStateStore, TrainingStateStore};

const WEEKS: u32 = 6;

#[test]
fn missing_model_artifact_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2015);
    let store = ArtifactStore::new(dir.path());
    let state_store = JsonStateStore::new(store.training_state_path());

    let err = HybridRecalibrator::new(&cfg, &store, &state_store)
        .run(WeekKey::new(2015, 3))
        .unwrap_err();
    let typed = err.downcast_ref::<TrainerError>().expect("typed error");
    assert!(matches!(typed, TrainerError::MissingArtifact { .. }));
    assert!(typed.is_fatal());
    assert!(!store.hybrid_path(WeekKey::new(2015, 3)).exists());
}

#[test]
fn recalibrates_from_graded_window_then_reuses_the_fit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = common::quick_config(dir.path(), 2015);
    let tables = common::season(2015, WEEKS, WEEKS);
    let source = common::source(2015, 2015, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());
    HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2015)
        .expect("bootstrap");

    let store = trainer.store();
    for week in 2..WEEKS {
        grade_week(store, WeekKey::new(2015, week), &tables.schedules)
            .expect("grade")
            .expect("final scores");
    }

    let target = WeekKey::new(2015, WEEKS);
    let first = HybridRecalibrator::new(&cfg, store, &state_store)
        .run(target)
        .expect("hybrid");
    assert!(first.refit);
    assert!(first.window_games > 0);
    assert!(first.window_weeks.len() <= cfg.hybrid_window_weeks);
    assert!(first.window_weeks.iter().all(|w| *w < target));
    assert!((first.weights.sum() - 1.0).abs() < 1e-6);
    assert_eq!(first.predictions.len(), common::TEAMS.len() / 2);
    assert!(store.hybrid_path(target).exists());
    let run = state_store
        .load()
        .pipeline(HYBRID_V2)
        .and_then(|r| r.latest_run().cloned())
        .expect("hybrid latest run");
    assert_eq!(run.week_key(), target);

    let again = HybridRecalibrator::new(&cfg, store, &state_store)
        .run(target)
        .expect("hybrid again");
    if first.calibration.is_some() {
        assert!(!again.refit);
        assert_eq!(again.calibration, first.calibration);
    } else {
        // Nothing to reuse yet.
        assert!(again.refit);
    }

    cfg.force_hybrid = true;
    let forced = HybridRecalibrator::new(&cfg, store, &state_store)
        .run(target)
        .expect("forced hybrid");
    assert!(forced.refit);
}

#[test]
fn collapsed_network_loses_weight_to_the_other_models() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2015);
    let source = common::source(2015, 2015, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());
    HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2015)
        .expect("bootstrap");
    let store = trainer.store();

    // The prior week's blend settled entirely on a network whose OOF output
    // barely moved.
    let prior = WeekKey::new(2015, WEEKS - 1);
    let mut diag: Diagnostics = read_json(&store.diagnostics_path(prior))
        .expect("read")
        .expect("prior diagnostics");
    diag.weights = BlendWeights::from_array([0.0, 0.0, 0.0, 1.0]);
    diag.oof_variance.ann = 0.002;
    write_json_atomic(&store.diagnostics_path(prior), &diag).expect("write");

    let target = WeekKey::new(2015, WEEKS);
    let record = HybridRecalibrator::new(&cfg, store, &state_store)
        .run(target)
        .expect("hybrid");
    assert_eq!(record.weight_source, WeightSource::PriorDiagnostics);
    assert!(record.diversity_guard_applied);

    let persisted: HybridRecord = read_json(&store.hybrid_path(target))
        .expect("read")
        .expect("hybrid written");
    assert!(persisted.diversity_guard_applied);
    let w = persisted.weights;
    assert!((w.ann - 0.6).abs() < 1e-9, "{w:?}");
    for share in [w.logistic, w.tree, w.bradley_terry] {
        assert!((share - 0.4 / 3.0).abs() < 1e-9, "{w:?}");
    }

    let predictions: Vec<GamePrediction> = read_json(&store.predictions_path(target))
        .expect("read")
        .expect("predictions");
    for (hybrid, pred) in persisted.predictions.iter().zip(&predictions) {
        assert_eq!(hybrid.game_id, pred.game_id);
        let expected = w.blend(&pred.probabilities.to_array());
        assert!((hybrid.blended - expected).abs() < 1e-9);
    }

    // A network with real spread keeps the weight it earned.
    diag.oof_variance.ann = 0.05;
    write_json_atomic(&store.diagnostics_path(prior), &diag).expect("write");
    let kept = HybridRecalibrator::new(&cfg, store, &state_store)
        .run(target)
        .expect("hybrid");
    assert!(!kept.diversity_guard_applied);
    assert!((kept.weights.ann - 1.0).abs() < 1e-9);
}
