mod common;

use chrono::Utc;

use gridiron_ensemble::features::{build_differential_features, build_features};
use gridiron_ensemble::models::set::WarmStart;
use gridiron_ensemble::temporal::WeekKey;
use gridiron_ensemble::trainer::{WeekOutcome, WeeklyTrainer, record_week_run};
use gridiron_ensemble::training_state::{
    BootstrapRequirement, CURRENT_REVISION, ChunkRecord, JsonStateStore, MODEL_TRAINING,
    SeasonCoverage, TrainingState, TrainingStateStore, mark_bootstrap_completed,
    should_run_historical_bootstrap,
};

fn full_chunk() -> ChunkRecord {
    ChunkRecord {
        start_season: 1999,
        end_season: 2001,
        seasons: (1999..=2001)
            .map(|season| SeasonCoverage {
                season,
                weeks: (1..=17).collect(),
                scheduled: (1..=17).collect(),
            })
            .collect(),
    }
}

fn through(season: i32) -> BootstrapRequirement {
    BootstrapRequirement {
        min_season: 1999,
        required_through_season: season,
        force: false,
    }
}

#[test]
fn covered_window_needs_no_bootstrap() {
    let state = mark_bootstrap_completed(&TrainingState::default(), MODEL_TRAINING, full_chunk(), Utc::now());
    assert!(!should_run_historical_bootstrap(&state, MODEL_TRAINING, &through(2001)));
}

#[test]
fn revision_mismatch_wins_over_any_coverage() {
    let state = mark_bootstrap_completed(&TrainingState::default(), MODEL_TRAINING, full_chunk(), Utc::now());
    let json = serde_json::to_string(&state)
        .expect("serialize")
        .replace(CURRENT_REVISION, "legacy-0");
    let stale: TrainingState = serde_json::from_str(&json).expect("parse");
    assert_eq!(
        stale.pipeline(MODEL_TRAINING).and_then(|r| r.revision()),
        Some("legacy-0")
    );
    for season in 1999..=2001 {
        assert!(should_run_historical_bootstrap(&stale, MODEL_TRAINING, &through(season)));
    }
}

#[test]
fn season_replayed_only_partway_still_needs_bootstrap() {
    let mut chunk = full_chunk();
    // Crash after week 11 of 2001.
    chunk.seasons[2].weeks.truncate(11);
    let state = mark_bootstrap_completed(&TrainingState::default(), MODEL_TRAINING, chunk, Utc::now());
    assert!(!should_run_historical_bootstrap(&state, MODEL_TRAINING, &through(2000)));
    assert!(should_run_historical_bootstrap(&state, MODEL_TRAINING, &through(2001)));

    let finished = mark_bootstrap_completed(&state, MODEL_TRAINING, full_chunk(), Utc::now());
    assert!(!should_run_historical_bootstrap(&finished, MODEL_TRAINING, &through(2001)));
}

#[test]
fn latest_run_moves_only_for_weeks_with_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2022);
    let tables = vec![common::season(2022, 6, 6)];
    let team_rows = build_features(&tables);
    let diff_rows = build_differential_features(&tables);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());

    let trained_week = WeekKey::new(2022, 4);
    let trained = trainer
        .run_week(trained_week, &team_rows, &diff_rows, WarmStart::default())
        .expect("train");
    assert!(matches!(trained, WeekOutcome::Trained(_)));
    assert!(record_week_run(&state_store, trained_week, &trained).expect("record"));

    // Nothing is scheduled after week 6.
    let empty_week = WeekKey::new(2022, 7);
    let skipped = trainer
        .run_week(empty_week, &team_rows, &diff_rows, WarmStart::default())
        .expect("skip");
    assert!(matches!(skipped, WeekOutcome::Skipped { .. }));
    assert!(!record_week_run(&state_store, empty_week, &skipped).expect("record"));

    let latest = state_store
        .load()
        .pipeline(MODEL_TRAINING)
        .and_then(|r| r.latest_run().map(|run| run.week_key()));
    assert_eq!(latest, Some(trained_week));
}
