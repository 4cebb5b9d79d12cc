mod common;

use std::fs;

use gridiron_ensemble::artifacts::ArtifactStore;
use gridiron_ensemble::bootstrap::HistoricalBootstrap;
use gridiron_ensemble::error::TrainerError;
use gridiron_ensemble::temporal::WeekKey;
use gridiron_ensemble::trainer::WeeklyTrainer;
use gridiron_ensemble::training_state::{
    BootstrapRequirement, JsonStateStore, MODEL_TRAINING, TrainingStateStore,
    should_run_historical_bootstrap,
};

const WEEKS: u32 = 5;

#[test]
fn second_replay_trains_nothing_and_keeps_coverage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2010);
    let source = common::source(2010, 2011, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());

    let first = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2011)
        .expect("first run");
    assert!(first.ran);
    assert_eq!(first.chunks_planned, 2);
    assert_eq!(first.weeks_trained + first.weeks_skipped, 2 * WEEKS as usize);
    assert!(first.weeks_trained > 0);
    let after_first = state_store.load();

    let second = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2011)
        .expect("second run");
    assert!(!second.ran);
    assert_eq!(second.weeks_trained, 0);

    let after_second = state_store.load();
    let record = after_second.pipeline(MODEL_TRAINING).expect("record");
    for season in [2010, 2011] {
        assert_eq!(
            record.completed_weeks(season).map(|w| w.len()),
            Some(WEEKS as usize)
        );
        assert_eq!(
            record.completed_weeks(season),
            after_first.pipeline(MODEL_TRAINING).and_then(|r| r.completed_weeks(season))
        );
    }
    assert_eq!(
        record.latest_run().map(|r| r.week_key()),
        Some(WeekKey::new(2011, WEEKS))
    );
    let req = BootstrapRequirement {
        min_season: 2010,
        required_through_season: 2011,
        force: false,
    };
    assert!(!should_run_historical_bootstrap(&after_second, MODEL_TRAINING, &req));
}

#[test]
fn interrupted_replay_resumes_from_week_markers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2010);
    let source = common::source(2010, 2010, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());
    HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2010)
        .expect("first run");

    // Simulate a crash after the weeks were marked but before the chunk was.
    let store = ArtifactStore::new(dir.path());
    fs::remove_file(store.chunk_path(2010, 2010)).expect("remove chunk marker");
    fs::remove_file(store.training_state_path()).expect("remove state");
    fs::remove_file(store.status_path(WeekKey::new(2010, WEEKS))).expect("remove last marker");

    let resumed = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2010)
        .expect("resume");
    assert!(resumed.ran);
    assert_eq!(resumed.weeks_resumed, WEEKS as usize - 1);
    // The unmarked week's artifacts are still on disk with a matching hash.
    assert_eq!(resumed.weeks_trained, 0);
    assert_eq!(resumed.weeks_cached, 1);
    assert!(store.chunk_path(2010, 2010).exists());
}

#[test]
fn forced_rebuild_revisits_every_week_but_reuses_matching_artifacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = common::quick_config(dir.path(), 2010);
    let source = common::source(2010, 2010, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());
    let first = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2010)
        .expect("first run");

    cfg.force_historical = true;
    let forced = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2010)
        .expect("forced run");
    assert!(forced.ran);
    assert_eq!(forced.weeks_resumed, 0);
    assert_eq!(forced.weeks_trained, 0);
    assert_eq!(forced.weeks_cached, first.weeks_trained);
}

#[test]
fn explicit_window_spanning_chunks_is_rejected_before_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = common::quick_config(dir.path(), 2010);
    cfg.batch_start_season = Some(2010);
    cfg.batch_end_season = Some(2012);
    let source = common::source(2010, 2012, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());

    let err = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2012)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainerError>(),
        Some(TrainerError::ExplicitWindowInvalid { start: 2010, end: 2012, .. })
    ));
    assert!(!trainer.store().training_state_path().exists());
    assert!(!trainer.store().status_path(WeekKey::new(2010, 2)).exists());
}

#[test]
fn season_missing_from_the_source_is_retried_once_it_appears() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = common::quick_config(dir.path(), 2010);
    let mut source = common::source(2011, 2011, WEEKS);
    let trainer = WeeklyTrainer::new(&cfg);
    let state_store = JsonStateStore::new(trainer.store().training_state_path());

    let first = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2011)
        .expect("first run");
    assert_eq!(first.unavailable_seasons, vec![2010]);
    assert_eq!(first.chunks_incomplete, 1);
    assert!(!trainer.store().chunk_path(2010, 2010).exists());
    assert!(trainer.store().chunk_path(2011, 2011).exists());
    let record = state_store.load();
    let record = record.pipeline(MODEL_TRAINING).expect("record");
    assert!(!record.covers_season(2010));
    assert!(!record.has_chunk(2010, 2010));
    assert!(record.covers_season(2011));

    source.insert(common::season(2010, WEEKS, WEEKS));
    let second = HistoricalBootstrap::new(&cfg, &source, &trainer, &state_store)
        .run(2011)
        .expect("second run");
    assert!(second.ran);
    assert_eq!(second.chunks_skipped, 1);
    assert_eq!(second.chunks_incomplete, 0);
    assert_eq!(second.weeks_trained + second.weeks_skipped, WEEKS as usize);
    assert!(trainer.store().chunk_path(2010, 2010).exists());

    let after = state_store.load();
    let record = after.pipeline(MODEL_TRAINING).expect("record");
    assert_eq!(record.completed_weeks(2010).map(|w| w.len()), Some(WEEKS as usize));
    let req = BootstrapRequirement {
        min_season: 2010,
        required_through_season: 2011,
        force: false,
    };
    assert!(!should_run_historical_bootstrap(&after, MODEL_TRAINING, &req));
}
