use anyhow::{Context, Result};

use gridiron_ensemble::artifacts::{ArtifactStore, read_json};
use gridiron_ensemble::bootstrap::{HistoricalBootstrap, RowLoader};
use gridiron_ensemble::config::TrainerConfig;
use gridiron_ensemble::dataset::open_dir_source;
use gridiron_ensemble::logging;
use gridiron_ensemble::models::set::WarmStart;
use gridiron_ensemble::outcomes::grade_week;
use gridiron_ensemble::temporal::WeekKey;
use gridiron_ensemble::trainer::{ModelRecord, WeekOutcome, WeeklyTrainer, record_week_run};
use gridiron_ensemble::training_state::{CURRENT_REVISION, JsonStateStore};

fn main() -> Result<()> {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    logging::init();

    let cfg = TrainerConfig::from_env();
    let target = cfg
        .target
        .context("TARGET_SEASON and TARGET_WEEK must both be set")?;

    let source = open_dir_source(&cfg.data_dir);
    let store = ArtifactStore::new(&cfg.artifact_dir);
    let state_store = JsonStateStore::new(store.training_state_path());
    let trainer = WeeklyTrainer::with_store(&cfg, store.clone());

    let summary = HistoricalBootstrap::new(&cfg, source.as_ref(), &trainer, &state_store)
        .run(target.season - 1)?;
    if summary.ran {
        println!(
            "Historical bootstrap: chunks {}/{} run ({} incomplete), weeks trained={} cached={} skipped={} resumed={}",
            summary.chunks_planned - summary.chunks_skipped,
            summary.chunks_planned,
            summary.chunks_incomplete,
            summary.weeks_trained,
            summary.weeks_cached,
            summary.weeks_skipped,
            summary.weeks_resumed
        );
        if !summary.unavailable_seasons.is_empty() {
            println!("Unavailable seasons: {:?}", summary.unavailable_seasons);
        }
    }

    let rows = RowLoader::new(source.as_ref(), &store, &cfg)
        .load(target.season - cfg.train_lookback_seasons.max(0)..=target.season)?;

    let prior: Option<ModelRecord> = match target.week {
        0 | 1 => None,
        w => read_json(&store.model_path(WeekKey::new(target.season, w - 1)))?
            .filter(|m: &ModelRecord| m.revision == CURRENT_REVISION),
    };
    let checkpoint = store.checkpoint()?.filter(|c| c.trained_for < target);
    let warm = WarmStart {
        logistic: prior.as_ref().map(|m| &m.models.logistic),
        bradley_terry: prior.as_ref().map(|m| &m.models.bradley_terry),
        ann: prior
            .as_ref()
            .map(|m| &m.models.ann)
            .or(checkpoint.as_ref().map(|c| &c.ann)),
    };

    let outcome = trainer.run_week(target, &rows.team_rows, &rows.diff_rows, warm)?;
    match &outcome {
        WeekOutcome::Skipped { reason } => println!("Week {target} skipped: {reason}"),
        WeekOutcome::Trained(week) | WeekOutcome::Cached(week) => {
            let label = if matches!(outcome, WeekOutcome::Cached(_)) { "cached" } else { "trained" };
            let w = &week.diagnostics.weights;
            println!(
                "Week {target} {label}: {} games, weights lr={:.2} tree={:.2} bt={:.2} ann={:.2}",
                week.predictions.len(),
                w.logistic,
                w.tree,
                w.bradley_terry,
                w.ann
            );
            for pred in &week.predictions {
                println!("  {}", pred.narrative);
            }
        }
    }
    if let Some(ann) = outcome.ann().filter(|a| !a.committees.is_empty())
        && store.checkpoint()?.is_none_or(|c| c.trained_for <= target)
    {
        store.write_checkpoint(target, ann)?;
    }
    record_week_run(&state_store, target, &outcome)?;

    if target.week > 1 {
        let previous = WeekKey::new(target.season, target.week - 1);
        if store.predictions_path(previous).exists() {
            let tables = source.load_season(target.season)?;
            if let Some((_, metrics)) = grade_week(&store, previous, &tables.schedules)? {
                println!(
                    "Graded {previous}: {} games, log-loss {:.4}, brier {:.4}",
                    metrics.games, metrics.calibrated.metrics.log_loss, metrics.calibrated.metrics.brier
                );
            }
        }
    }
    Ok(())
}
