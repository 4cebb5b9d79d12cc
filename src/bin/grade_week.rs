use anyhow::{Context, Result};

use gridiron_ensemble::artifacts::ArtifactStore;
use gridiron_ensemble::config::TrainerConfig;
use gridiron_ensemble::dataset::open_dir_source;
use gridiron_ensemble::logging;
use gridiron_ensemble::models::ModelKind;
use gridiron_ensemble::outcomes::grade_week;

fn main() -> Result<()> {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    logging::init();

    let cfg = TrainerConfig::from_env();
    let week = cfg
        .target
        .context("TARGET_SEASON and TARGET_WEEK must both be set")?;
    let source = open_dir_source(&cfg.data_dir);
    let tables = source
        .load_season(week.season)
        .with_context(|| format!("failed to load season {}", week.season))?;
    let store = ArtifactStore::new(&cfg.artifact_dir);

    let Some((outcomes, metrics)) = grade_week(&store, week, &tables.schedules)? else {
        println!("No final scores yet for {week}");
        return Ok(());
    };

    println!("Graded {week}: {} games", outcomes.games.len());
    for kind in ModelKind::ALL {
        let m = metrics.per_model.get(kind).metrics;
        println!(
            "  {:<14} log-loss {:.4}  brier {:.4}  auc {:.3}  acc {:.3}",
            kind.name(),
            m.log_loss,
            m.brier,
            m.auc,
            m.accuracy
        );
    }
    for (label, report) in [("blended", &metrics.blended), ("calibrated", &metrics.calibrated)] {
        let m = report.metrics;
        println!(
            "  {:<14} log-loss {:.4}  brier {:.4}  auc {:.3}  acc {:.3}  ece {:.3}",
            label, m.log_loss, m.brier, m.auc, m.accuracy, report.ece
        );
    }
    Ok(())
}
