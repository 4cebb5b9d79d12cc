use std::process::ExitCode;

use anyhow::{Context, Result};

use gridiron_ensemble::artifacts::ArtifactStore;
use gridiron_ensemble::config::TrainerConfig;
use gridiron_ensemble::error::TrainerError;
use gridiron_ensemble::hybrid::{HybridRecalibrator, HybridRecord};
use gridiron_ensemble::logging;
use gridiron_ensemble::training_state::JsonStateStore;

fn main() -> ExitCode {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    logging::init();

    match run() {
        Ok(record) => {
            println!(
                "Hybrid {}_W{:02}: weights lr={:.2} tree={:.2} bt={:.2} ann={:.2}{}",
                record.season,
                record.week,
                record.weights.logistic,
                record.weights.tree,
                record.weights.bradley_terry,
                record.weights.ann,
                if record.diversity_guard_applied { " (ann diversity guard)" } else { "" }
            );
            match record.calibration {
                Some(cal) => println!(
                    "Calibration beta={:.4} intercept={:.4} ({}, {} games over {} weeks)",
                    cal.beta,
                    cal.intercept,
                    if record.refit { "refit" } else { "cached" },
                    record.window_games,
                    record.window_weeks.len()
                ),
                None => println!("Calibration: identity"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(TrainerError::MissingArtifact { path }) = err.downcast_ref::<TrainerError>() {
                eprintln!("hybrid recalibration needs {}: run training for this week first", path.display());
            } else {
                eprintln!("hybrid recalibration failed: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<HybridRecord> {
    let cfg = TrainerConfig::from_env();
    let week = cfg
        .target
        .context("TARGET_SEASON and TARGET_WEEK must both be set")?;
    let store = ArtifactStore::new(&cfg.artifact_dir);
    let state_store = JsonStateStore::new(store.training_state_path());
    HybridRecalibrator::new(&cfg, &store, &state_store).run(week)
}
