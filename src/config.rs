use std::env;
use std::path::PathBuf;

use crate::models::ann::AnnConfig;
use crate::models::bradley_terry::BradleyTerryConfig;
use crate::models::logistic::LogisticConfig;
use crate::models::tree::TreeConfig;
use crate::temporal::WeekKey;

pub const DEFAULT_MIN_SEASON: i32 = 1999;
pub const DEFAULT_MAX_SUPPORTED_SEASON: i32 = 2100;
pub const MAX_BT_DRAWS: usize = 500;

const FORCE_HISTORICAL_KEYS: [&str; 4] = [
    "REWRITE_HISTORICAL",
    "OVERWRITE_HISTORICAL",
    "REBUILD_HISTORICAL",
    "REGENERATE_HISTORICAL",
];

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub artifact_dir: PathBuf,
    pub data_dir: PathBuf,
    pub target: Option<WeekKey>,
    pub batch_start_season: Option<i32>,
    pub batch_end_season: Option<i32>,
    pub min_season: i32,
    pub max_supported_season: i32,
    pub chunk_max_seasons: usize,
    pub season_load_concurrency: usize,
    pub train_concurrency: usize,
    pub train_lookback_seasons: i32,
    pub min_train_games: usize,
    pub hybrid_window_weeks: usize,
    pub force_historical: bool,
    pub force_hybrid: bool,
    pub logistic: LogisticConfig,
    pub tree: TreeConfig,
    pub bradley_terry: BradleyTerryConfig,
    pub ann: AnnConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            data_dir: PathBuf::from("data"),
            target: None,
            batch_start_season: None,
            batch_end_season: None,
            min_season: DEFAULT_MIN_SEASON,
            max_supported_season: DEFAULT_MAX_SUPPORTED_SEASON,
            chunk_max_seasons: 3,
            season_load_concurrency: 4,
            train_concurrency: 2,
            train_lookback_seasons: 3,
            min_train_games: 8,
            hybrid_window_weeks: 5,
            force_historical: false,
            force_hybrid: false,
            logistic: LogisticConfig::default(),
            tree: TreeConfig::default(),
            bradley_terry: BradleyTerryConfig::default(),
            ann: AnnConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparseable values fall back to
    /// defaults; parsed values are clamped to sane ranges.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let parse_i32 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i32>().ok());
        let parse_u32 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u32>().ok());
        let parse_usize = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let parse_f64 = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };
        let flag = |key: &str| lookup(key).is_some_and(|v| is_truthy(&v));

        let target = match (parse_i32("TARGET_SEASON"), parse_u32("TARGET_WEEK")) {
            (Some(season), Some(week)) if week >= 1 => Some(WeekKey::new(season, week)),
            _ => None,
        };

        let mut ann = d.ann.clone();
        if let Some(seeds) = parse_usize("ANN_SEEDS") {
            ann.seeds = seeds.clamp(1, 64);
            ann.keep_top = ann.keep_top.min(ann.seeds);
        }
        if let Some(epochs) = parse_usize("ANN_EPOCHS") {
            ann.max_epochs = epochs.clamp(1, 5000);
        }
        if let Some(dropout) = parse_f64("ANN_DROPOUT") {
            ann.dropout = dropout.clamp(0.0, 0.8);
        }
        if let Some(patience) = parse_usize("ANN_PATIENCE") {
            ann.patience = patience.clamp(1, 500);
        }
        if let Some(limit) = parse_u64("ANN_TIME_LIMIT_MS") {
            ann.time_limit_ms = Some(limit.max(1));
        }
        if let Some(hidden) = lookup("ANN_HIDDEN").and_then(|raw| parse_hidden(&raw)) {
            ann.hidden = hidden;
        }

        let mut bradley_terry = d.bradley_terry.clone();
        if let Some(lr) = parse_f64("BT_LEARNING_RATE") {
            bradley_terry.logistic.learning_rate = lr.clamp(1e-5, 5.0);
        }
        if let Some(l2) = parse_f64("BT_L2") {
            bradley_terry.logistic.l2 = l2.clamp(0.0, 10.0);
        }
        if let Some(draws) = parse_usize("BT_DRAWS") {
            bradley_terry.draws = draws.clamp(1, MAX_BT_DRAWS);
        }

        Self {
            artifact_dir: lookup("ARTIFACT_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.artifact_dir),
            data_dir: lookup("DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            target,
            batch_start_season: parse_i32("BATCH_START_SEASON"),
            batch_end_season: parse_i32("BATCH_END_SEASON"),
            min_season: parse_i32("MIN_SEASON").unwrap_or(d.min_season),
            max_supported_season: parse_i32("MAX_SUPPORTED_SEASON")
                .unwrap_or(d.max_supported_season),
            chunk_max_seasons: parse_usize("CHUNK_MAX_SEASONS")
                .unwrap_or(d.chunk_max_seasons)
                .clamp(1, 10),
            season_load_concurrency: parse_usize("SEASON_LOAD_CONCURRENCY")
                .unwrap_or(d.season_load_concurrency)
                .clamp(1, 32),
            train_concurrency: parse_usize("TRAIN_CONCURRENCY")
                .unwrap_or(d.train_concurrency)
                .clamp(1, 16),
            train_lookback_seasons: parse_i32("TRAIN_LOOKBACK_SEASONS")
                .unwrap_or(d.train_lookback_seasons)
                .clamp(0, 30),
            min_train_games: d.min_train_games,
            hybrid_window_weeks: parse_usize("HYBRID_WINDOW_WEEKS")
                .unwrap_or(d.hybrid_window_weeks)
                .clamp(1, 52),
            force_historical: FORCE_HISTORICAL_KEYS.iter().any(|key| flag(key)),
            force_hybrid: flag("FORCE_HYBRID_RECALIBRATION"),
            logistic: d.logistic,
            tree: d.tree,
            bradley_terry,
            ann,
        }
    }

    /// Small, fast settings used by tests and benchmarks.
    pub fn quick() -> Self {
        let mut cfg = Self::default();
        cfg.ann = AnnConfig::quick();
        cfg.bradley_terry.draws = 60;
        cfg.logistic.epochs = 60;
        cfg.bradley_terry.logistic.epochs = 60;
        cfg.min_train_games = 4;
        cfg
    }
}

pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_hidden(raw: &str) -> Option<Vec<usize>> {
    let sizes = raw
        .split([',', ';', ' '])
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .map(|n| n.min(1024))
        .collect::<Vec<_>>();
    if sizes.is_empty() { None } else { Some(sizes) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = TrainerConfig::from_lookup(|_| None);
        assert_eq!(cfg.season_load_concurrency, 4);
        assert_eq!(cfg.train_concurrency, 2);
        assert_eq!(cfg.chunk_max_seasons, 3);
        assert!(cfg.target.is_none());
        assert!(!cfg.force_historical);
        assert!(!cfg.force_hybrid);
    }

    #[test]
    fn any_force_alias_sets_historical_rebuild() {
        for key in FORCE_HISTORICAL_KEYS {
            let cfg = TrainerConfig::from_lookup(lookup_from(&[(key, "yes")]));
            assert!(cfg.force_historical, "{key}");
        }
        let cfg = TrainerConfig::from_lookup(lookup_from(&[("REBUILD_HISTORICAL", "0")]));
        assert!(!cfg.force_historical);
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let cfg = TrainerConfig::from_lookup(lookup_from(&[
            ("TARGET_SEASON", "2023"),
            ("TARGET_WEEK", "5"),
            ("SEASON_LOAD_CONCURRENCY", "999"),
            ("ANN_HIDDEN", "64,32,16"),
            ("ANN_DROPOUT", "0.95"),
            ("BT_DRAWS", "10000"),
            ("BT_L2", "0.3"),
            ("ANN_SEEDS", "not-a-number"),
        ]));
        assert_eq!(cfg.target, Some(WeekKey::new(2023, 5)));
        assert_eq!(cfg.season_load_concurrency, 32);
        assert_eq!(cfg.ann.hidden, vec![64, 32, 16]);
        assert!((cfg.ann.dropout - 0.8).abs() < 1e-12);
        assert_eq!(cfg.bradley_terry.draws, MAX_BT_DRAWS);
        assert!((cfg.bradley_terry.logistic.l2 - 0.3).abs() < 1e-12);
        assert_eq!(cfg.ann.seeds, AnnConfig::default().seeds);
    }

    #[test]
    fn week_zero_is_not_a_target() {
        let cfg = TrainerConfig::from_lookup(lookup_from(&[
            ("TARGET_SEASON", "2023"),
            ("TARGET_WEEK", "0"),
        ]));
        assert!(cfg.target.is_none());
    }
}
