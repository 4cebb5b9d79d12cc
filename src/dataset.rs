use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::TrainerError;
use crate::temporal::{Timed, WeekKey};

pub const REGULAR_SEASON: &str = "REG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    #[serde(default = "regular_season")]
    pub game_type: String,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub home_score: Option<u32>,
    #[serde(default)]
    pub away_score: Option<u32>,
}

impl ScheduleRow {
    pub fn is_regular_season(&self) -> bool {
        self.game_type.eq_ignore_ascii_case(REGULAR_SEASON)
    }

    pub fn is_final(&self) -> bool {
        self.home_score.is_some() && self.away_score.is_some()
    }

    /// 1.0 home win, 0.0 away win, 0.5 tie, None while unplayed.
    pub fn home_result(&self) -> Option<f64> {
        let (Some(h), Some(a)) = (self.home_score, self.away_score) else {
            return None;
        };
        Some(if h > a {
            1.0
        } else if h < a {
            0.0
        } else {
            0.5
        })
    }
}

impl Timed for ScheduleRow {
    fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

fn regular_season() -> String {
    REGULAR_SEASON.to_string()
}

/// One team's box-score totals for one game week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamWeekRow {
    pub team: String,
    pub season: i32,
    pub week: u32,
    #[serde(default)]
    pub points_for: f64,
    #[serde(default)]
    pub points_against: f64,
    #[serde(default)]
    pub yards_gained: f64,
    #[serde(default)]
    pub yards_allowed: f64,
    #[serde(default)]
    pub turnovers: f64,
    #[serde(default)]
    pub takeaways: f64,
    #[serde(default)]
    pub penalty_yards: f64,
    #[serde(default)]
    pub possession_secs: f64,
    #[serde(default)]
    pub pass_attempts: f64,
    #[serde(default)]
    pub rush_attempts: f64,
}

impl Timed for TeamWeekRow {
    fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjuryRow {
    pub team: String,
    pub season: i32,
    pub week: u32,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub status: String,
}

impl InjuryRow {
    /// Availability-weighted burden of this report.
    pub fn burden(&self) -> f64 {
        let status = self.status.trim().to_ascii_lowercase();
        let base = match status.as_str() {
            "out" | "ir" | "injured reserve" => 1.0,
            "doubtful" => 0.75,
            "questionable" => 0.25,
            _ => 0.0,
        };
        if self.position.trim().eq_ignore_ascii_case("QB") {
            base * 3.0
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeasonTables {
    pub season: i32,
    pub schedules: Vec<ScheduleRow>,
    #[serde(default)]
    pub team_weeks: Vec<TeamWeekRow>,
    #[serde(default)]
    pub injuries: Vec<InjuryRow>,
}

impl SeasonTables {
    pub fn empty(season: i32) -> Self {
        Self {
            season,
            ..Default::default()
        }
    }

    /// Regular-season weeks that have at least one scheduled game, ascending.
    pub fn regular_weeks(&self) -> Vec<u32> {
        let mut weeks = self
            .schedules
            .iter()
            .filter(|g| g.is_regular_season())
            .map(|g| g.week)
            .collect::<Vec<_>>();
        weeks.sort_unstable();
        weeks.dedup();
        weeks
    }
}

/// Where raw season tables come from. Implementations must be cheap to share
/// across the season-loading pool.
pub trait SeasonSource: Send + Sync {
    fn name(&self) -> &str;

    /// Loads one season. Missing optional tables degrade to empty; a missing
    /// schedule is an error.
    fn load_season(&self, season: i32) -> Result<SeasonTables>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    seasons: HashMap<i32, SeasonTables>,
}

impl InMemorySource {
    pub fn new(tables: impl IntoIterator<Item = SeasonTables>) -> Self {
        Self {
            seasons: tables.into_iter().map(|t| (t.season, t)).collect(),
        }
    }

    pub fn insert(&mut self, tables: SeasonTables) {
        self.seasons.insert(tables.season, tables);
    }
}

impl SeasonSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_season(&self, season: i32) -> Result<SeasonTables> {
        self.seasons.get(&season).cloned().ok_or_else(|| {
            TrainerError::DataSourceUnavailable {
                source_name: self.name().to_string(),
                season,
                reason: "season not present".to_string(),
            }
            .into()
        })
    }
}

/// `{root}/{season}/schedules.json`, `team_weeks.json`, `injuries.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    root: PathBuf,
}

impl JsonDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SeasonSource for JsonDirSource {
    fn name(&self) -> &str {
        "json"
    }

    fn load_season(&self, season: i32) -> Result<SeasonTables> {
        let dir = self.root.join(season.to_string());
        let schedules: Vec<ScheduleRow> = read_json_table(&dir.join("schedules.json"))
            .map_err(|err| unavailable(self.name(), season, &err))?;
        let team_weeks = optional_table(self.name(), season, "team_weeks", || {
            read_json_table(&dir.join("team_weeks.json"))
        });
        let injuries = optional_table(self.name(), season, "injuries", || {
            read_json_table(&dir.join("injuries.json"))
        });
        Ok(SeasonTables {
            season,
            schedules,
            team_weeks,
            injuries,
        })
    }
}

/// `{root}/{season}/schedules.parquet`, `team_weeks.parquet`, `injuries.parquet`.
/// Columns are matched by name; absent numeric columns read as 0.
#[derive(Debug, Clone)]
pub struct ParquetDirSource {
    root: PathBuf,
}

impl ParquetDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SeasonSource for ParquetDirSource {
    fn name(&self) -> &str {
        "parquet"
    }

    fn load_season(&self, season: i32) -> Result<SeasonTables> {
        let dir = self.root.join(season.to_string());
        let schedules = read_parquet_rows(&dir.join("schedules.parquet"), parse_schedule_row)
            .map_err(|err| unavailable(self.name(), season, &err))?;
        let team_weeks = optional_table(self.name(), season, "team_weeks", || {
            read_parquet_rows(&dir.join("team_weeks.parquet"), parse_team_week_row)
        });
        let injuries = optional_table(self.name(), season, "injuries", || {
            read_parquet_rows(&dir.join("injuries.parquet"), parse_injury_row)
        });
        Ok(SeasonTables {
            season,
            schedules: schedules.into_iter().filter(|g| g.season == season).collect(),
            team_weeks,
            injuries,
        })
    }
}

/// Parquet when any season directory under `root` holds a
/// `schedules.parquet`, JSON otherwise.
pub fn open_dir_source(root: &Path) -> Box<dyn SeasonSource> {
    let has_parquet = fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().join("schedules.parquet").is_file())
        })
        .unwrap_or(false);
    if has_parquet {
        Box::new(ParquetDirSource::new(root))
    } else {
        Box::new(JsonDirSource::new(root))
    }
}

fn unavailable(source_name: &str, season: i32, err: &anyhow::Error) -> anyhow::Error {
    TrainerError::DataSourceUnavailable {
        source_name: source_name.to_string(),
        season,
        reason: format!("{err:#}"),
    }
    .into()
}

fn optional_table<T>(
    source_name: &str,
    season: i32,
    table: &str,
    load: impl FnOnce() -> Result<Vec<T>>,
) -> Vec<T> {
    match load() {
        Ok(rows) => rows,
        Err(err) => {
            warn!(
                source = source_name,
                season,
                table,
                error = %format!("{err:#}"),
                "optional table unavailable, continuing without it"
            );
            Vec::new()
        }
    }
}

fn read_json_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str::<Vec<T>>(&raw).with_context(|| format!("parse {}", path.display()))
}

fn read_parquet_rows<T>(path: &Path, parse: impl Fn(&Row) -> Option<T>) -> Result<Vec<T>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet reader {}", path.display()))?;
    let iter = reader
        .get_row_iter(None)
        .with_context(|| format!("iterate rows {}", path.display()))?;

    let mut out = Vec::new();
    for row in iter {
        let Ok(row) = row else {
            continue;
        };
        if let Some(parsed) = parse(&row) {
            out.push(parsed);
        }
    }
    Ok(out)
}

fn column<'a>(row: &'a Row, name: &str) -> Option<&'a Field> {
    row.get_column_iter()
        .find(|(col, _)| col.as_str() == name)
        .map(|(_, field)| field)
}

fn field_f64(field: &Field) -> Option<f64> {
    match field {
        Field::Double(v) => Some(*v),
        Field::Float(v) => Some(*v as f64),
        Field::Long(v) => Some(*v as f64),
        Field::Int(v) => Some(*v as f64),
        Field::Short(v) => Some(*v as f64),
        Field::Str(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn read_num(row: &Row, name: &str) -> f64 {
    column(row, name)
        .and_then(field_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn read_opt_num(row: &Row, name: &str) -> Option<f64> {
    column(row, name).and_then(field_f64).filter(|v| v.is_finite())
}

fn read_str(row: &Row, name: &str) -> Option<String> {
    match column(row, name)? {
        Field::Str(s) => Some(s.trim().to_string()),
        other => field_f64(other).map(|v| format!("{v}")),
    }
}

fn parse_schedule_row(row: &Row) -> Option<ScheduleRow> {
    let game_id = read_str(row, "game_id")?;
    let season = read_opt_num(row, "season")? as i32;
    let week = read_opt_num(row, "week")?;
    if week < 1.0 {
        return None;
    }
    Some(ScheduleRow {
        game_id,
        season,
        week: week as u32,
        game_type: read_str(row, "game_type").unwrap_or_else(regular_season),
        home_team: read_str(row, "home_team")?,
        away_team: read_str(row, "away_team")?,
        home_score: read_opt_num(row, "home_score").map(|v| v.max(0.0) as u32),
        away_score: read_opt_num(row, "away_score").map(|v| v.max(0.0) as u32),
    })
}

fn parse_team_week_row(row: &Row) -> Option<TeamWeekRow> {
    let week = read_opt_num(row, "week")?;
    if week < 1.0 {
        return None;
    }
    Some(TeamWeekRow {
        team: read_str(row, "team")?,
        season: read_opt_num(row, "season")? as i32,
        week: week as u32,
        points_for: read_num(row, "points_for"),
        points_against: read_num(row, "points_against"),
        yards_gained: read_num(row, "yards_gained"),
        yards_allowed: read_num(row, "yards_allowed"),
        turnovers: read_num(row, "turnovers"),
        takeaways: read_num(row, "takeaways"),
        penalty_yards: read_num(row, "penalty_yards"),
        possession_secs: read_num(row, "possession_secs"),
        pass_attempts: read_num(row, "pass_attempts"),
        rush_attempts: read_num(row, "rush_attempts"),
    })
}

fn parse_injury_row(row: &Row) -> Option<InjuryRow> {
    let week = read_opt_num(row, "week")?;
    if week < 1.0 {
        return None;
    }
    Some(InjuryRow {
        team: read_str(row, "team")?,
        season: read_opt_num(row, "season")? as i32,
        week: week as u32,
        position: read_str(row, "position").unwrap_or_default(),
        status: read_str(row, "report_status")
            .or_else(|| read_str(row, "status"))
            .unwrap_or_default(),
    })
}
