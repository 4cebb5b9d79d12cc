use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::dataset::{ScheduleRow, SeasonTables, TeamWeekRow};
use crate::error::{TrainerError, finite_or};
use crate::power_rating::{self, PowerRatingConfig};
use crate::temporal::{Timed, WeekKey};

pub const ROLLING_WINDOW: usize = 4;
const RECENT_WEIGHT: f64 = 0.6;
const PRIOR_SHRINK_GAMES: f64 = 3.0;
const RATING_SCALE: f64 = 100.0;

pub static TEAM_LAYOUT: Lazy<FeatureLayout> = Lazy::new(FeatureLayout::of::<TeamFeature>);
pub static DIFF_LAYOUT: Lazy<FeatureLayout> = Lazy::new(FeatureLayout::of::<DiffFeature>);

/// A per-team stat line, either one game's actuals or a blended rolling profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub yards: f64,
    pub yards_allowed: f64,
    pub turnovers: f64,
    pub takeaways: f64,
    pub penalty_yards: f64,
    pub possession_mins: f64,
    pub pass_ratio: f64,
    pub points_for: f64,
    pub points_against: f64,
}

impl StatSnapshot {
    pub const KERNEL_DIMS: usize = 5;

    pub fn from_row(row: &TeamWeekRow) -> Self {
        let plays = row.pass_attempts + row.rush_attempts;
        Self {
            yards: row.yards_gained,
            yards_allowed: row.yards_allowed,
            turnovers: row.turnovers,
            takeaways: row.takeaways,
            penalty_yards: row.penalty_yards,
            possession_mins: row.possession_secs / 60.0,
            pass_ratio: if plays > 0.0 {
                row.pass_attempts / plays
            } else {
                0.5
            },
            points_for: row.points_for,
            points_against: row.points_against,
        }
    }

    pub fn turnover_margin(&self) -> f64 {
        self.takeaways - self.turnovers
    }

    /// The stats the paired-comparison bootstrap resamples and compares.
    pub fn kernel_vector(&self) -> [f64; Self::KERNEL_DIMS] {
        [
            self.yards,
            self.turnover_margin(),
            self.penalty_yards,
            self.possession_mins,
            self.pass_ratio,
        ]
    }

    fn mean(items: &[StatSnapshot]) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        let n = items.len() as f64;
        let mut out = Self::default();
        for s in items {
            out = out.add(s);
        }
        Some(out.scale(1.0 / n))
    }

    fn add(self, o: &StatSnapshot) -> Self {
        Self {
            yards: self.yards + o.yards,
            yards_allowed: self.yards_allowed + o.yards_allowed,
            turnovers: self.turnovers + o.turnovers,
            takeaways: self.takeaways + o.takeaways,
            penalty_yards: self.penalty_yards + o.penalty_yards,
            possession_mins: self.possession_mins + o.possession_mins,
            pass_ratio: self.pass_ratio + o.pass_ratio,
            points_for: self.points_for + o.points_for,
            points_against: self.points_against + o.points_against,
        }
    }

    fn scale(self, k: f64) -> Self {
        Self {
            yards: self.yards * k,
            yards_allowed: self.yards_allowed * k,
            turnovers: self.turnovers * k,
            takeaways: self.takeaways * k,
            penalty_yards: self.penalty_yards * k,
            possession_mins: self.possession_mins * k,
            pass_ratio: self.pass_ratio * k,
            points_for: self.points_for * k,
            points_against: self.points_against * k,
        }
    }

    fn lerp(self, other: &StatSnapshot, w_self: f64) -> Self {
        self.scale(w_self).add(&other.scale(1.0 - w_self))
    }
}

/// A named, registered feature. `ALL` fixes the canonical vector order.
pub trait FeatureKey: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn name(self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }
}

/// A model-ready row: timed, labelled, and able to resolve any of its keys.
pub trait FeatureRow: Timed {
    type Key: FeatureKey;

    fn value(&self, key: Self::Key) -> f64;
    fn label(&self) -> Option<f64>;
    fn game_id(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamFeature {
    HomeFlag,
    YardsFor,
    YardsAllowed,
    TurnoverMargin,
    PenaltyYards,
    PossessionMins,
    PassRatio,
    PointsFor,
    PointsAgainst,
    WinPct,
    PowerRating,
    InjuryBurden,
    OpponentYardsFor,
    OpponentYardsAllowed,
    OpponentTurnoverMargin,
    OpponentWinPct,
    OpponentPowerRating,
    OpponentInjuryBurden,
    GamesPlayed,
}

impl FeatureKey for TeamFeature {
    const ALL: &'static [Self] = &[
        Self::HomeFlag,
        Self::YardsFor,
        Self::YardsAllowed,
        Self::TurnoverMargin,
        Self::PenaltyYards,
        Self::PossessionMins,
        Self::PassRatio,
        Self::PointsFor,
        Self::PointsAgainst,
        Self::WinPct,
        Self::PowerRating,
        Self::InjuryBurden,
        Self::OpponentYardsFor,
        Self::OpponentYardsAllowed,
        Self::OpponentTurnoverMargin,
        Self::OpponentWinPct,
        Self::OpponentPowerRating,
        Self::OpponentInjuryBurden,
        Self::GamesPlayed,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::HomeFlag => "home",
            Self::YardsFor => "yards_for",
            Self::YardsAllowed => "yards_allowed",
            Self::TurnoverMargin => "turnover_margin",
            Self::PenaltyYards => "penalty_yards",
            Self::PossessionMins => "possession_mins",
            Self::PassRatio => "pass_ratio",
            Self::PointsFor => "points_for",
            Self::PointsAgainst => "points_against",
            Self::WinPct => "win_pct",
            Self::PowerRating => "power_rating",
            Self::InjuryBurden => "injury_burden",
            Self::OpponentYardsFor => "opp_yards_for",
            Self::OpponentYardsAllowed => "opp_yards_allowed",
            Self::OpponentTurnoverMargin => "opp_turnover_margin",
            Self::OpponentWinPct => "opp_win_pct",
            Self::OpponentPowerRating => "opp_power_rating",
            Self::OpponentInjuryBurden => "opp_injury_burden",
            Self::GamesPlayed => "games_played",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffFeature {
    YardsDiff,
    TurnoverDiff,
    PenaltyDiff,
    PossessionDiff,
    PassRatioDiff,
    PowerRatingDiff,
    InjuryDiff,
}

impl DiffFeature {
    /// Position in `StatSnapshot::kernel_vector` for stat-derived differentials.
    pub fn kernel_index(self) -> Option<usize> {
        match self {
            Self::YardsDiff => Some(0),
            Self::TurnoverDiff => Some(1),
            Self::PenaltyDiff => Some(2),
            Self::PossessionDiff => Some(3),
            Self::PassRatioDiff => Some(4),
            Self::PowerRatingDiff | Self::InjuryDiff => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::YardsDiff => "yardage edge",
            Self::TurnoverDiff => "turnover margin",
            Self::PenaltyDiff => "penalty discipline",
            Self::PossessionDiff => "time of possession",
            Self::PassRatioDiff => "pass/run mix",
            Self::PowerRatingDiff => "power rating",
            Self::InjuryDiff => "injury report",
        }
    }
}

impl FeatureKey for DiffFeature {
    const ALL: &'static [Self] = &[
        Self::YardsDiff,
        Self::TurnoverDiff,
        Self::PenaltyDiff,
        Self::PossessionDiff,
        Self::PassRatioDiff,
        Self::PowerRatingDiff,
        Self::InjuryDiff,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::YardsDiff => "diff_yards",
            Self::TurnoverDiff => "diff_turnovers",
            Self::PenaltyDiff => "diff_penalty_yards",
            Self::PossessionDiff => "diff_possession",
            Self::PassRatioDiff => "diff_pass_ratio",
            Self::PowerRatingDiff => "diff_power_rating",
            Self::InjuryDiff => "diff_injury",
        }
    }
}

/// The exact feature order an artifact was trained with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub names: Vec<String>,
}

impl FeatureLayout {
    pub fn of<K: FeatureKey>() -> Self {
        Self {
            names: K::ALL.iter().map(|k| k.name().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Resolves recorded names back to extractors, in recorded order.
    pub fn resolve<K: FeatureKey>(&self) -> Result<Vec<K>, TrainerError> {
        self.names
            .iter()
            .map(|name| K::from_name(name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| TrainerError::FeatureLayoutMismatch {
                artifact: self.names.clone(),
                inference: FeatureLayout::of::<K>().names,
            })
    }

    pub fn ensure_matches(&self, inference: &FeatureLayout) -> Result<(), TrainerError> {
        if self == inference {
            Ok(())
        } else {
            Err(TrainerError::FeatureLayoutMismatch {
                artifact: self.names.clone(),
                inference: inference.names.clone(),
            })
        }
    }
}

pub fn vectorize<R: FeatureRow>(row: &R, keys: &[R::Key]) -> Vec<f64> {
    keys.iter()
        .map(|k| finite_or(row.value(*k), 0.0))
        .collect()
}

/// Feature matrix and labels for the labelled rows only.
pub fn labeled_matrix<R: FeatureRow>(rows: &[R], keys: &[R::Key]) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut xs = Vec::with_capacity(rows.len());
    let mut ys = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(y) = row.label() {
            xs.push(vectorize(row, keys));
            ys.push(y);
        }
    }
    (xs, ys)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamGameRow {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub team: String,
    pub opponent: String,
    pub is_home: bool,
    pub profile: StatSnapshot,
    pub opponent_profile: StatSnapshot,
    pub win_pct: f64,
    pub opponent_win_pct: f64,
    pub power_rating: f64,
    pub opponent_power_rating: f64,
    pub injury_burden: f64,
    pub opponent_injury_burden: f64,
    pub games_played: u32,
    pub win: Option<f64>,
}

impl Timed for TeamGameRow {
    fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

impl FeatureRow for TeamGameRow {
    type Key = TeamFeature;

    fn value(&self, key: TeamFeature) -> f64 {
        match key {
            TeamFeature::HomeFlag => {
                if self.is_home {
                    1.0
                } else {
                    0.0
                }
            }
            TeamFeature::YardsFor => self.profile.yards,
            TeamFeature::YardsAllowed => self.profile.yards_allowed,
            TeamFeature::TurnoverMargin => self.profile.turnover_margin(),
            TeamFeature::PenaltyYards => self.profile.penalty_yards,
            TeamFeature::PossessionMins => self.profile.possession_mins,
            TeamFeature::PassRatio => self.profile.pass_ratio,
            TeamFeature::PointsFor => self.profile.points_for,
            TeamFeature::PointsAgainst => self.profile.points_against,
            TeamFeature::WinPct => self.win_pct,
            TeamFeature::PowerRating => self.power_rating,
            TeamFeature::InjuryBurden => self.injury_burden,
            TeamFeature::OpponentYardsFor => self.opponent_profile.yards,
            TeamFeature::OpponentYardsAllowed => self.opponent_profile.yards_allowed,
            TeamFeature::OpponentTurnoverMargin => self.opponent_profile.turnover_margin(),
            TeamFeature::OpponentWinPct => self.opponent_win_pct,
            TeamFeature::OpponentPowerRating => self.opponent_power_rating,
            TeamFeature::OpponentInjuryBurden => self.opponent_injury_burden,
            TeamFeature::GamesPlayed => self.games_played as f64,
        }
    }

    fn label(&self) -> Option<f64> {
        self.win
    }

    fn game_id(&self) -> &str {
        &self.game_id
    }
}

/// One row per game, home perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameDifferentialRow {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    pub home_profile: StatSnapshot,
    pub away_profile: StatSnapshot,
    pub power_rating_diff: f64,
    pub injury_diff: f64,
    /// What each side actually produced in this game, once played.
    pub home_actual: Option<StatSnapshot>,
    pub away_actual: Option<StatSnapshot>,
    pub home_win: Option<f64>,
}

impl GameDifferentialRow {
    pub fn diff_value(&self, key: DiffFeature) -> f64 {
        let h = self.home_profile;
        let a = self.away_profile;
        match key {
            DiffFeature::YardsDiff => h.yards - a.yards,
            DiffFeature::TurnoverDiff => h.turnover_margin() - a.turnover_margin(),
            DiffFeature::PenaltyDiff => h.penalty_yards - a.penalty_yards,
            DiffFeature::PossessionDiff => h.possession_mins - a.possession_mins,
            DiffFeature::PassRatioDiff => h.pass_ratio - a.pass_ratio,
            DiffFeature::PowerRatingDiff => self.power_rating_diff,
            DiffFeature::InjuryDiff => self.injury_diff,
        }
    }
}

impl Timed for GameDifferentialRow {
    fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

impl FeatureRow for GameDifferentialRow {
    type Key = DiffFeature;

    fn value(&self, key: DiffFeature) -> f64 {
        self.diff_value(key)
    }

    fn label(&self) -> Option<f64> {
        self.home_win
    }

    fn game_id(&self) -> &str {
        &self.game_id
    }
}

/// Team-game rows: exactly one per team per regular-season game.
pub fn build_features(tables: &[SeasonTables]) -> Vec<TeamGameRow> {
    let ctx = FeatureContext::new(tables);
    let mut out = Vec::with_capacity(ctx.games.len() * 2);
    for game in &ctx.games {
        let home = ctx.team_state(&game.home_team, game.week_key());
        let away = ctx.team_state(&game.away_team, game.week_key());
        let ratings = ctx.ratings_at(game.week_key());
        let rh = rating_feature(ratings, &game.home_team);
        let ra = rating_feature(ratings, &game.away_team);
        let home_label = game.home_result().filter(|r| *r != 0.5);

        out.push(TeamGameRow {
            game_id: game.game_id.clone(),
            season: game.season,
            week: game.week,
            team: game.home_team.clone(),
            opponent: game.away_team.clone(),
            is_home: true,
            profile: home.profile,
            opponent_profile: away.profile,
            win_pct: home.win_pct,
            opponent_win_pct: away.win_pct,
            power_rating: rh,
            opponent_power_rating: ra,
            injury_burden: home.injury_burden,
            opponent_injury_burden: away.injury_burden,
            games_played: home.games_played,
            win: home_label,
        });
        out.push(TeamGameRow {
            game_id: game.game_id.clone(),
            season: game.season,
            week: game.week,
            team: game.away_team.clone(),
            opponent: game.home_team.clone(),
            is_home: false,
            profile: away.profile,
            opponent_profile: home.profile,
            win_pct: away.win_pct,
            opponent_win_pct: home.win_pct,
            power_rating: ra,
            opponent_power_rating: rh,
            injury_burden: away.injury_burden,
            opponent_injury_burden: home.injury_burden,
            games_played: away.games_played,
            win: home_label.map(|y| 1.0 - y),
        });
    }
    out
}

/// Game-differential rows: one per regular-season game, home minus away.
pub fn build_differential_features(tables: &[SeasonTables]) -> Vec<GameDifferentialRow> {
    let ctx = FeatureContext::new(tables);
    ctx.games
        .iter()
        .map(|game| {
            let key = game.week_key();
            let home = ctx.team_state(&game.home_team, key);
            let away = ctx.team_state(&game.away_team, key);
            let ratings = ctx.ratings_at(key);
            GameDifferentialRow {
                game_id: game.game_id.clone(),
                season: game.season,
                week: game.week,
                home_team: game.home_team.clone(),
                away_team: game.away_team.clone(),
                home_profile: home.profile,
                away_profile: away.profile,
                power_rating_diff: rating_feature(ratings, &game.home_team)
                    - rating_feature(ratings, &game.away_team),
                injury_diff: home.injury_burden - away.injury_burden,
                home_actual: home.actual,
                away_actual: away.actual,
                home_win: game.home_result().filter(|r| *r != 0.5),
            }
        })
        .collect()
}

fn rating_feature(ratings: Option<&HashMap<String, f64>>, team: &str) -> f64 {
    let base = PowerRatingConfig::default().base;
    let r = ratings.and_then(|m| m.get(team)).copied().unwrap_or(base);
    (r - base) / RATING_SCALE
}

#[derive(Debug, Clone, Copy)]
struct TeamState {
    profile: StatSnapshot,
    actual: Option<StatSnapshot>,
    win_pct: f64,
    injury_burden: f64,
    games_played: u32,
}

struct FeatureContext {
    games: Vec<ScheduleRow>,
    /// team -> (week key, stat line), ascending.
    stat_lines: HashMap<String, Vec<(WeekKey, StatSnapshot)>>,
    /// team -> (week key, result from the team's perspective), ascending.
    results: HashMap<String, Vec<(WeekKey, f64)>>,
    injuries: HashMap<(String, WeekKey), f64>,
    league_means: HashMap<i32, StatSnapshot>,
    ratings: HashMap<WeekKey, HashMap<String, f64>>,
}

impl FeatureContext {
    fn new(tables: &[SeasonTables]) -> Self {
        let mut seen = HashSet::new();
        let mut games: Vec<ScheduleRow> = tables
            .iter()
            .flat_map(|t| t.schedules.iter())
            .filter(|g| g.is_regular_season())
            .filter(|g| !g.home_team.is_empty() && !g.away_team.is_empty())
            .filter(|g| seen.insert(g.game_id.clone()))
            .cloned()
            .collect();
        games.sort_by(|a, b| {
            a.week_key()
                .cmp(&b.week_key())
                .then(a.game_id.cmp(&b.game_id))
        });

        let mut stat_lines: HashMap<String, Vec<(WeekKey, StatSnapshot)>> = HashMap::new();
        let mut by_season: HashMap<i32, Vec<StatSnapshot>> = HashMap::new();
        for row in tables.iter().flat_map(|t| t.team_weeks.iter()) {
            let snap = StatSnapshot::from_row(row);
            stat_lines
                .entry(row.team.clone())
                .or_default()
                .push((row.week_key(), snap));
            by_season.entry(row.season).or_default().push(snap);
        }
        for lines in stat_lines.values_mut() {
            lines.sort_by_key(|(k, _)| *k);
            lines.dedup_by_key(|(k, _)| *k);
        }
        let league_means = by_season
            .into_iter()
            .filter_map(|(season, snaps)| StatSnapshot::mean(&snaps).map(|m| (season, m)))
            .collect();

        let mut results: HashMap<String, Vec<(WeekKey, f64)>> = HashMap::new();
        for g in &games {
            let Some(r) = g.home_result() else {
                continue;
            };
            results
                .entry(g.home_team.clone())
                .or_default()
                .push((g.week_key(), r));
            results
                .entry(g.away_team.clone())
                .or_default()
                .push((g.week_key(), 1.0 - r));
        }

        let mut injuries: HashMap<(String, WeekKey), f64> = HashMap::new();
        for inj in tables.iter().flat_map(|t| t.injuries.iter()) {
            *injuries
                .entry((inj.team.clone(), WeekKey::new(inj.season, inj.week)))
                .or_insert(0.0) += inj.burden();
        }

        let keys: BTreeSet<WeekKey> = games.iter().map(|g| g.week_key()).collect();
        let cfg = PowerRatingConfig::default();
        let ratings = keys
            .into_iter()
            .map(|k| (k, power_rating::ratings_before(&games, k, cfg)))
            .collect();

        Self {
            games,
            stat_lines,
            results,
            injuries,
            league_means,
            ratings,
        }
    }

    fn ratings_at(&self, key: WeekKey) -> Option<&HashMap<String, f64>> {
        self.ratings.get(&key)
    }

    fn team_state(&self, team: &str, key: WeekKey) -> TeamState {
        let lines = self.stat_lines.get(team).map(Vec::as_slice).unwrap_or(&[]);
        let this_season: Vec<StatSnapshot> = lines
            .iter()
            .filter(|(k, _)| k.season == key.season && k.week < key.week)
            .map(|(_, s)| *s)
            .collect();
        let prior_season: Vec<StatSnapshot> = lines
            .iter()
            .filter(|(k, _)| k.season == key.season - 1)
            .map(|(_, s)| *s)
            .collect();
        let actual = lines.iter().find(|(k, _)| *k == key).map(|(_, s)| *s);

        let prior = StatSnapshot::mean(&prior_season)
            .or_else(|| self.league_means.get(&(key.season - 1)).copied());
        let gp = this_season.len();
        let profile = match StatSnapshot::mean(&this_season) {
            None => prior.unwrap_or_default(),
            Some(season_mean) => {
                let start = gp.saturating_sub(ROLLING_WINDOW);
                let last = StatSnapshot::mean(&this_season[start..]).unwrap_or(season_mean);
                let recent = last.lerp(&season_mean, RECENT_WEIGHT);
                match prior {
                    Some(prior) => {
                        let k = gp as f64 / (gp as f64 + PRIOR_SHRINK_GAMES);
                        recent.lerp(&prior, k)
                    }
                    None => recent,
                }
            }
        };

        let (wins, decided) = self
            .results
            .get(team)
            .map(|rs| {
                rs.iter()
                    .filter(|(k, _)| k.season == key.season && k.week < key.week)
                    .fold((0.0, 0.0), |(w, n), (_, r)| (w + r, n + 1.0))
            })
            .unwrap_or((0.0, 0.0));

        TeamState {
            profile,
            actual,
            win_pct: (wins + 1.0) / (decided + 2.0),
            injury_burden: self
                .injuries
                .get(&(team.to_string(), key))
                .copied()
                .unwrap_or(0.0),
            games_played: gp as u32,
        }
    }
}
