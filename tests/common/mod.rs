#![allow(dead_code)]

use std::path::Path;

use gridiron_ensemble::config::TrainerConfig;
use gridiron_ensemble::dataset::{InMemorySource, InjuryRow, ScheduleRow, SeasonTables, TeamWeekRow};

pub const TEAMS: [&str; 8] = ["ARI", "BAL", "CHI", "DAL", "DEN", "GB", "KC", "NE"];

/// Small deterministic noise in [-1, 1).
fn noise(season: i32, week: u32, salt: u32) -> f64 {
    let mut x = (season as u64)
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add((week as u64) << 16)
        .wrapping_add(salt as u64)
        .wrapping_mul(1_442_695_040_888_963_407);
    x ^= x >> 29;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 32;
    (x % 2000) as f64 / 1000.0 - 1.0
}

fn strength(team: usize, season: i32) -> f64 {
    (team as f64 - 3.5) * 0.35 + noise(season, 0, team as u32) * 0.2
}

/// Circle-method pairings: every team plays once per week.
fn pairings(week: u32) -> Vec<(usize, usize)> {
    let n = TEAMS.len();
    let mut ring: Vec<usize> = (1..n).collect();
    ring.rotate_left((week as usize - 1) % (n - 1));
    let mut order = vec![0];
    order.extend(ring);
    (0..n / 2)
        .map(|i| {
            let (a, b) = (order[i], order[n - 1 - i]);
            if (week as usize + i) % 2 == 0 { (a, b) } else { (b, a) }
        })
        .collect()
}

/// One season of `weeks` regular-season weeks. Weeks after `played_through`
/// have no scores yet.
pub fn season(season: i32, weeks: u32, played_through: u32) -> SeasonTables {
    let mut tables = SeasonTables::empty(season);
    for week in 1..=weeks {
        for (g, (home, away)) in pairings(week).into_iter().enumerate() {
            let edge = strength(home, season) - strength(away, season) + 0.15;
            let luck = noise(season, week, g as u32 + 100);
            let margin = ((edge + 0.8 * luck) * 10.0).round();
            let margin = if margin == 0.0 { 3.0 } else { margin };
            let played = week <= played_through;
            let (home_pts, away_pts) = if margin > 0.0 {
                (20.0 + margin, 20.0)
            } else {
                (20.0, 20.0 - margin)
            };
            tables.schedules.push(ScheduleRow {
                game_id: format!("{season}_{week:02}_{}_{}", TEAMS[away], TEAMS[home]),
                season,
                week,
                game_type: "REG".to_string(),
                home_team: TEAMS[home].to_string(),
                away_team: TEAMS[away].to_string(),
                home_score: played.then_some(home_pts as u32),
                away_score: played.then_some(away_pts as u32),
            });
            if !played {
                continue;
            }
            for (team, opp, pf, pa, salt) in [
                (home, away, home_pts, away_pts, 1),
                (away, home, away_pts, home_pts, 2),
            ] {
                let s = strength(team, season) - strength(opp, season);
                let jitter = noise(season, week, g as u32 * 10 + salt);
                tables.team_weeks.push(TeamWeekRow {
                    team: TEAMS[team].to_string(),
                    season,
                    week,
                    points_for: pf,
                    points_against: pa,
                    yards_gained: 330.0 + 45.0 * s + 25.0 * jitter,
                    yards_allowed: 330.0 - 45.0 * s - 20.0 * jitter,
                    turnovers: (1.4 - 0.5 * s + 0.6 * jitter).max(0.0).round(),
                    takeaways: (1.4 + 0.5 * s - 0.4 * jitter).max(0.0).round(),
                    penalty_yards: 50.0 - 6.0 * s + 10.0 * jitter,
                    possession_secs: 1800.0 + 120.0 * s + 60.0 * jitter,
                    pass_attempts: 34.0 - 2.0 * s,
                    rush_attempts: 26.0 + 2.0 * s,
                });
            }
        }
        if week % 3 == 0 {
            tables.injuries.push(InjuryRow {
                team: TEAMS[(week as usize + season as usize) % TEAMS.len()].to_string(),
                season,
                week,
                position: "QB".to_string(),
                status: "Questionable".to_string(),
            });
        }
    }
    tables
}

pub fn league(first: i32, last: i32, weeks: u32) -> Vec<SeasonTables> {
    (first..=last).map(|s| season(s, weeks, weeks)).collect()
}

pub fn source(first: i32, last: i32, weeks: u32) -> InMemorySource {
    InMemorySource::new(league(first, last, weeks))
}

/// Fast settings for tests, writing under `dir`.
pub fn quick_config(dir: &Path, min_season: i32) -> TrainerConfig {
    let mut cfg = TrainerConfig::quick();
    cfg.artifact_dir = dir.to_path_buf();
    cfg.min_season = min_season;
    cfg.chunk_max_seasons = 1;
    cfg.train_lookback_seasons = 1;
    cfg
}
