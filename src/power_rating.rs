use std::collections::HashMap;

use crate::dataset::ScheduleRow;
use crate::temporal::{WeekKey, is_before};

#[derive(Debug, Clone, Copy)]
pub struct PowerRatingConfig {
    pub k: f64,
    pub home_adv_pts: f64,
    pub base: f64,
    /// Fraction of the distance to `base` removed at each season boundary.
    pub season_regression: f64,
}

impl Default for PowerRatingConfig {
    fn default() -> Self {
        Self {
            k: 20.0,
            home_adv_pts: 55.0,
            base: 1500.0,
            season_regression: 1.0 / 3.0,
        }
    }
}

/// Ratings built only from completed regular-season games strictly before `target`.
pub fn ratings_before(
    games: &[ScheduleRow],
    target: WeekKey,
    cfg: PowerRatingConfig,
) -> HashMap<String, f64> {
    let mut played: Vec<&ScheduleRow> = games
        .iter()
        .filter(|g| g.is_regular_season() && g.is_final())
        .filter(|g| is_before(target, *g))
        .collect();
    played.sort_by(|a, b| {
        (a.season, a.week)
            .cmp(&(b.season, b.week))
            .then(a.game_id.cmp(&b.game_id))
    });

    let mut elo: HashMap<String, f64> = HashMap::new();
    let mut current_season: Option<i32> = None;
    for g in played {
        if current_season.is_some_and(|s| s != g.season) {
            for rating in elo.values_mut() {
                *rating -= (*rating - cfg.base) * cfg.season_regression;
            }
        }
        current_season = Some(g.season);

        let Some(s_home) = g.home_result() else {
            continue;
        };
        let eh = *elo.entry(g.home_team.clone()).or_insert(cfg.base);
        let ea = *elo.entry(g.away_team.clone()).or_insert(cfg.base);
        let expected_home = expected_score(eh + cfg.home_adv_pts, ea);

        let delta = cfg.k * (s_home - expected_home);
        elo.insert(g.home_team.clone(), eh + delta);
        elo.insert(g.away_team.clone(), ea - delta);
    }

    // The target opens a new season: apply that boundary too.
    if let Some(last) = current_season
        && last < target.season
    {
        for rating in elo.values_mut() {
            *rating -= (*rating - cfg.base) * cfg.season_regression;
        }
    }

    elo
}

pub fn expected_score(r_a: f64, r_b: f64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf(-(r_a - r_b) / 400.0))
}
