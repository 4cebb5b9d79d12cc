use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::features::{DiffFeature, FeatureKey, GameDifferentialRow, vectorize};
use crate::models::bradley_terry::BradleyTerryArtifact;

pub const TOP_DRIVERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub feature: String,
    pub label: String,
    /// Signed log-odds contribution toward the home side.
    pub contribution: f64,
    pub favours: String,
}

/// Largest |w_i * z_i| terms of the paired-comparison model for one game.
pub fn top_drivers(
    artifact: &BradleyTerryArtifact,
    row: &GameDifferentialRow,
    k: usize,
) -> Result<Vec<Driver>> {
    let keys = artifact.model.layout.resolve::<DiffFeature>()?;
    let contributions = artifact.model.contributions(&vectorize(row, &keys));
    let mut ranked: Vec<(DiffFeature, f64)> = keys.into_iter().zip(contributions).collect();
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    Ok(ranked
        .into_iter()
        .filter(|(_, c)| *c != 0.0)
        .take(k)
        .map(|(key, c)| Driver {
            feature: key.name().to_string(),
            label: key.label().to_string(),
            contribution: c,
            favours: if c > 0.0 {
                row.home_team.clone()
            } else {
                row.away_team.clone()
            },
        })
        .collect())
}

/// One-sentence summary of a game's forecast.
pub fn narrative(
    row: &GameDifferentialRow,
    blended: f64,
    interval: Option<(f64, f64)>,
    drivers: &[Driver],
) -> String {
    let (fav, dog, p, band) = if blended >= 0.5 {
        (&row.home_team, &row.away_team, blended, interval)
    } else {
        (
            &row.away_team,
            &row.home_team,
            1.0 - blended,
            interval.map(|(lo, hi)| (1.0 - hi, 1.0 - lo)),
        )
    };

    let mut text = if (p - 0.5).abs() < 0.005 {
        format!("{} vs {} is a toss-up", row.away_team, row.home_team)
    } else {
        format!("{fav} favoured over {dog} at {:.1}%", p * 100.0)
    };
    if let Some((lo, hi)) = band
        && hi > lo
    {
        text.push_str(&format!(" (90% band {:.1}%-{:.1}%)", lo * 100.0, hi * 100.0));
    }
    if let Some(lead) = drivers.first() {
        text.push_str(&format!("; biggest edge: {} ({})", lead.label, lead.favours));
    }
    text.push('.');
    text
}
