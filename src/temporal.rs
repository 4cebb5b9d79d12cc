use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One round of one league year. Orders season-major, week-minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekKey {
    pub season: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(season: i32, week: u32) -> Self {
        Self { season, week }
    }

    /// Approximate number of weeks between `self` and a later `other`.
    /// Season boundaries count as a fixed 18-week stride.
    pub fn weeks_until(self, other: WeekKey) -> f64 {
        let seasons = (other.season - self.season) as f64;
        let weeks = other.week as f64 - self.week as f64;
        (seasons * 18.0 + weeks).max(0.0)
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_W{:02}", self.season, self.week)
    }
}

/// Anything positioned on the season/week axis.
pub trait Timed {
    fn week_key(&self) -> WeekKey;
}

impl Timed for WeekKey {
    fn week_key(&self) -> WeekKey {
        *self
    }
}

/// True iff `row` happened strictly before `target`.
pub fn is_before<T: Timed + ?Sized>(target: WeekKey, row: &T) -> bool {
    let key = row.week_key();
    key.season < target.season || (key.season == target.season && key.week < target.week)
}

/// Stable sort by (season, week).
pub fn sort_chronologically<T: Timed>(rows: &mut [T]) {
    rows.sort_by_key(|row| row.week_key());
}

#[derive(Debug, Clone)]
pub struct TemporalSplit<T> {
    pub train: Vec<T>,
    pub test: Vec<T>,
}

/// Splits rows for a target week. `is_before` is the only membership test for
/// the training side; rows after the target land in neither set.
pub fn split_at_target<T: Timed + Clone>(rows: &[T], target: WeekKey) -> TemporalSplit<T> {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for row in rows {
        if is_before(target, row) {
            train.push(row.clone());
        } else if row.week_key() == target {
            test.push(row.clone());
        }
    }
    sort_chronologically(&mut train);
    TemporalSplit { train, test }
}

pub fn distinct_weeks<T: Timed>(rows: &[T]) -> usize {
    rows.iter()
        .map(|row| row.week_key())
        .collect::<BTreeSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Row {
        key: WeekKey,
        win: Option<u8>,
    }

    impl Timed for Row {
        fn week_key(&self) -> WeekKey {
            self.key
        }
    }

    fn row(season: i32, week: u32, win: Option<u8>) -> Row {
        Row {
            key: WeekKey::new(season, week),
            win,
        }
    }

    #[test]
    fn is_before_is_strict() {
        let target = WeekKey::new(2023, 5);
        assert!(is_before(target, &WeekKey::new(2022, 18)));
        assert!(is_before(target, &WeekKey::new(2023, 4)));
        assert!(!is_before(target, &WeekKey::new(2023, 5)));
        assert!(!is_before(target, &WeekKey::new(2023, 6)));
        assert!(!is_before(target, &WeekKey::new(2024, 1)));
    }

    #[test]
    fn split_keeps_weeks_one_to_four_for_week_five() {
        let mut rows = Vec::new();
        for week in 1..=4 {
            rows.push(row(2023, week, Some(1)));
            rows.push(row(2023, week, Some(0)));
        }
        rows.push(row(2023, 5, None));
        rows.push(row(2023, 5, None));
        rows.push(row(2023, 6, None));

        let split = split_at_target(&rows, WeekKey::new(2023, 5));
        assert_eq!(split.train.len(), 8);
        assert!(split.train.iter().all(|r| (1..=4).contains(&r.key.week)));
        assert!(split.train.iter().all(|r| r.win.is_some()));
        assert_eq!(split.test.len(), 2);
        assert!(split.test.iter().all(|r| r.key == WeekKey::new(2023, 5)));
    }

    #[test]
    fn sort_is_stable_within_a_week() {
        let mut rows = vec![
            row(2023, 2, Some(1)),
            row(2022, 9, Some(0)),
            row(2023, 2, Some(0)),
            row(2023, 1, None),
        ];
        sort_chronologically(&mut rows);
        let keys: Vec<_> = rows.iter().map(|r| (r.key.season, r.key.week, r.win)).collect();
        assert_eq!(
            keys,
            vec![
                (2022, 9, Some(0)),
                (2023, 1, None),
                (2023, 2, Some(1)),
                (2023, 2, Some(0)),
            ]
        );
    }

    #[test]
    fn weeks_until_spans_seasons() {
        let a = WeekKey::new(2021, 17);
        let b = WeekKey::new(2022, 2);
        assert_eq!(a.weeks_until(b), 3.0);
        assert_eq!(b.weeks_until(a), 0.0);
        assert_eq!(distinct_weeks(&[a, b, a]), 2);
        assert_eq!(format!("{a}"), "2021_W17");
    }
}
