use std::path::PathBuf;

use thiserror::Error;

/// Failure classes the trainer distinguishes between.
///
/// Only `MissingArtifact`, `ExplicitWindowInvalid` and `FeatureLayoutMismatch`
/// escape to callers. The others are detected, logged and turned into a
/// fallback where they happen; they exist as values so that the fallback paths
/// log a uniform message and tests can assert on them.
#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("data source unavailable: {source_name} (season {season}): {reason}")]
    DataSourceUnavailable {
        source_name: String,
        season: i32,
        reason: String,
    },

    #[error("training state revision {found:?} does not match {expected}")]
    BootstrapRevisionMismatch {
        found: Option<String>,
        expected: String,
    },

    #[error("invalid season window {start}..={end}: {reason}")]
    ExplicitWindowInvalid { start: i32, end: i32, reason: String },

    #[error("training state at {} is unreadable: {reason}", path.display())]
    StateCorruption { path: PathBuf, reason: String },

    #[error("feature layout mismatch: artifact has {artifact:?}, inference uses {inference:?}")]
    FeatureLayoutMismatch {
        artifact: Vec<String>,
        inference: Vec<String>,
    },
}

impl TrainerError {
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact { path: path.into() }
    }

    /// True for the classes that must stop the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingArtifact { .. }
                | Self::ExplicitWindowInvalid { .. }
                | Self::FeatureLayoutMismatch { .. }
        )
    }
}

/// Replaces NaN/inf with `fallback`.
pub fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

#[cfg(test)]
mod tests {
    use super::{TrainerError, finite_or};

    #[test]
    fn only_caller_facing_errors_are_fatal() {
        assert!(TrainerError::missing("model_2023_W05.json").is_fatal());
        assert!(
            TrainerError::ExplicitWindowInvalid {
                start: 2005,
                end: 2001,
                reason: "start after end".to_string(),
            }
            .is_fatal()
        );
        assert!(
            !TrainerError::StateCorruption {
                path: "training_state.json".into(),
                reason: "eof".to_string(),
            }
            .is_fatal()
        );
        assert!(
            !TrainerError::BootstrapRevisionMismatch {
                found: None,
                expected: "x".to_string(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn finite_or_replaces_non_finite() {
        assert_eq!(finite_or(f64::NAN, 0.0), 0.0);
        assert_eq!(finite_or(f64::INFINITY, 0.5), 0.5);
        assert_eq!(finite_or(0.25, 0.0), 0.25);
    }
}
