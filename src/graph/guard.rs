//! Route predicates.
//!
//! Guards are a closed vocabulary so the builder can reason about them:
//! every guard except [`Guard::Always`] belongs to one measured dimension and
//! is the exact negation of its partner in that dimension.

use serde::{Deserialize, Serialize};

use crate::state::StateContainer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    Always,
    WordCountInWindow,
    WordCountOutsideWindow,
    QualityPassed,
    QualityFailed,
    OriginalityWithinThreshold,
    OriginalityAboveThreshold,
}

/// The state measurement a guard reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Length,
    Quality,
    Originality,
}

impl Guard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::WordCountInWindow => "word_count_in_window",
            Self::WordCountOutsideWindow => "word_count_outside_window",
            Self::QualityPassed => "quality_passed",
            Self::QualityFailed => "quality_failed",
            Self::OriginalityWithinThreshold => "originality_within_threshold",
            Self::OriginalityAboveThreshold => "originality_above_threshold",
        }
    }

    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            Self::Always => None,
            Self::WordCountInWindow | Self::WordCountOutsideWindow => Some(Dimension::Length),
            Self::QualityPassed | Self::QualityFailed => Some(Dimension::Quality),
            Self::OriginalityWithinThreshold | Self::OriginalityAboveThreshold => {
                Some(Dimension::Originality)
            }
        }
    }

    /// The guard that holds exactly when this one does not.
    pub fn complement(&self) -> Option<Guard> {
        match self {
            Self::Always => None,
            Self::WordCountInWindow => Some(Self::WordCountOutsideWindow),
            Self::WordCountOutsideWindow => Some(Self::WordCountInWindow),
            Self::QualityPassed => Some(Self::QualityFailed),
            Self::QualityFailed => Some(Self::QualityPassed),
            Self::OriginalityWithinThreshold => Some(Self::OriginalityAboveThreshold),
            Self::OriginalityAboveThreshold => Some(Self::OriginalityWithinThreshold),
        }
    }

    /// Whether some state can satisfy both guards at once.
    pub fn overlaps(&self, other: &Guard) -> bool {
        self == other || self.complement() != Some(*other)
    }

    /// Evaluate against state fields only.
    pub fn holds(&self, state: &StateContainer) -> bool {
        match self {
            Self::Always => true,
            Self::WordCountInWindow => word_count_in_window(state),
            Self::WordCountOutsideWindow => !word_count_in_window(state),
            Self::QualityPassed => quality_passed(state),
            Self::QualityFailed => !quality_passed(state),
            Self::OriginalityWithinThreshold => originality_within_threshold(state),
            Self::OriginalityAboveThreshold => !originality_within_threshold(state),
        }
    }
}

impl std::fmt::Display for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn word_count_in_window(state: &StateContainer) -> bool {
    match (state.word_count(), state.length_window()) {
        (Some(count), Some(window)) => window.contains(count),
        _ => false,
    }
}

fn quality_passed(state: &StateContainer) -> bool {
    state.quality().is_some_and(|q| q.all_passed())
}

// A missing score counts as above threshold.
fn originality_within_threshold(state: &StateContainer) -> bool {
    state
        .originality_score()
        .is_some_and(|s| s <= state.thresholds().originality_threshold)
}
