//! Field keys and the updates stages are allowed to emit.

use serde::{Deserialize, Serialize};

use super::model::{QualityReport, Requirements, Source};

/// Names of the content fields of a [`super::StateContainer`].
///
/// Stage definitions declare which of these they read and write; the
/// container rejects any write outside the declared outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// The raw order as received (description, pages, attachments). Read-only.
    Brief,
    Requirements,
    Draft,
    WordCount,
    Sources,
    Quality,
    OriginalityScore,
    References,
    FinalText,
    Revisions,
    Expansions,
    Shortenings,
    Humanizations,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Requirements => "requirements",
            Self::Draft => "draft",
            Self::WordCount => "word_count",
            Self::Sources => "sources",
            Self::Quality => "quality",
            Self::OriginalityScore => "originality_score",
            Self::References => "references",
            Self::FinalText => "final_text",
            Self::Revisions => "revisions",
            Self::Expansions => "expansions",
            Self::Shortenings => "shortenings",
            Self::Humanizations => "humanizations",
        }
    }

    /// Verdicts about the content rather than content itself.
    pub fn is_assessment(&self) -> bool {
        matches!(self, Self::WordCount | Self::Quality | Self::OriginalityScore)
    }

    /// Fields present from construction; nothing needs to produce them.
    pub fn provided_by_order(&self) -> bool {
        matches!(
            self,
            Self::Brief
                | Self::Revisions
                | Self::Expansions
                | Self::Shortenings
                | Self::Humanizations
        )
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single write a stage asks the container to apply.
///
/// Work counters can only be incremented, which keeps them monotonic.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Requirements(Requirements),
    Draft(String),
    WordCount(u32),
    Sources(Vec<Source>),
    Quality(QualityReport),
    OriginalityScore(f64),
    References(String),
    FinalText(String),
    IncrementRevisions,
    IncrementExpansions,
    IncrementShortenings,
    IncrementHumanizations,
}

impl FieldUpdate {
    /// The field this update writes.
    pub fn field(&self) -> Field {
        match self {
            Self::Requirements(_) => Field::Requirements,
            Self::Draft(_) => Field::Draft,
            Self::WordCount(_) => Field::WordCount,
            Self::Sources(_) => Field::Sources,
            Self::Quality(_) => Field::Quality,
            Self::OriginalityScore(_) => Field::OriginalityScore,
            Self::References(_) => Field::References,
            Self::FinalText(_) => Field::FinalText,
            Self::IncrementRevisions => Field::Revisions,
            Self::IncrementExpansions => Field::Expansions,
            Self::IncrementShortenings => Field::Shortenings,
            Self::IncrementHumanizations => Field::Humanizations,
        }
    }
}
