//! Stages that measure the draft without changing it.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Stage, StageDefinition, StageFailure, StageKind, names};
use crate::services::OriginalityDetector;
use crate::state::{Field, FieldUpdate, StateContainer};
use crate::text::{count_words, rubric};

pub struct CheckWordCount {
    def: StageDefinition,
}

impl CheckWordCount {
    pub fn new() -> Self {
        Self::named(names::CHECK_WORD_COUNT)
    }

    /// The same count under another stage name, for a second check point.
    pub fn named(name: &str) -> Self {
        Self {
            def: StageDefinition::new(name, StageKind::Deterministic)
                .inputs([Field::Draft, Field::Requirements])
                .outputs([Field::WordCount]),
        }
    }
}

impl Default for CheckWordCount {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for CheckWordCount {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let count = count_words(state.draft());
        if let Some(window) = state.length_window() {
            tracing::info!(
                count,
                low = window.low,
                high = window.high,
                in_window = window.contains(count),
                "Word count checked"
            );
        }
        Ok(vec![FieldUpdate::WordCount(count)])
    }
}

/// Scores the draft against the numbered writing rubric.
pub struct CheckQuality {
    def: StageDefinition,
}

impl CheckQuality {
    pub fn new() -> Self {
        Self::named(names::CHECK_QUALITY)
    }

    pub fn named(name: &str) -> Self {
        Self {
            def: StageDefinition::new(name, StageKind::Validating)
                .inputs([Field::Draft, Field::Sources])
                .outputs([Field::Quality]),
        }
    }
}

impl Default for CheckQuality {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for CheckQuality {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let report = rubric::assess(state.draft());
        let failing: Vec<u8> = report.failing().iter().map(|r| r.number()).collect();
        if failing.is_empty() {
            tracing::info!("All quality rules pass");
        } else {
            tracing::info!(?failing, issues = report.issues.len(), "Quality rules failing");
        }
        Ok(vec![FieldUpdate::Quality(report)])
    }
}

/// Asks the detection service how machine-generated the draft body reads.
pub struct CheckOriginality {
    def: StageDefinition,
    detector: Arc<dyn OriginalityDetector>,
}

impl CheckOriginality {
    pub fn new(detector: Arc<dyn OriginalityDetector>) -> Self {
        Self {
            def: StageDefinition::new(names::CHECK_ORIGINALITY, StageKind::Validating)
                .inputs([Field::Draft])
                .outputs([Field::OriginalityScore]),
            detector,
        }
    }
}

/// The draft without a trailing references section.
fn body_without_references(draft: &str) -> &str {
    for marker in ["\n\nReferences\n", "\n\n# References\n", "\n\n## References\n"] {
        if let Some(pos) = draft.find(marker) {
            return draft[..pos].trim_end();
        }
    }
    draft.trim_end()
}

#[async_trait]
impl Stage for CheckOriginality {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let body = body_without_references(state.draft());
        if body.is_empty() {
            return Err(StageFailure::fatal("no draft to score for originality"));
        }
        let score = self.detector.score(body).await?;
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(StageFailure::malformed(format!(
                "originality score {} is outside [0, 100]",
                score
            )));
        }
        tracing::info!(
            score,
            threshold = state.thresholds().originality_threshold,
            "Originality scored"
        );
        Ok(vec![FieldUpdate::OriginalityScore(score)])
    }
}
