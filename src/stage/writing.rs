//! Generative stages that produce or rewrite the draft.

use std::sync::Arc;

use async_trait::async_trait;

use super::prompts::{self, Voice};
use super::{Stage, StageDefinition, StageFailure, StageKind, names, require};
use crate::services::{Granularity, Humanizer, TextGenerator};
use crate::state::{Field, FieldUpdate, StateContainer};
use crate::text::{citations, count_words, is_prose, rubric};

fn ensure_prose(stage: &str, text: &str) -> Result<(), StageFailure> {
    if is_prose(text) {
        Ok(())
    } else {
        Err(StageFailure::malformed(format!(
            "{} returned empty, fenced or structured output",
            stage
        )))
    }
}

pub struct WriteDraft {
    def: StageDefinition,
    generator: Arc<dyn TextGenerator>,
}

impl WriteDraft {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            def: StageDefinition::new(names::WRITE_DRAFT, StageKind::Generative)
                .inputs([Field::Requirements])
                .outputs([Field::Draft]),
            generator,
        }
    }
}

#[async_trait]
impl Stage for WriteDraft {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let req = require(state.requirements(), names::WRITE_DRAFT, "requirements")?;
        let draft = self.generator.generate(&prompts::write_draft(req)).await?;
        ensure_prose(names::WRITE_DRAFT, &draft)?;
        tracing::info!(words = count_words(&draft), "Draft written");
        Ok(vec![FieldUpdate::Draft(draft.trim().to_string())])
    }
}

/// Expands a short draft or shortens a long one toward the length window.
pub struct AdjustLength {
    def: StageDefinition,
    generator: Arc<dyn TextGenerator>,
    voice: Voice,
}

impl AdjustLength {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(names::ADJUST_LENGTH, generator, Voice::Free)
    }

    /// Length fixes on a humanized draft; wording outside the change stays put.
    pub fn preserving_style(generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(names::FIT_LENGTH, generator, Voice::Preserve)
    }

    fn build(name: &str, generator: Arc<dyn TextGenerator>, voice: Voice) -> Self {
        Self {
            def: StageDefinition::new(name, StageKind::Generative)
                .inputs([Field::Draft, Field::WordCount, Field::Requirements])
                .outputs([Field::Draft, Field::Expansions, Field::Shortenings]),
            generator,
            voice,
        }
    }
}

#[async_trait]
impl Stage for AdjustLength {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let name = self.def.name().as_str();
        let window = require(state.length_window(), name, "requirements")?;
        let current = state.word_count().unwrap_or_else(|| count_words(state.draft()));

        let expanding = if current < window.low {
            true
        } else if current > window.high {
            false
        } else {
            tracing::debug!(current, "Draft already inside the length window");
            return Ok(Vec::new());
        };

        let instruction = if expanding {
            prompts::expand(state.draft(), current, window, self.voice)
        } else {
            prompts::shorten(state.draft(), current, window, self.voice)
        };
        let revised = self.generator.generate(&instruction).await?;
        ensure_prose(name, &revised)?;

        let new_count = count_words(&revised);
        if expanding && new_count < current {
            return Err(StageFailure::malformed(format!(
                "expansion shrank the draft from {} to {} words",
                current, new_count
            )));
        }
        if !expanding && new_count > current {
            return Err(StageFailure::malformed(format!(
                "shortening grew the draft from {} to {} words",
                current, new_count
            )));
        }

        tracing::info!(from = current, to = new_count, expanding, "Length adjusted");
        let counter = if expanding {
            FieldUpdate::IncrementExpansions
        } else {
            FieldUpdate::IncrementShortenings
        };
        Ok(vec![FieldUpdate::Draft(revised.trim().to_string()), counter])
    }
}

/// Rewrites the draft against the failing rubric rules.
pub struct Revise {
    def: StageDefinition,
    generator: Arc<dyn TextGenerator>,
    voice: Voice,
}

impl Revise {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(names::REVISE, generator, Voice::Free)
    }

    /// Rule fixes on a humanized draft: only the flagged problems change.
    pub fn preserving_style(generator: Arc<dyn TextGenerator>) -> Self {
        Self::build(names::REPAIR_QUALITY, generator, Voice::Preserve)
    }

    fn build(name: &str, generator: Arc<dyn TextGenerator>, voice: Voice) -> Self {
        Self {
            def: StageDefinition::new(name, StageKind::Generative)
                .inputs([Field::Draft, Field::Quality, Field::Requirements])
                .outputs([Field::Draft, Field::Revisions]),
            generator,
            voice,
        }
    }
}

#[async_trait]
impl Stage for Revise {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let name = self.def.name().as_str();
        let req = require(state.requirements(), name, "requirements")?;
        let report = require(state.quality(), name, "a quality report")?;
        let failing = report.failing();

        let instruction = prompts::revise(state.draft(), &failing, &report.issues, req, self.voice);
        let revised = self.generator.generate(&instruction).await?;
        ensure_prose(name, &revised)?;

        // A revision may not break a rule the previous draft satisfied.
        let regressions = report.regressions(&rubric::assess(&revised));
        if !regressions.is_empty() {
            let numbers: Vec<String> = regressions.iter().map(|r| r.number().to_string()).collect();
            return Err(StageFailure::malformed(format!(
                "revision broke previously passing rule(s) {}",
                numbers.join(", ")
            )));
        }

        tracing::info!(
            fixing = failing.len(),
            revision = state.counters().revisions + 1,
            "Draft revised"
        );
        Ok(vec![
            FieldUpdate::Draft(revised.trim().to_string()),
            FieldUpdate::IncrementRevisions,
        ])
    }
}

/// Rewrites the draft to read less machine-generated.
pub struct Humanize {
    def: StageDefinition,
    humanizer: Arc<dyn Humanizer>,
}

impl Humanize {
    pub fn new(humanizer: Arc<dyn Humanizer>) -> Self {
        Self {
            def: StageDefinition::new(names::HUMANIZE, StageKind::Generative)
                .inputs([Field::Draft, Field::OriginalityScore])
                .outputs([Field::Draft, Field::Humanizations]),
            humanizer,
        }
    }
}

#[async_trait]
impl Stage for Humanize {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let score = require(state.originality_score(), names::HUMANIZE, "an originality score")?;
        let granularity = Granularity::for_score(score);
        let rewritten = self.humanizer.rewrite(state.draft(), granularity).await?;
        ensure_prose(names::HUMANIZE, &rewritten)?;

        if !citations(state.draft()).is_empty() && citations(&rewritten).is_empty() {
            return Err(StageFailure::malformed("humanized text dropped every citation"));
        }

        tracing::info!(score, mode = granularity.as_str(), "Draft humanized");
        Ok(vec![
            FieldUpdate::Draft(rewritten.trim().to_string()),
            FieldUpdate::IncrementHumanizations,
        ])
    }
}
