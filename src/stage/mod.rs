//! Stages: the units of work the orchestrator drives.
//!
//! A stage is a [`StageDefinition`] (name, category, declared inputs and
//! outputs) plus an implementation of [`Stage::run`] that turns the current
//! state into a batch of [`FieldUpdate`]s. [`Stage::execute`] applies that
//! batch through the state container, which enforces the declared outputs.

mod analyze;
mod checks;
mod citations;
mod finalize;
pub mod prompts;
mod writing;

pub use analyze::AnalyzeRequirements;
pub use checks::{CheckOriginality, CheckQuality, CheckWordCount};
pub use citations::{IntegrateCitations, ReapplyCitations};
pub use finalize::{Finish, GenerateReferences};
pub use writing::{AdjustLength, Humanize, Revise, WriteDraft};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{CollaboratorError, ValidationError};
use crate::services::Collaborators;
use crate::state::{Field, FieldUpdate, StageName, StateContainer};

/// Stage names of the standard pipeline.
pub mod names {
    pub const ANALYZE_REQUIREMENTS: &str = "analyze_requirements";
    pub const WRITE_DRAFT: &str = "write_draft";
    pub const INTEGRATE_CITATIONS: &str = "integrate_citations";
    pub const CHECK_WORD_COUNT: &str = "check_word_count";
    pub const ADJUST_LENGTH: &str = "adjust_length";
    pub const CHECK_QUALITY: &str = "check_quality";
    pub const REVISE: &str = "revise";
    pub const REAPPLY_CITATIONS: &str = "reapply_citations";
    pub const CHECK_ORIGINALITY: &str = "check_originality";
    pub const HUMANIZE: &str = "humanize";
    pub const VERIFY_QUALITY: &str = "verify_quality";
    pub const REPAIR_QUALITY: &str = "repair_quality";
    pub const VERIFY_WORD_COUNT: &str = "verify_word_count";
    pub const FIT_LENGTH: &str = "fit_length";
    pub const GENERATE_REFERENCES: &str = "generate_references";
    pub const FINISH: &str = "finish";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Calls the text generator and writes content.
    Generative,
    /// Assesses content and writes only an assessment.
    Validating,
    /// Pure computation over existing fields; no external calls.
    Deterministic,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generative => "generative",
            Self::Validating => "validating",
            Self::Deterministic => "deterministic",
        }
    }
}

/// Name, category and declared field sets of a stage. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    name: StageName,
    kind: StageKind,
    inputs: BTreeSet<Field>,
    outputs: BTreeSet<Field>,
}

impl StageDefinition {
    pub fn new(name: impl Into<StageName>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        }
    }

    pub fn inputs(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.inputs.extend(fields);
        self
    }

    pub fn outputs(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.outputs.extend(fields);
        self
    }

    pub fn name(&self) -> &StageName {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn input_fields(&self) -> &BTreeSet<Field> {
        &self.inputs
    }

    pub fn output_fields(&self) -> &BTreeSet<Field> {
        &self.outputs
    }

    pub fn writes(&self, field: Field) -> bool {
        self.outputs.contains(&field)
    }
}

/// Why a stage did not produce output.
#[derive(Debug, Clone, PartialEq)]
pub enum StageFailure {
    /// Transient; the orchestrator may run the stage again.
    Retryable(CollaboratorError),
    /// The run cannot continue.
    Fatal(String),
}

impl From<CollaboratorError> for StageFailure {
    fn from(err: CollaboratorError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

impl StageFailure {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Retryable(CollaboratorError::Malformed(detail.into()))
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// Three-way result signal of one stage execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StageSignal {
    Ok,
    Retryable(CollaboratorError),
    Fatal(String),
}

/// The state after a stage execution plus its signal. On anything other
/// than `Ok` the state is the input state unchanged.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub state: StateContainer,
    pub signal: StageSignal,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn definition(&self) -> &StageDefinition;

    /// Compute the updates this stage wants to write.
    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure>;

    /// Run the stage and apply its output.
    ///
    /// Fails only when the stage wrote outside its declared outputs.
    async fn execute(&self, state: &StateContainer) -> Result<StageOutcome, ValidationError> {
        let definition = self.definition();
        match self.run(state).await {
            Ok(updates) => Ok(StageOutcome {
                state: state.advance(definition, updates)?,
                signal: StageSignal::Ok,
            }),
            Err(StageFailure::Retryable(err)) if definition.kind() == StageKind::Deterministic => {
                Ok(StageOutcome {
                    state: state.clone(),
                    signal: StageSignal::Fatal(err.to_string()),
                })
            }
            Err(StageFailure::Retryable(err)) => Ok(StageOutcome {
                state: state.clone(),
                signal: StageSignal::Retryable(err),
            }),
            Err(StageFailure::Fatal(reason)) => Ok(StageOutcome {
                state: state.clone(),
                signal: StageSignal::Fatal(reason),
            }),
        }
    }
}

/// Every stage of the standard pipeline, wired to the given collaborators.
pub fn standard_stages(services: &Collaborators) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(AnalyzeRequirements::new(
            services.generator.clone(),
            services.extractor.clone(),
        )),
        Arc::new(WriteDraft::new(services.generator.clone())),
        Arc::new(IntegrateCitations::new(
            services.generator.clone(),
            services.search.clone(),
        )),
        Arc::new(CheckWordCount::new()),
        Arc::new(AdjustLength::new(services.generator.clone())),
        Arc::new(CheckQuality::new()),
        Arc::new(Revise::new(services.generator.clone())),
        Arc::new(ReapplyCitations::new()),
        Arc::new(CheckOriginality::new(services.detector.clone())),
        Arc::new(Humanize::new(services.humanizer.clone())),
        Arc::new(CheckQuality::named(names::VERIFY_QUALITY)),
        Arc::new(Revise::preserving_style(services.generator.clone())),
        Arc::new(CheckWordCount::named(names::VERIFY_WORD_COUNT)),
        Arc::new(AdjustLength::preserving_style(services.generator.clone())),
        Arc::new(GenerateReferences::new()),
        Arc::new(Finish::new()),
    ]
}

/// Required-field helper for stage implementations.
pub(crate) fn require<T>(value: Option<T>, stage: &str, what: &str) -> Result<T, StageFailure> {
    value.ok_or_else(|| StageFailure::fatal(format!("{} ran before {} was available", stage, what)))
}
