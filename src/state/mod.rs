//! The versioned state container threaded through every stage of a run.
//!
//! A container is never mutated in place: [`StateContainer::advance`] (stage
//! output) and [`StateContainer::transition`] (orchestrator bookkeeping) both
//! return a new value one version ahead, with an entry appended to the
//! history log.
//!
//! A container carries only the newest [`HISTORY_WINDOW`] log entries, so a
//! checkpoint stays the same size however long the run. A stage adds a
//! handful of entries between checkpoints, which keeps every entry in at
//! least one checkpoint of the run.

mod control;
mod fields;
mod model;

pub use control::{ControlUpdate, DegradedFlags, ErrorRecord, LoopCounters, LoopKind, RunStatus};
pub use fields::{Field, FieldUpdate};
pub use model::{
    CitationStyle, LengthWindow, OrderBrief, QualityIssue, QualityReport, QualityRule,
    Requirements, Source, Thresholds,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::stage::StageDefinition;

/// Identifier of an order (and of the single run allowed for it at a time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique key of a stage in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(String);

impl StageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StageName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<&str> for StageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    StageOutput { stage: StageName, fields: Vec<Field> },
    Control { description: String },
}

/// History entries kept in a container.
pub const HISTORY_WINDOW: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub at: DateTime<Utc>,
    pub event: HistoryEvent,
}

/// Monotonic work counters written by generative stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCounters {
    pub revisions: u32,
    pub expansions: u32,
    pub shortenings: u32,
    pub humanizations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateContainer {
    order_id: OrderId,
    version: u64,
    brief: OrderBrief,
    thresholds: Thresholds,
    requirements: Option<Requirements>,
    draft: String,
    word_count: Option<u32>,
    sources: Vec<Source>,
    quality: Option<QualityReport>,
    originality_score: Option<f64>,
    references: String,
    final_text: String,
    counters: WorkCounters,
    current_stage: Option<StageName>,
    status: RunStatus,
    loops: LoopCounters,
    degraded: DegradedFlags,
    error: Option<ErrorRecord>,
    terminal: bool,
    history: Vec<HistoryEntry>,
}

impl StateContainer {
    /// Version 0 of a fresh run.
    pub fn new(order_id: OrderId, brief: OrderBrief, thresholds: Thresholds) -> Self {
        Self {
            order_id,
            version: 0,
            brief,
            thresholds,
            requirements: None,
            draft: String::new(),
            word_count: None,
            sources: Vec::new(),
            quality: None,
            originality_score: None,
            references: String::new(),
            final_text: String::new(),
            counters: WorkCounters::default(),
            current_stage: None,
            status: RunStatus::Running,
            loops: LoopCounters::default(),
            degraded: DegradedFlags::default(),
            error: None,
            terminal: false,
            history: Vec::new(),
        }
    }

    /// Apply a stage's output, producing the next version.
    ///
    /// Every update is checked against the stage's declared outputs before
    /// anything is applied; one undeclared write rejects the whole batch.
    pub fn advance(
        &self,
        stage: &StageDefinition,
        updates: Vec<FieldUpdate>,
    ) -> Result<StateContainer, ValidationError> {
        if let Some(bad) = updates.iter().find(|u| !stage.writes(u.field())) {
            return Err(ValidationError {
                stage: stage.name().clone(),
                field: bad.field(),
            });
        }

        let mut next = self.clone();
        let mut fields = Vec::with_capacity(updates.len());
        for update in updates {
            fields.push(update.field());
            next.apply(update);
        }
        fields.dedup();
        next.record(HistoryEvent::StageOutput {
            stage: stage.name().clone(),
            fields,
        });
        Ok(next)
    }

    /// Apply orchestrator bookkeeping, producing the next version.
    pub fn transition(&self, update: ControlUpdate) -> StateContainer {
        let mut next = self.clone();
        let description = update.describe();
        match update {
            ControlUpdate::StageCompleted(stage) => next.current_stage = Some(stage),
            ControlUpdate::LoopEntered(kind) => next.loops.record_entry(kind),
            ControlUpdate::Escalated(kind) => next.degraded.set(kind),
            ControlUpdate::Finished => {
                next.status = RunStatus::Completed;
                next.terminal = true;
            }
            ControlUpdate::Failed(record) => {
                next.status = RunStatus::Failed;
                next.error = Some(record);
                next.terminal = true;
            }
            ControlUpdate::Cancelled => next.status = RunStatus::Cancelled,
        }
        next.record(HistoryEvent::Control { description });
        next
    }

    fn apply(&mut self, update: FieldUpdate) {
        match update {
            FieldUpdate::Requirements(r) => self.requirements = Some(r),
            FieldUpdate::Draft(d) => self.draft = d,
            FieldUpdate::WordCount(c) => self.word_count = Some(c),
            FieldUpdate::Sources(s) => self.sources = s,
            FieldUpdate::Quality(q) => self.quality = Some(q),
            FieldUpdate::OriginalityScore(s) => self.originality_score = Some(s),
            FieldUpdate::References(r) => self.references = r,
            FieldUpdate::FinalText(t) => self.final_text = t,
            FieldUpdate::IncrementRevisions => self.counters.revisions += 1,
            FieldUpdate::IncrementExpansions => self.counters.expansions += 1,
            FieldUpdate::IncrementShortenings => self.counters.shortenings += 1,
            FieldUpdate::IncrementHumanizations => self.counters.humanizations += 1,
        }
    }

    fn record(&mut self, event: HistoryEvent) {
        self.version += 1;
        self.history.push(HistoryEntry {
            version: self.version,
            at: Utc::now(),
            event,
        });
        if self.history.len() > HISTORY_WINDOW {
            let excess = self.history.len() - HISTORY_WINDOW;
            self.history.drain(..excess);
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn brief(&self) -> &OrderBrief {
        &self.brief
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn requirements(&self) -> Option<&Requirements> {
        self.requirements.as_ref()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn word_count(&self) -> Option<u32> {
        self.word_count
    }

    /// Target words from the requirements, if they have been analyzed.
    pub fn target_words(&self) -> Option<u32> {
        self.requirements.as_ref().map(|r| r.target_words)
    }

    pub fn length_window(&self) -> Option<LengthWindow> {
        self.target_words()
            .map(|target| LengthWindow::around(target, self.thresholds.length_tolerance))
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn quality(&self) -> Option<&QualityReport> {
        self.quality.as_ref()
    }

    pub fn originality_score(&self) -> Option<f64> {
        self.originality_score
    }

    pub fn references(&self) -> &str {
        &self.references
    }

    pub fn final_text(&self) -> &str {
        &self.final_text
    }

    pub fn counters(&self) -> WorkCounters {
        self.counters
    }

    pub fn current_stage(&self) -> Option<&StageName> {
        self.current_stage.as_ref()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn loops(&self) -> &LoopCounters {
        &self.loops
    }

    pub fn degraded(&self) -> DegradedFlags {
        self.degraded
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// The newest history entries, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Best content a failed or cancelled run can hand back.
    pub fn recoverable_draft(&self) -> Option<&str> {
        if !self.final_text.is_empty() {
            Some(&self.final_text)
        } else if !self.draft.is_empty() {
            Some(&self.draft)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;

    fn brief() -> OrderBrief {
        OrderBrief {
            description: "Essay on urban heat islands".into(),
            pages: 5,
            deadline: None,
            target_words: None,
            attachments: vec![],
        }
    }

    fn state() -> StateContainer {
        StateContainer::new(OrderId::from("A-1"), brief(), Thresholds::default())
    }

    fn writer() -> StageDefinition {
        StageDefinition::new("write_draft", StageKind::Generative)
            .inputs([Field::Requirements])
            .outputs([Field::Draft])
    }

    #[test]
    fn new_state_is_version_zero_and_running() {
        let s = state();
        assert_eq!(s.version(), 0);
        assert_eq!(s.status(), RunStatus::Running);
        assert!(s.current_stage().is_none());
        assert!(!s.is_terminal());
        assert!(s.history().is_empty());
    }

    #[test]
    fn advance_returns_new_version_and_leaves_original() {
        let s0 = state();
        let s1 = s0
            .advance(&writer(), vec![FieldUpdate::Draft("Body text.".into())])
            .unwrap();
        assert_eq!(s0.version(), 0);
        assert_eq!(s0.draft(), "");
        assert_eq!(s1.version(), 1);
        assert_eq!(s1.draft(), "Body text.");
        assert_eq!(s1.history().len(), 1);
    }

    #[test]
    fn history_keeps_only_the_newest_entries() {
        let mut s = state();
        for _ in 0..200 {
            s = s.transition(ControlUpdate::LoopEntered(LoopKind::Length));
        }
        assert_eq!(s.version(), 200);
        let versions: Vec<u64> = s.history().iter().map(|e| e.version).collect();
        assert_eq!(versions.len(), HISTORY_WINDOW);
        assert_eq!(versions.first(), Some(&(200 - HISTORY_WINDOW as u64 + 1)));
        assert_eq!(versions.last(), Some(&200));
        assert!(versions.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(s.loops().length, 200);
    }

    #[test]
    fn advance_rejects_undeclared_field_without_applying_anything() {
        let s0 = state();
        let err = s0
            .advance(
                &writer(),
                vec![
                    FieldUpdate::Draft("ok".into()),
                    FieldUpdate::WordCount(2),
                ],
            )
            .unwrap_err();
        assert_eq!(err.stage, StageName::from("write_draft"));
        assert_eq!(err.field, Field::WordCount);
        assert_eq!(s0.version(), 0);
    }

    #[test]
    fn validating_stage_cannot_touch_draft() {
        let checker = StageDefinition::new("check_quality", StageKind::Validating)
            .inputs([Field::Draft])
            .outputs([Field::Quality]);
        let err = state()
            .advance(&checker, vec![FieldUpdate::Draft("rewritten".into())])
            .unwrap_err();
        assert_eq!(err.field, Field::Draft);
    }

    #[test]
    fn work_counters_only_increment() {
        let reviser = StageDefinition::new("revise", StageKind::Generative)
            .outputs([Field::Draft, Field::Revisions]);
        let s1 = state()
            .advance(&reviser, vec![FieldUpdate::IncrementRevisions])
            .unwrap();
        let s2 = s1
            .advance(&reviser, vec![FieldUpdate::IncrementRevisions])
            .unwrap();
        assert_eq!(s2.counters().revisions, 2);
    }

    #[test]
    fn failure_transition_is_terminal_and_keeps_content() {
        let s1 = state()
            .advance(&writer(), vec![FieldUpdate::Draft("Partial draft.".into())])
            .unwrap();
        let failed = s1.transition(ControlUpdate::Failed(ErrorRecord {
            kind: "fatal_failure".into(),
            message: "service down".into(),
            stage: Some(StageName::from("check_originality")),
        }));
        assert!(failed.is_terminal());
        assert_eq!(failed.status(), RunStatus::Failed);
        assert_eq!(failed.recoverable_draft(), Some("Partial draft."));
        assert_eq!(failed.version(), s1.version() + 1);
    }

    #[test]
    fn cancel_is_not_terminal_completion() {
        let s = state().transition(ControlUpdate::Cancelled);
        assert_eq!(s.status(), RunStatus::Cancelled);
        assert!(!s.is_terminal());
    }

    #[test]
    fn state_survives_json_roundtrip() {
        let s = state()
            .advance(&writer(), vec![FieldUpdate::Draft("x".into())])
            .unwrap()
            .transition(ControlUpdate::LoopEntered(LoopKind::Length));
        let json = serde_json::to_string(&s).unwrap();
        let back: StateContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
