use async_trait::async_trait;

use super::{Stage, StageDefinition, StageFailure, StageKind, names};
use crate::state::{Field, FieldUpdate, Source, StateContainer};
use crate::text::{count_words, references};

/// Appends the reference list and produces the final text.
pub struct GenerateReferences {
    def: StageDefinition,
}

impl GenerateReferences {
    pub fn new() -> Self {
        Self {
            def: StageDefinition::new(names::GENERATE_REFERENCES, StageKind::Deterministic)
                .inputs([Field::Draft, Field::Sources, Field::Requirements])
                .outputs([Field::References, Field::FinalText, Field::WordCount]),
        }
    }
}

impl Default for GenerateReferences {
    fn default() -> Self {
        Self::new()
    }
}

/// Sources cited in the draft; all verified sources when none are cited.
fn cited_sources<'a>(draft: &str, sources: &'a [Source]) -> Vec<&'a Source> {
    let cited: Vec<&Source> = sources
        .iter()
        .filter(|s| draft.contains(&s.in_text_citation()))
        .collect();
    if cited.is_empty() {
        sources.iter().filter(|s| s.verified).collect()
    } else {
        cited
    }
}

#[async_trait]
impl Stage for GenerateReferences {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let draft = state.draft().trim();
        if draft.is_empty() {
            return Err(StageFailure::fatal("no draft to finalize"));
        }

        let listed: Vec<Source> = cited_sources(draft, state.sources())
            .into_iter()
            .cloned()
            .collect();
        let refs = references::reference_list(&listed);
        let final_text = if refs.is_empty() {
            draft.to_string()
        } else {
            format!("{}\n\n{}", draft, refs)
        };
        // Body words only; the reference list is not part of the length target.
        let words = count_words(draft);

        tracing::info!(references = listed.len(), words, "Final text assembled");
        Ok(vec![
            FieldUpdate::References(refs),
            FieldUpdate::FinalText(final_text),
            FieldUpdate::WordCount(words),
        ])
    }
}

/// Terminal marker.
pub struct Finish {
    def: StageDefinition,
}

impl Finish {
    pub fn new() -> Self {
        Self {
            def: StageDefinition::new(names::FINISH, StageKind::Deterministic)
                .inputs([Field::FinalText]),
        }
    }
}

impl Default for Finish {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for Finish {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        if state.final_text().is_empty() {
            return Err(StageFailure::fatal("finish reached without final text"));
        }
        Ok(Vec::new())
    }
}
