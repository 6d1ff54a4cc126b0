use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Stage, StageDefinition, StageFailure, StageKind, names, prompts, require};
use crate::services::{SourceQuery, SourceSearch, TextGenerator};
use crate::state::{Field, FieldUpdate, Source, StateContainer};
use crate::text::{count_words, insert_citations, is_prose};

/// Oldest publication year accepted as a source.
pub const MIN_SOURCE_YEAR: i32 = 2020;
const MAX_SEARCH_PAGES: usize = 3;

/// Finds sources and weaves in-text citations into the draft.
pub struct IntegrateCitations {
    def: StageDefinition,
    generator: Arc<dyn TextGenerator>,
    search: Arc<dyn SourceSearch>,
}

impl IntegrateCitations {
    pub fn new(generator: Arc<dyn TextGenerator>, search: Arc<dyn SourceSearch>) -> Self {
        Self {
            def: StageDefinition::new(names::INTEGRATE_CITATIONS, StageKind::Generative)
                .inputs([Field::Requirements, Field::Draft])
                .outputs([Field::Sources, Field::Draft]),
            generator,
            search,
        }
    }

    /// Page through search results until enough verified sources are found.
    async fn collect_sources(&self, keywords: &[String], wanted: usize) -> Result<Vec<Source>, StageFailure> {
        let mut seen = HashSet::new();
        let mut verified = Vec::new();
        let mut unverified = Vec::new();
        let page_size = (wanted * 3).max(5);

        for page in 0..MAX_SEARCH_PAGES {
            let query = SourceQuery {
                keywords: keywords.to_vec(),
                min_year: MIN_SOURCE_YEAR,
                require_abstract: true,
                limit: page_size,
                offset: page * page_size,
            };
            let hits = self.search.search(&query).await?;
            if hits.is_empty() {
                break;
            }
            for hit in hits {
                if !seen.insert(hit.title.trim().to_lowercase()) {
                    continue;
                }
                let source = hit.into_source();
                if source.verified {
                    verified.push(source);
                } else {
                    unverified.push(source);
                }
            }
            if verified.len() >= wanted {
                break;
            }
        }

        verified.truncate(wanted);
        tracing::info!(
            verified = verified.len(),
            unverified = unverified.len(),
            wanted,
            "Sources collected"
        );
        verified.extend(unverified);
        Ok(verified)
    }
}

#[async_trait]
impl Stage for IntegrateCitations {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let req = require(state.requirements(), names::INTEGRATE_CITATIONS, "requirements")?;
        let sources = self
            .collect_sources(&req.keywords, req.required_sources)
            .await?;
        let to_cite: Vec<Source> = sources.iter().filter(|s| s.verified).cloned().collect();

        if to_cite.is_empty() {
            tracing::warn!("No verified sources found; draft left without citations");
            return Ok(vec![FieldUpdate::Sources(sources)]);
        }

        let woven = self
            .generator
            .generate(&prompts::integrate_citations(state.draft(), &to_cite))
            .await?;
        if !is_prose(&woven) {
            return Err(StageFailure::malformed("citation pass returned no prose"));
        }
        // The woven text must still carry the draft's body.
        let before = count_words(state.draft());
        let after = count_words(&woven);
        if after * 2 < before {
            return Err(StageFailure::malformed(format!(
                "citation pass dropped the body ({} -> {} words)",
                before, after
            )));
        }
        if !to_cite.iter().any(|s| woven.contains(&s.in_text_citation())) {
            return Err(StageFailure::malformed("citation pass inserted no citations"));
        }

        Ok(vec![
            FieldUpdate::Sources(sources),
            FieldUpdate::Draft(woven.trim().to_string()),
        ])
    }
}

/// Puts back verified citations a revision removed.
pub struct ReapplyCitations {
    def: StageDefinition,
}

impl ReapplyCitations {
    pub fn new() -> Self {
        Self {
            def: StageDefinition::new(names::REAPPLY_CITATIONS, StageKind::Deterministic)
                .inputs([Field::Draft, Field::Sources])
                .outputs([Field::Draft]),
        }
    }
}

impl Default for ReapplyCitations {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for ReapplyCitations {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let draft = state.draft();
        let missing: Vec<String> = state
            .sources()
            .iter()
            .filter(|s| s.verified)
            .map(Source::in_text_citation)
            .filter(|c| !draft.contains(c.as_str()))
            .collect();

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let (updated, placed) = insert_citations(draft, &missing);
        if placed == 0 {
            tracing::warn!(missing = missing.len(), "No body paragraph can take the dropped citations");
            return Ok(Vec::new());
        }
        tracing::info!(placed, "Citations reapplied");
        Ok(vec![FieldUpdate::Draft(updated)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollaboratorError;
    use crate::services::SourceCandidate;
    use crate::stage::StageSignal;
    use crate::stage::test_support::{Scripted, requirements, seeded};
    use std::sync::Mutex;

    struct Pages {
        pages: Mutex<Vec<Vec<SourceCandidate>>>,
        queries: Mutex<Vec<SourceQuery>>,
    }

    #[async_trait]
    impl SourceSearch for Pages {
        async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceCandidate>, CollaboratorError> {
            self.queries.lock().unwrap().push(query.clone());
            let mut pages = self.pages.lock().unwrap();
            Ok(if pages.is_empty() { Vec::new() } else { pages.remove(0) })
        }
    }

    fn candidate(author: &str, title: &str, with_abstract: bool) -> SourceCandidate {
        SourceCandidate {
            title: title.into(),
            authors: vec![author.into()],
            year: Some(2022),
            url: None,
            abstract_text: with_abstract.then(|| "A".repeat(120)),
        }
    }

    const DRAFT: &str = "Intro line here.\n\nShade cools streets. Trees lower heat. Cities plant more.\n\nEnd line here.";

    #[tokio::test]
    async fn pages_until_enough_verified_sources() {
        let search = Arc::new(Pages {
            pages: Mutex::new(vec![
                vec![candidate("Jane Smith", "One", true), candidate("Li Wei", "Two", false)],
                vec![candidate("Ana Bell", "Three", true)],
                vec![candidate("Tom Cole", "Four", true)],
            ]),
            queries: Mutex::new(Vec::new()),
        });
        let woven = DRAFT.replace("Trees lower heat.", "Trees lower heat (Smith, 2022) (Bell, 2022).");
        let generator = Arc::new(Scripted::new(vec![Ok(woven.clone())]));
        let stage = IntegrateCitations::new(generator, search.clone());

        let state = seeded(vec![
            FieldUpdate::Requirements(requirements(300)),
            FieldUpdate::Draft(DRAFT.into()),
        ]);
        let outcome = stage.execute(&state).await.unwrap();
        assert_eq!(outcome.signal, StageSignal::Ok);
        assert_eq!(outcome.state.draft(), woven);

        let sources = outcome.state.sources();
        assert_eq!(sources.iter().filter(|s| s.verified).count(), 2);
        assert_eq!(sources.len(), 3);
        let queries = search.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].min_year, MIN_SOURCE_YEAR);
        assert!(queries[0].require_abstract);
    }

    #[tokio::test]
    async fn no_sources_leaves_draft_unchanged() {
        let search = Arc::new(Pages {
            pages: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        });
        let generator = Arc::new(Scripted::new(vec![]));
        let stage = IntegrateCitations::new(generator, search);
        let state = seeded(vec![
            FieldUpdate::Requirements(requirements(300)),
            FieldUpdate::Draft(DRAFT.into()),
        ]);
        let outcome = stage.execute(&state).await.unwrap();
        assert_eq!(outcome.signal, StageSignal::Ok);
        assert_eq!(outcome.state.draft(), DRAFT);
        assert!(outcome.state.sources().is_empty());
    }

    #[tokio::test]
    async fn reapply_restores_dropped_verified_citations() {
        let source = candidate("Jane Smith", "One", true).into_source();
        let state = seeded(vec![
            FieldUpdate::Draft(DRAFT.into()),
            FieldUpdate::Sources(vec![source]),
        ]);
        let outcome = ReapplyCitations::new().execute(&state).await.unwrap();
        assert_eq!(outcome.signal, StageSignal::Ok);
        assert!(outcome.state.draft().contains("Trees lower heat (Smith, 2022)."));
    }

    #[tokio::test]
    async fn reapply_is_a_no_op_when_nothing_is_missing() {
        let source = candidate("Jane Smith", "One", true).into_source();
        let cited = DRAFT.replace("Trees lower heat.", "Trees lower heat (Smith, 2022).");
        let state = seeded(vec![
            FieldUpdate::Draft(cited.clone()),
            FieldUpdate::Sources(vec![source]),
        ]);
        let outcome = ReapplyCitations::new().execute(&state).await.unwrap();
        assert_eq!(outcome.state.draft(), cited);
    }
}
