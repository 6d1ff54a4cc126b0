use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Stage, StageDefinition, StageFailure, StageKind, names, prompts};
use crate::errors::CollaboratorError;
use crate::services::{DocumentExtractor, TextGenerator};
use crate::state::{CitationStyle, Field, FieldUpdate, Requirements, StateContainer};
use crate::text::strip_code_fence;

const DEFAULT_REQUIRED_SOURCES: usize = 3;

/// Turns the order brief into structured requirements.
pub struct AnalyzeRequirements {
    def: StageDefinition,
    generator: Arc<dyn TextGenerator>,
    extractor: Arc<dyn DocumentExtractor>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Keywords {
    List(Vec<String>),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawRequirements {
    #[serde(default = "default_true")]
    is_sufficient: bool,
    #[serde(default)]
    missing_info: Option<String>,
    #[serde(default)]
    pages_detected: Option<u32>,
    #[serde(default)]
    assignment_type: Option<String>,
    #[serde(default, alias = "topic")]
    main_topic: Option<String>,
    #[serde(default)]
    main_question: Option<String>,
    #[serde(default)]
    citation_style: Option<String>,
    #[serde(default)]
    required_sources: Option<usize>,
    #[serde(default, alias = "keywords")]
    search_keywords: Option<Keywords>,
}

fn default_true() -> bool {
    true
}

impl AnalyzeRequirements {
    pub fn new(generator: Arc<dyn TextGenerator>, extractor: Arc<dyn DocumentExtractor>) -> Self {
        Self {
            def: StageDefinition::new(names::ANALYZE_REQUIREMENTS, StageKind::Generative)
                .inputs([Field::Brief])
                .outputs([Field::Requirements]),
            generator,
            extractor,
        }
    }

    async fn attachment_text(&self, state: &StateContainer) -> Result<String, StageFailure> {
        let mut parts = Vec::new();
        for path in &state.brief().attachments {
            match self.extractor.extract(path).await {
                Ok(text) if !text.is_empty() => {
                    parts.push(format!("--- {} ---\n{}", path.display(), text));
                }
                Ok(_) => {}
                Err(CollaboratorError::Unavailable(reason)) => {
                    tracing::warn!(path = %path.display(), %reason, "Skipping attachment");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(if parts.is_empty() {
            "No files attached".to_string()
        } else {
            parts.join("\n\n")
        })
    }
}

/// Parse the generator's JSON and derive the final requirements.
fn parse_requirements(raw_text: &str, state: &StateContainer) -> Result<Requirements, StageFailure> {
    let raw: RawRequirements = serde_json::from_str(strip_code_fence(raw_text))
        .map_err(|e| StageFailure::malformed(format!("requirements JSON: {}", e)))?;

    if !raw.is_sufficient {
        return Err(StageFailure::fatal(format!(
            "insufficient order information: {}",
            raw.missing_info.as_deref().unwrap_or("unspecified")
        )));
    }

    let topic = raw
        .main_topic
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| StageFailure::malformed("requirements JSON has no topic"))?;

    let brief = state.brief();
    let pages = if brief.pages > 0 {
        brief.pages
    } else {
        raw.pages_detected.unwrap_or(1).max(1)
    };
    let target_words = match brief.target_words {
        Some(words) => words,
        None => {
            let per_page = state.thresholds().words_per_page;
            pages.checked_mul(per_page).ok_or_else(|| {
                let detail = format!("{} pages at {} words per page is not a usable target", pages, per_page);
                // A detected page count came from the model and may differ on retry.
                if brief.pages > 0 {
                    StageFailure::fatal(detail)
                } else {
                    StageFailure::malformed(detail)
                }
            })?
        }
    };

    let keywords = match raw.search_keywords {
        Some(Keywords::List(list)) => list,
        Some(Keywords::Text(text)) => text
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
        None => Vec::new(),
    };
    let keywords = if keywords.is_empty() {
        vec![topic.clone()]
    } else {
        keywords
    };

    let citation_style = raw
        .citation_style
        .as_deref()
        .and_then(|s| s.parse::<CitationStyle>().ok())
        .unwrap_or(CitationStyle::Apa);

    Ok(Requirements {
        main_question: raw.main_question.unwrap_or_else(|| topic.clone()),
        topic,
        assignment_type: raw.assignment_type.unwrap_or_else(|| "essay".to_string()),
        target_words,
        citation_style,
        keywords,
        required_sources: raw.required_sources.unwrap_or(DEFAULT_REQUIRED_SOURCES),
        pages,
    })
}

#[async_trait]
impl Stage for AnalyzeRequirements {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn run(&self, state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
        let files = self.attachment_text(state).await?;
        let instruction = prompts::analyze_requirements(&state.brief().description, &files);
        let response = self.generator.generate(&instruction).await?;
        let requirements = parse_requirements(&response, state)?;
        tracing::info!(
            topic = %requirements.topic,
            target_words = requirements.target_words,
            sources = requirements.required_sources,
            "Requirements extracted"
        );
        Ok(vec![FieldUpdate::Requirements(requirements)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OrderBrief, OrderId, Thresholds};

    fn state(pages: u32, target_words: Option<u32>) -> StateContainer {
        StateContainer::new(
            OrderId::from("R-1"),
            OrderBrief {
                description: "Essay on heat".into(),
                pages,
                deadline: None,
                target_words,
                attachments: vec![],
            },
            Thresholds::default(),
        )
    }

    #[test]
    fn fenced_json_is_accepted_and_pages_drive_target() {
        let raw = "```json\n{\"main_topic\": \"Urban heat\", \"search_keywords\": \"heat islands, canopy\", \"citation_style\": \"apa\", \"required_sources\": 4}\n```";
        let req = parse_requirements(raw, &state(5, None)).unwrap();
        assert_eq!(req.target_words, 1500);
        assert_eq!(req.keywords, vec!["heat islands", "canopy"]);
        assert_eq!(req.required_sources, 4);
        assert_eq!(req.citation_style, CitationStyle::Apa);
    }

    #[test]
    fn explicit_word_target_wins() {
        let raw = r#"{"main_topic": "Urban heat", "search_keywords": ["heat"]}"#;
        let req = parse_requirements(raw, &state(5, Some(1200))).unwrap();
        assert_eq!(req.target_words, 1200);
    }

    #[test]
    fn detected_pages_used_when_brief_has_none() {
        let raw = r#"{"main_topic": "Urban heat", "pages_detected": 3}"#;
        let req = parse_requirements(raw, &state(0, None)).unwrap();
        assert_eq!(req.pages, 3);
        assert_eq!(req.target_words, 900);
        assert_eq!(req.keywords, vec!["Urban heat"]);
    }

    #[test]
    fn oversized_page_counts_fail_instead_of_wrapping() {
        let raw = r#"{"main_topic": "Urban heat"}"#;
        match parse_requirements(raw, &state(u32::MAX, None)) {
            Err(StageFailure::Fatal(reason)) => assert!(reason.contains("4294967295 pages")),
            other => panic!("Expected Fatal, got {:?}", other),
        }

        let detected = r#"{"main_topic": "Urban heat", "pages_detected": 4000000000}"#;
        assert!(matches!(
            parse_requirements(detected, &state(0, None)),
            Err(StageFailure::Retryable(_))
        ));

        // An explicit word target never needs the multiplication.
        let req = parse_requirements(raw, &state(u32::MAX, Some(2000))).unwrap();
        assert_eq!(req.target_words, 2000);
    }

    #[test]
    fn insufficient_info_is_fatal() {
        let raw = r#"{"is_sufficient": false, "missing_info": "no topic"}"#;
        match parse_requirements(raw, &state(2, None)) {
            Err(StageFailure::Fatal(reason)) => assert!(reason.contains("no topic")),
            other => panic!("Expected Fatal, got {:?}", other),
        }
    }

    #[test]
    fn unparseable_json_is_retryable() {
        assert!(matches!(
            parse_requirements("Sure! Here are the requirements.", &state(2, None)),
            Err(StageFailure::Retryable(_))
        ));
    }
}
