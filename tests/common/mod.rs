//! Scripted collaborators for pipeline tests.
//!
//! The generator answers by prompt shape, so a stage that is re-run after a
//! resume gets the same answer it would have had the first time.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use draftline::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use draftline::errors::CollaboratorError;
use draftline::graph::{LoopBounds, StageGraph, standard_graph};
use draftline::orchestrator::{Orchestrator, OrchestratorSettings};
use draftline::services::{
    Collaborators, DocumentExtractor, Granularity, Humanizer, OriginalityDetector, SourceCandidate,
    SourceQuery, SourceSearch, TextGenerator,
};
use draftline::stage::standard_stages;
use draftline::state::OrderBrief;
use draftline::text::count_words;

const VOCABULARY: &[&str] = &[
    "shade", "trees", "cool", "streets", "in", "growing", "cities", "during", "long", "summers",
];
const WORDS_PER_SENTENCE: usize = 10;
const SENTENCES_PER_PARAGRAPH: usize = 5;

/// Rubric-clean prose of exactly `words` words in at least three paragraphs.
pub fn essay(words: usize) -> String {
    let tokens: Vec<String> = (0..words)
        .map(|i| VOCABULARY[i % VOCABULARY.len()].to_string())
        .collect();
    let sentences: Vec<String> = tokens
        .chunks(WORDS_PER_SENTENCE)
        .map(|chunk| {
            let mut s = chunk.join(" ");
            if let Some(first) = s.get(0..1) {
                s = first.to_uppercase() + &s[1..];
            }
            s + "."
        })
        .collect();
    let per_paragraph = SENTENCES_PER_PARAGRAPH.min(sentences.len().div_ceil(3).max(1));
    sentences
        .chunks(per_paragraph)
        .map(|chunk| chunk.join(" "))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Move a citation onto the first sentence of the first body paragraph.
pub fn with_opening_citation(text: &str, citation: &str) -> String {
    let mut paragraphs: Vec<String> = text.split("\n\n").map(str::to_string).collect();
    if let Some(body) = paragraphs.get_mut(1) {
        if let Some(end) = body.find(". ") {
            body.insert_str(end, &format!(" {}", citation));
        }
    }
    paragraphs.join("\n\n")
}

/// The text an instruction asks to rework.
pub fn payload(prompt: &str) -> &str {
    prompt.rsplit_once("TEXT:\n").map(|(_, t)| t).unwrap_or_default()
}

pub fn requirements_json(required_sources: usize) -> String {
    format!(
        r#"{{"is_sufficient": true, "assignment_type": "essay", "main_topic": "Urban heat",
            "main_question": "How do street trees cool cities?", "citation_style": "APA",
            "required_sources": {required_sources}, "search_keywords": ["urban heat", "street trees"]}}"#
    )
}

type Handler = Box<dyn Fn(&str) -> Result<String, CollaboratorError> + Send + Sync>;

/// Text generator that dispatches on the instruction's opening words.
pub struct FakeGenerator {
    handlers: Vec<(&'static str, Handler)>,
    calls: Mutex<Vec<&'static str>>,
}

pub const ANALYZE: &str = "Read the order below";
pub const WRITE: &str = "Write a ";
pub const CITE: &str = "Insert in-text citations";
pub const RESIZE: &str = "The text below has";
pub const REVISE: &str = "Revise the ";

impl FakeGenerator {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on<F>(mut self, prefix: &'static str, handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, CollaboratorError> + Send + Sync + 'static,
    {
        self.handlers.push((prefix, Box::new(handler)));
        self
    }

    /// Requirements plus a fixed first draft; resizing moves the draft
    /// `step` words toward `target` and revisions return the text unchanged.
    pub fn standard(draft: String, target: usize, step: usize) -> Self {
        Self::new()
            .on(ANALYZE, |_| Ok(requirements_json(2)))
            .on(WRITE, move |_| Ok(draft.clone()))
            .on(RESIZE, move |prompt| {
                let current = count_words(payload(prompt)) as usize;
                let next = if current < target {
                    (current + step).min(target)
                } else {
                    current.saturating_sub(step).max(target)
                };
                Ok(essay(next))
            })
            .on(REVISE, |prompt| Ok(payload(prompt).to_string()))
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| **c == prefix).count()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, instruction: &str) -> Result<String, CollaboratorError> {
        for (prefix, handler) in &self.handlers {
            if instruction.starts_with(prefix) {
                self.calls.lock().unwrap().push(prefix);
                return handler(instruction);
            }
        }
        Err(CollaboratorError::Unavailable(format!(
            "no scripted answer for: {}",
            instruction.lines().next().unwrap_or_default()
        )))
    }
}

/// Search that never finds anything.
pub struct NoSources;

#[async_trait]
impl SourceSearch for NoSources {
    async fn search(&self, _query: &SourceQuery) -> Result<Vec<SourceCandidate>, CollaboratorError> {
        Ok(Vec::new())
    }
}

/// Detector that replays scores, repeating the last one.
pub struct ScriptedDetector {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            last: Mutex::new(scores.last().copied().unwrap_or(0.0)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginalityDetector for ScriptedDetector {
    async fn score(&self, _text: &str) -> Result<f64, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.scores.lock().unwrap().pop_front();
        match next {
            Some(score) => {
                *self.last.lock().unwrap() = score;
                Ok(score)
            }
            None => Ok(*self.last.lock().unwrap()),
        }
    }
}

/// Humanizer that returns the text as given, or with one casual contraction
/// slipped into the first sentence.
#[derive(Default)]
pub struct EchoHumanizer {
    calls: AtomicUsize,
    contracting: bool,
}

impl EchoHumanizer {
    pub fn contracting() -> Self {
        Self {
            contracting: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub const CONTRACTION: &str = "don't ";

#[async_trait]
impl Humanizer for EchoHumanizer {
    async fn rewrite(&self, text: &str, _granularity: Granularity) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.contracting && !text.contains(CONTRACTION) {
            return Ok(text.replacen(" cool ", &format!(" {}cool ", CONTRACTION), 1));
        }
        Ok(text.to_string())
    }
}

pub struct NoAttachments;

#[async_trait]
impl DocumentExtractor for NoAttachments {
    async fn extract(&self, path: &Path) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable(format!(
            "unexpected attachment {}",
            path.display()
        )))
    }
}

/// Everything a scenario needs to drive and inspect one run.
pub struct Harness {
    pub generator: Arc<FakeGenerator>,
    pub detector: Arc<ScriptedDetector>,
    pub humanizer: Arc<EchoHumanizer>,
    pub store: Arc<MemoryCheckpointStore>,
    pub graph: Arc<StageGraph>,
}

impl Harness {
    pub fn new(generator: FakeGenerator, scores: &[f64]) -> Self {
        Self::with_bounds(generator, scores, LoopBounds::default())
    }

    pub fn with_bounds(generator: FakeGenerator, scores: &[f64], bounds: LoopBounds) -> Self {
        Self::with_humanizer(generator, scores, bounds, EchoHumanizer::default())
    }

    pub fn with_humanizer(
        generator: FakeGenerator,
        scores: &[f64],
        bounds: LoopBounds,
        humanizer: EchoHumanizer,
    ) -> Self {
        let generator = Arc::new(generator);
        let detector = Arc::new(ScriptedDetector::new(scores));
        let humanizer = Arc::new(humanizer);
        let services = Collaborators {
            generator: generator.clone(),
            search: Arc::new(NoSources),
            detector: detector.clone(),
            humanizer: humanizer.clone(),
            extractor: Arc::new(NoAttachments),
        };
        let graph = standard_graph(standard_stages(&services), bounds).unwrap();
        Self {
            generator,
            detector,
            humanizer,
            store: Arc::new(MemoryCheckpointStore::new()),
            graph: Arc::new(graph),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_on(self.store.clone())
    }

    pub fn orchestrator_on(&self, store: Arc<dyn CheckpointStore>) -> Orchestrator {
        Orchestrator::new(self.graph.clone(), store, settings())
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        stage_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        stage_timeout: Duration::from_secs(10),
    }
}

/// A five-page order: 1500 target words at 300 words per page.
pub fn brief() -> OrderBrief {
    OrderBrief {
        description: "Five pages on how street trees cool cities.".into(),
        pages: 5,
        deadline: None,
        target_words: None,
        attachments: vec![],
    }
}
