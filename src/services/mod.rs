//! External collaborators consumed by stages and the supervisor.
//!
//! | Trait | Used by | Shipped adapters |
//! |-------|---------|------------------|
//! | [`TextGenerator`] | generative stages | [`ChatCompletionsClient`] |
//! | [`SourceSearch`] | `integrate_citations` | [`SemanticScholarClient`] |
//! | [`OriginalityDetector`] | `check_originality` | [`ZeroGptDetector`] |
//! | [`Humanizer`] | `humanize` | [`LlmHumanizer`] |
//! | [`DocumentExtractor`] | `analyze_requirements` | [`PlainTextExtractor`] |
//! | [`OrderStore`] | supervisor | [`MemoryOrderStore`], [`SqliteOrderStore`] |
//!
//! Every shared service is wrapped in a [`Throttled`] gate before stages see it.

mod extract;
mod humanizer;
mod openai;
mod orders;
mod semantic_scholar;
mod throttle;
mod zerogpt;

pub use extract::PlainTextExtractor;
pub use humanizer::LlmHumanizer;
pub use openai::ChatCompletionsClient;
pub use orders::{MemoryOrderStore, OrderRecord, SqliteOrderStore};
pub use semantic_scholar::SemanticScholarClient;
pub use throttle::{ServiceGate, Throttled};
pub use zerogpt::ZeroGptDetector;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CollaboratorError;
use crate::state::{OrderId, Source};

/// Produces text from a synthesized instruction.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, instruction: &str) -> Result<String, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub keywords: Vec<String>,
    pub min_year: i32,
    pub require_abstract: bool,
    pub limit: usize,
    pub offset: usize,
}

/// A search hit before verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub url: Option<String>,
    pub abstract_text: Option<String>,
}

impl SourceCandidate {
    /// Shortest abstract accepted as evidence that the source is real and usable.
    pub const MIN_ABSTRACT_CHARS: usize = 50;

    pub fn has_usable_abstract(&self) -> bool {
        self.abstract_text
            .as_deref()
            .is_some_and(|a| a.trim().chars().count() > Self::MIN_ABSTRACT_CHARS)
    }

    pub fn into_source(self) -> Source {
        let verified = self.has_usable_abstract() && !self.authors.is_empty();
        Source {
            title: self.title,
            authors: self.authors,
            year: self.year,
            url: self.url,
            abstract_text: self.abstract_text,
            verified,
        }
    }
}

/// Finds candidate sources. An empty page means the result set is exhausted.
#[async_trait]
pub trait SourceSearch: Send + Sync {
    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceCandidate>, CollaboratorError>;
}

/// Scores how likely a text is machine-written, as a percentage in [0, 100].
#[async_trait]
pub trait OriginalityDetector: Send + Sync {
    async fn score(&self, text: &str) -> Result<f64, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Rewrite the whole text.
    Full,
    /// Rework sentence by sentence, keeping structure.
    Sentence,
}

impl Granularity {
    /// Scores above this get a full rewrite.
    pub const FULL_REWRITE_ABOVE: f64 = 70.0;

    pub fn for_score(score: f64) -> Self {
        if score > Self::FULL_REWRITE_ABOVE {
            Self::Full
        } else {
            Self::Sentence
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Sentence => "sentence",
        }
    }
}

#[async_trait]
pub trait Humanizer: Send + Sync {
    async fn rewrite(&self, text: &str, granularity: Granularity) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, CollaboratorError>;
}

/// Order metadata the supervisor reports into.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn upsert(&self, record: OrderRecord) -> anyhow::Result<()>;
    async fn get(&self, order_id: &OrderId) -> anyhow::Result<Option<OrderRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<OrderRecord>>;
    async fn delete(&self, order_id: &OrderId) -> anyhow::Result<bool>;
}

/// The collaborators stages are built from.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn SourceSearch>,
    pub detector: Arc<dyn OriginalityDetector>,
    pub humanizer: Arc<dyn Humanizer>,
    pub extractor: Arc<dyn DocumentExtractor>,
}

/// Map a reqwest failure onto the collaborator taxonomy.
pub(crate) fn classify_http_error(err: &reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Timeout
    } else if err.is_decode() {
        CollaboratorError::Malformed(err.to_string())
    } else {
        CollaboratorError::Unavailable(err.to_string())
    }
}

/// Map a non-success HTTP status onto the collaborator taxonomy.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    retry_after: Option<&reqwest::header::HeaderValue>,
    body: &str,
) -> CollaboratorError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = retry_after
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return CollaboratorError::RateLimited { retry_after };
    }
    if status == reqwest::StatusCode::REQUEST_TIMEOUT || status == reqwest::StatusCode::GATEWAY_TIMEOUT {
        return CollaboratorError::Timeout;
    }
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error() {
        // Transient on most providers; let the stage retry.
        CollaboratorError::Malformed(format!("HTTP {}: {}", status, snippet))
    } else {
        CollaboratorError::Unavailable(format!("HTTP {}: {}", status, snippet))
    }
}
