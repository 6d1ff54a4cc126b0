use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{SourceCandidate, SourceQuery, SourceSearch, classify_http_error, classify_status};
use crate::errors::CollaboratorError;

const DEFAULT_BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str = "title,authors,year,abstract,url";
const MAX_PAGE: usize = 100;

/// Paper search against the Semantic Scholar Graph API.
pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
struct Paper {
    title: Option<String>,
    year: Option<i32>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    url: Option<String>,
    #[serde(default)]
    authors: Vec<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    name: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("draftline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait]
impl SourceSearch for SemanticScholarClient {
    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceCandidate>, CollaboratorError> {
        let limit = query.limit.clamp(1, MAX_PAGE).to_string();
        let offset = query.offset.to_string();
        let years = format!("{}-", query.min_year);
        let text = query.keywords.join(" ");

        let mut request = self
            .client
            .get(format!("{}/paper/search", self.base_url))
            .query(&[
                ("query", text.as_str()),
                ("fields", FIELDS),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
                ("year", years.as_str()),
            ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let resp = request.send().await.map_err(|e| classify_http_error(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp.headers().get(reqwest::header::RETRY_AFTER).cloned();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after.as_ref(), &body));
        }

        let parsed: SearchResponse = resp.json().await.map_err(|e| classify_http_error(&e))?;
        Ok(into_candidates(parsed, query))
    }
}

fn into_candidates(response: SearchResponse, query: &SourceQuery) -> Vec<SourceCandidate> {
    response
        .data
        .into_iter()
        .filter_map(|paper| {
            let title = paper.title.filter(|t| !t.trim().is_empty())?;
            let year = paper.year?;
            if year < query.min_year {
                return None;
            }
            let candidate = SourceCandidate {
                title,
                authors: paper.authors.into_iter().filter_map(|a| a.name).collect(),
                year: Some(year),
                url: paper.url,
                abstract_text: paper.abstract_text,
            };
            if query.require_abstract && !candidate.has_usable_abstract() {
                return None;
            }
            Some(candidate)
        })
        .collect()
}
