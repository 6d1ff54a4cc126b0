//! Throttle gates in front of shared external services.
//!
//! A gate combines a concurrency limit (semaphore permits) with a minimum
//! spacing between call starts. Waiting happens inside the stage call, so the
//! stage timeout bounds how long a caller can block on a gate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::{
    DocumentExtractor, Granularity, Humanizer, OriginalityDetector, SourceCandidate, SourceQuery,
    SourceSearch, TextGenerator,
};
use crate::errors::CollaboratorError;

#[derive(Debug)]
pub struct ServiceGate {
    name: String,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl ServiceGate {
    pub fn new(name: impl Into<String>, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// A gate that never makes callers wait beyond `max_concurrent`.
    pub fn unthrottled(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self::new(name, max_concurrent, Duration::ZERO)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait until a permit is free and the spacing window has passed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, CollaboratorError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CollaboratorError::Unavailable(format!("gate '{}' closed", self.name)))?;

        let start_at = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let start_at = (*next).max(now);
            *next = start_at + self.min_interval;
            start_at
        };
        if start_at > Instant::now() {
            tracing::debug!(gate = %self.name, wait_ms = (start_at - Instant::now()).as_millis() as u64, "Throttled");
            tokio::time::sleep_until(start_at).await;
        }
        Ok(permit)
    }
}

/// A collaborator whose calls pass through a [`ServiceGate`].
pub struct Throttled<T: ?Sized> {
    inner: Arc<T>,
    gate: Arc<ServiceGate>,
}

impl<T: ?Sized> Throttled<T> {
    pub fn new(inner: Arc<T>, gate: Arc<ServiceGate>) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &ServiceGate {
        &self.gate
    }
}

#[async_trait]
impl<T: TextGenerator + ?Sized> TextGenerator for Throttled<T> {
    async fn generate(&self, instruction: &str) -> Result<String, CollaboratorError> {
        let _permit = self.gate.acquire().await?;
        self.inner.generate(instruction).await
    }
}

#[async_trait]
impl<T: SourceSearch + ?Sized> SourceSearch for Throttled<T> {
    async fn search(&self, query: &SourceQuery) -> Result<Vec<SourceCandidate>, CollaboratorError> {
        let _permit = self.gate.acquire().await?;
        self.inner.search(query).await
    }
}

#[async_trait]
impl<T: OriginalityDetector + ?Sized> OriginalityDetector for Throttled<T> {
    async fn score(&self, text: &str) -> Result<f64, CollaboratorError> {
        let _permit = self.gate.acquire().await?;
        self.inner.score(text).await
    }
}

#[async_trait]
impl<T: Humanizer + ?Sized> Humanizer for Throttled<T> {
    async fn rewrite(&self, text: &str, granularity: Granularity) -> Result<String, CollaboratorError> {
        let _permit = self.gate.acquire().await?;
        self.inner.rewrite(text, granularity).await
    }
}

#[async_trait]
impl<T: DocumentExtractor + ?Sized> DocumentExtractor for Throttled<T> {
    async fn extract(&self, path: &Path) -> Result<String, CollaboratorError> {
        let _permit = self.gate.acquire().await?;
        self.inner.extract(path).await
    }
}
