//! Drives one order through the stage graph.
//!
//! Per stage: check cancellation, execute under a timeout, retry retryable
//! failures with exponential backoff (cancellation cuts a backoff short),
//! checkpoint, then route. The orchestrator owns the state container
//! exclusively; observers only see [`RunSnapshot`]s published after each
//! checkpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::{CollaboratorError, RunError};
use crate::graph::StageGraph;
use crate::stage::{Stage, StageSignal};
use crate::state::{
    ControlUpdate, DegradedFlags, ErrorRecord, OrderBrief, OrderId, RunStatus, StageName,
    StateContainer, Thresholds,
};

/// Retry and timeout policy for stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Total attempts per stage, including the first.
    pub stage_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    pub stage_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stage_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(300),
        }
    }
}

impl OrchestratorSettings {
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Read-only view of a run published after every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub order_id: OrderId,
    pub seq: u64,
    /// Last completed stage.
    pub stage: Option<StageName>,
    pub status: RunStatus,
    pub degraded: DegradedFlags,
    pub terminal: bool,
    pub version: u64,
    pub at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn of(seq: u64, state: &StateContainer) -> Self {
        Self {
            order_id: state.order_id().clone(),
            seq,
            stage: state.current_stage().cloned(),
            status: state.status(),
            degraded: state.degraded(),
            terminal: state.is_terminal(),
            version: state.version(),
            at: Utc::now(),
        }
    }
}

impl From<&Checkpoint> for RunSnapshot {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            at: checkpoint.created_at,
            ..Self::of(checkpoint.seq, &checkpoint.state)
        }
    }
}

/// Final state of a run that stopped with its state recorded.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: StateContainer,
    pub last_seq: u64,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn degraded(&self) -> DegradedFlags {
        self.state.degraded()
    }
}

pub struct Orchestrator {
    graph: Arc<StageGraph>,
    store: Arc<dyn CheckpointStore>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
    events: Option<broadcast::Sender<RunSnapshot>>,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<StageGraph>,
        store: Arc<dyn CheckpointStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            graph,
            store,
            settings,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<RunSnapshot>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run a new order from the entry stage.
    ///
    /// Stage failures are recorded in the returned state; `Err` means the
    /// run could not be persisted at all.
    pub async fn start(
        &self,
        order_id: OrderId,
        brief: OrderBrief,
        thresholds: Thresholds,
    ) -> Result<RunOutcome, RunError> {
        let span = tracing::info_span!("run", order_id = %order_id);
        async move {
            let state = StateContainer::new(order_id, brief, thresholds);
            self.checkpoint(0, None, &state).await?;
            tracing::info!("Run started");
            self.drive(state, 0, self.graph.entry().clone()).await
        }
        .instrument(span)
        .await
    }

    /// Continue from a checkpoint without re-running its stage.
    pub async fn resume(&self, checkpoint: Checkpoint) -> Result<RunOutcome, RunError> {
        let span = tracing::info_span!("run", order_id = %checkpoint.order_id);
        async move {
            let Checkpoint { seq, state, .. } = checkpoint;
            if state.status().is_finished() {
                tracing::info!(status = %state.status(), "Run already finished, nothing to resume");
                return Ok(RunOutcome {
                    state,
                    last_seq: seq,
                });
            }

            let next = match state.current_stage().cloned() {
                None => self.graph.entry().clone(),
                Some(done) if self.graph.is_terminal(&done) => {
                    let state = state.transition(ControlUpdate::Finished);
                    self.checkpoint(seq + 1, Some(&done), &state).await?;
                    return Ok(RunOutcome {
                        state,
                        last_seq: seq + 1,
                    });
                }
                Some(done) => match self.graph.next_step(&done, &state) {
                    Ok(step) => {
                        tracing::info!(after = %done, next = %step.next, seq, "Resuming run");
                        let state = step
                            .updates
                            .into_iter()
                            .fold(state, |s, u| s.transition(u));
                        return self.drive(state, seq, step.next).await;
                    }
                    Err(err) => return self.fail(state, seq, Some(done), err.into()).await,
                },
            };
            tracing::info!(next = %next, seq, "Resuming run");
            self.drive(state, seq, next).await
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        mut state: StateContainer,
        mut seq: u64,
        mut current: StageName,
    ) -> Result<RunOutcome, RunError> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(before = %current, "Run cancelled");
                return self.cancelled(state, seq).await;
            }

            let Some(stage) = self.graph.stage(&current).cloned() else {
                return self
                    .fail(state, seq, Some(current.clone()), RunError::UnknownStage(current))
                    .await;
            };

            state = match self.execute_with_retries(stage.as_ref(), &state).await {
                Ok(Some(next)) => next,
                Ok(None) => {
                    tracing::info!(during = %current, "Run cancelled while waiting to retry");
                    return self.cancelled(state, seq).await;
                }
                Err(err) => return self.fail(state, seq, Some(current), err).await,
            };

            state = state.transition(ControlUpdate::StageCompleted(current.clone()));
            let finished = self.graph.is_terminal(&current);
            if finished {
                state = state.transition(ControlUpdate::Finished);
            }

            seq += 1;
            self.checkpoint(seq, Some(&current), &state).await?;

            if finished {
                tracing::info!(
                    seq,
                    degraded = state.degraded().any(),
                    words = ?state.word_count(),
                    "Run completed"
                );
                return Ok(RunOutcome {
                    state,
                    last_seq: seq,
                });
            }

            let step = match self.graph.next_step(&current, &state) {
                Ok(step) => step,
                Err(err) => return self.fail(state, seq, Some(current), err.into()).await,
            };
            tracing::debug!(from = %current, to = %step.next, "Routed");
            for update in step.updates {
                state = state.transition(update);
            }
            current = step.next;
        }
    }

    /// `Ok(None)` when cancellation arrived during a retry backoff.
    async fn execute_with_retries(
        &self,
        stage: &dyn Stage,
        state: &StateContainer,
    ) -> Result<Option<StateContainer>, RunError> {
        let name = stage.definition().name().clone();
        let attempts = self.settings.stage_attempts.max(1);
        let span = tracing::info_span!("stage", stage = %name);

        async move {
            for attempt in 1..=attempts {
                let started = Instant::now();
                let err =
                    match tokio::time::timeout(self.settings.stage_timeout, stage.execute(state)).await {
                        Err(_) => CollaboratorError::Timeout,
                        Ok(Err(validation)) => return Err(RunError::Validation(validation)),
                        Ok(Ok(outcome)) => match outcome.signal {
                            StageSignal::Ok => {
                                tracing::debug!(
                                    attempt,
                                    elapsed_ms = started.elapsed().as_millis() as u64,
                                    "Stage completed"
                                );
                                return Ok(Some(outcome.state));
                            }
                            StageSignal::Fatal(reason) => {
                                return Err(RunError::StageFailed {
                                    stage: name.clone(),
                                    reason,
                                });
                            }
                            StageSignal::Retryable(err) => err,
                        },
                    };

                if attempt == attempts {
                    return Err(RunError::RetriesExhausted {
                        stage: name.clone(),
                        attempts,
                        reason: err.to_string(),
                    });
                }
                let delay = self
                    .settings
                    .backoff(attempt)
                    .max(err.retry_after().unwrap_or_default());
                tracing::warn!(
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Stage failed, retrying"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(RunError::RetriesExhausted {
                stage: name.clone(),
                attempts,
                reason: "no attempt made".to_string(),
            })
        }
        .instrument(span)
        .await
    }

    async fn cancelled(&self, state: StateContainer, seq: u64) -> Result<RunOutcome, RunError> {
        let state = state.transition(ControlUpdate::Cancelled);
        let stage = state.current_stage().cloned();
        self.checkpoint(seq + 1, stage.as_ref(), &state).await?;
        Ok(RunOutcome {
            state,
            last_seq: seq + 1,
        })
    }

    /// Record a fatal failure and checkpoint it.
    async fn fail(
        &self,
        state: StateContainer,
        seq: u64,
        stage: Option<StageName>,
        err: RunError,
    ) -> Result<RunOutcome, RunError> {
        if err.is_configuration_bug() {
            tracing::error!(error = %err, "Configuration bug, aborting run");
        } else {
            tracing::error!(error = %err, "Run failed");
        }
        let state = state.transition(ControlUpdate::Failed(ErrorRecord {
            kind: err.kind().to_string(),
            message: err.to_string(),
            stage,
        }));
        let checkpoint_stage = state.current_stage().cloned();
        self.checkpoint(seq + 1, checkpoint_stage.as_ref(), &state).await?;
        Ok(RunOutcome {
            state,
            last_seq: seq + 1,
        })
    }

    async fn checkpoint(
        &self,
        seq: u64,
        stage: Option<&StageName>,
        state: &StateContainer,
    ) -> Result<(), RunError> {
        self.store
            .save(state.order_id(), seq, stage, state)
            .await
            .inspect_err(|e| tracing::error!(seq, error = %e, "Checkpoint failed"))?;
        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(RunSnapshot::of(seq, state));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::graph::{GraphBuilder, Guard};
    use crate::services::{ServiceGate, TextGenerator, Throttled};
    use crate::stage::{StageDefinition, StageFailure, StageKind};
    use crate::state::{Field, FieldUpdate};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the scripted results, then succeeds.
    struct Flaky {
        def: StageDefinition,
        failures: Mutex<Vec<StageFailure>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(name: &str, failures: Vec<StageFailure>) -> Arc<Self> {
            Arc::new(Self {
                def: StageDefinition::new(name, StageKind::Generative).outputs([Field::Draft]),
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Stage for Flaky {
        fn definition(&self) -> &StageDefinition {
            &self.def
        }

        async fn run(&self, _state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(vec![FieldUpdate::Draft(format!("draft {}", n))])
            } else {
                Err(failures.remove(0))
            }
        }
    }

    struct Done(StageDefinition);

    #[async_trait]
    impl Stage for Done {
        fn definition(&self) -> &StageDefinition {
            &self.0
        }

        async fn run(&self, _state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
            Ok(Vec::new())
        }
    }

    fn orchestrator(
        work: Arc<dyn Stage>,
        store: Arc<MemoryCheckpointStore>,
    ) -> Orchestrator {
        let graph = GraphBuilder::new("work", "done")
            .stage(work)
            .stage(Arc::new(Done(StageDefinition::new("done", StageKind::Deterministic))))
            .route("work", Guard::Always, "done")
            .build()
            .unwrap();
        Orchestrator::new(
            Arc::new(graph),
            store,
            OrchestratorSettings {
                stage_attempts: 3,
                retry_backoff: Duration::from_millis(10),
                stage_timeout: Duration::from_secs(5),
            },
        )
    }

    fn brief() -> OrderBrief {
        OrderBrief {
            description: "d".into(),
            pages: 1,
            deadline: None,
            target_words: None,
            attachments: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_in_place() {
        let work = Flaky::new(
            "work",
            vec![StageFailure::malformed("a"), StageFailure::malformed("b")],
        );
        let store = Arc::new(MemoryCheckpointStore::new());
        let outcome = orchestrator(work.clone(), store.clone())
            .start(OrderId::from("O-1"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Completed);
        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.state.draft(), "draft 2");
        // seq 0 initial, 1 after work, 2 after done
        assert_eq!(outcome.last_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_run_and_checkpoint_it() {
        let work = Flaky::new(
            "work",
            vec![
                StageFailure::malformed("a"),
                StageFailure::malformed("b"),
                StageFailure::malformed("c"),
            ],
        );
        let store = Arc::new(MemoryCheckpointStore::new());
        let outcome = orchestrator(work.clone(), store.clone())
            .start(OrderId::from("O-2"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(outcome.state.error().unwrap().kind, "retries_exhausted");
        let latest = store.load(&OrderId::from("O-2")).await.unwrap().unwrap();
        assert_eq!(latest.status(), RunStatus::Failed);
        assert!(latest.state.is_terminal());
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let work = Flaky::new("work", vec![StageFailure::fatal("insufficient")]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let outcome = orchestrator(work.clone(), store)
            .start(OrderId::from("O-3"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
        let error = outcome.state.error().unwrap();
        assert_eq!(error.kind, "fatal_failure");
        assert_eq!(error.stage, Some(StageName::from("work")));
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let work = Flaky::new("work", vec![]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let outcome = orchestrator(work.clone(), store.clone())
            .with_cancellation(token)
            .start(OrderId::from("O-4"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Cancelled);
        assert_eq!(work.calls.load(Ordering::SeqCst), 0);
        let history = store.history(&OrderId::from("O-4")).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn snapshots_follow_checkpoints() {
        let (tx, mut rx) = broadcast::channel(16);
        let work = Flaky::new("work", vec![]);
        let store = Arc::new(MemoryCheckpointStore::new());
        orchestrator(work, store)
            .with_events(tx)
            .start(OrderId::from("O-5"), brief(), Thresholds::default())
            .await
            .unwrap();
        let mut seqs = Vec::new();
        while let Ok(snapshot) = rx.try_recv() {
            seqs.push(snapshot.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    /// Writes the draft from one generator call.
    struct Generating {
        def: StageDefinition,
        generator: Arc<dyn TextGenerator>,
    }

    impl Generating {
        fn new(generator: Arc<dyn TextGenerator>) -> Arc<Self> {
            Arc::new(Self {
                def: StageDefinition::new("work", StageKind::Generative).outputs([Field::Draft]),
                generator,
            })
        }
    }

    #[async_trait]
    impl Stage for Generating {
        fn definition(&self) -> &StageDefinition {
            &self.def
        }

        async fn run(&self, _state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
            Ok(vec![FieldUpdate::Draft(self.generator.generate("write").await?)])
        }
    }

    /// Never answers within any reasonable timeout.
    #[derive(Default)]
    struct Stalled {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextGenerator for Stalled {
        async fn generate(&self, _instruction: &str) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    #[derive(Default)]
    struct Prompt {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextGenerator for Prompt {
        async fn generate(&self, _instruction: &str) -> Result<String, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("on time".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_are_retried_then_exhausted() {
        let generator = Arc::new(Stalled::default());
        let store = Arc::new(MemoryCheckpointStore::new());
        let started = tokio::time::Instant::now();
        let outcome = orchestrator(Generating::new(generator.clone()), store)
            .start(OrderId::from("O-6"), brief(), Thresholds::default())
            .await
            .unwrap();

        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        let error = outcome.state.error().unwrap();
        assert_eq!(error.kind, "retries_exhausted");
        assert!(error.message.contains("timed out"), "{}", error.message);
        // Three 5s timeouts plus 10ms and 20ms of backoff, never the hour.
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_on_a_busy_gate_counts_against_the_timeout() {
        let gate = Arc::new(ServiceGate::new("llm", 1, Duration::ZERO));
        let held = gate.acquire().await.unwrap();
        let inner = Arc::new(Prompt::default());
        let generator = Arc::new(Throttled::new(inner.clone(), gate.clone()));
        let store = Arc::new(MemoryCheckpointStore::new());

        let outcome = orchestrator(Generating::new(generator), store)
            .start(OrderId::from("O-7"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert!(outcome.state.error().unwrap().message.contains("timed out"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_gate_freed_between_attempts_lets_the_retry_through() {
        let gate = Arc::new(ServiceGate::new("llm", 1, Duration::ZERO));
        let held = gate.acquire().await.unwrap();
        tokio::spawn(async move {
            // Freed during the second attempt.
            tokio::time::sleep(Duration::from_secs(7)).await;
            drop(held);
        });
        let inner = Arc::new(Prompt::default());
        let generator = Arc::new(Throttled::new(inner.clone(), gate));
        let store = Arc::new(MemoryCheckpointStore::new());

        let outcome = orchestrator(Generating::new(generator), store)
            .start(OrderId::from("O-8"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Completed);
        assert_eq!(outcome.state.draft(), "on time");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    /// Fails retryably and cancels the run from inside its first attempt.
    struct Interrupting {
        def: StageDefinition,
        token: CancellationToken,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Stage for Interrupting {
        fn definition(&self) -> &StageDefinition {
            &self.def
        }

        async fn run(&self, _state: &StateContainer) -> Result<Vec<FieldUpdate>, StageFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
            Err(StageFailure::malformed("garbled"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_skips_the_retry() {
        let token = CancellationToken::new();
        let work = Arc::new(Interrupting {
            def: StageDefinition::new("work", StageKind::Generative).outputs([Field::Draft]),
            token: token.clone(),
            calls: AtomicU32::new(0),
        });
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut runner = orchestrator(work.clone(), store.clone()).with_cancellation(token);
        runner.settings.retry_backoff = Duration::from_secs(3600);
        let started = tokio::time::Instant::now();

        let outcome = runner
            .start(OrderId::from("O-9"), brief(), Thresholds::default())
            .await
            .unwrap();
        assert_eq!(outcome.status(), RunStatus::Cancelled);
        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        let latest = store.load(&OrderId::from("O-9")).await.unwrap().unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.status(), RunStatus::Cancelled);
        assert!(latest.state.draft().is_empty());
    }

    #[test]
    fn backoff_doubles() {
        let settings = OrchestratorSettings {
            retry_backoff: Duration::from_millis(100),
            ..OrchestratorSettings::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(3), Duration::from_millis(400));
    }
}
