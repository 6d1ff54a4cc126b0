//! Run registry: one orchestrator task per active order.
//!
//! The supervisor enforces at most one active run per order id, reports
//! final and degraded outcomes to the [`OrderStore`], and restarts runs left
//! active in the checkpoint store after a process restart.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::errors::{RunError, SupervisorError};
use crate::graph::StageGraph;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome, RunSnapshot};
use crate::services::{OrderRecord, OrderStore};
use crate::state::{
    ControlUpdate, ErrorRecord, OrderBrief, OrderId, RunStatus, StateContainer, Thresholds,
};

const SNAPSHOT_BUFFER: usize = 256;

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

enum Launch {
    Fresh(OrderBrief),
    Resume(Checkpoint),
}

#[derive(Clone)]
pub struct Supervisor {
    graph: Arc<StageGraph>,
    store: Arc<dyn CheckpointStore>,
    orders: Arc<dyn OrderStore>,
    settings: OrchestratorSettings,
    thresholds: Thresholds,
    runs: Arc<Mutex<HashMap<OrderId, RunHandle>>>,
    /// Failed runs whose failure could not be checkpointed.
    unrecorded: Arc<Mutex<HashMap<OrderId, RunSnapshot>>>,
    events: broadcast::Sender<RunSnapshot>,
}

impl Supervisor {
    pub fn new(
        graph: Arc<StageGraph>,
        store: Arc<dyn CheckpointStore>,
        orders: Arc<dyn OrderStore>,
        settings: OrchestratorSettings,
        thresholds: Thresholds,
    ) -> Self {
        let (events, _) = broadcast::channel(SNAPSHOT_BUFFER);
        Self {
            graph,
            store,
            orders,
            settings,
            thresholds,
            runs: Arc::new(Mutex::new(HashMap::new())),
            unrecorded: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Snapshot feed; one message per checkpoint of any run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunSnapshot> {
        self.events.subscribe()
    }

    /// Start a fresh run for an order.
    pub async fn start_run(&self, order_id: OrderId, brief: OrderBrief) -> Result<(), SupervisorError> {
        let mut runs = self.runs.lock().await;
        Self::ensure_idle(&mut runs, &order_id)?;

        if let Some(snapshot) = self.unrecorded.lock().await.get(&order_id) {
            return Err(SupervisorError::Finished {
                order_id,
                status: snapshot.status,
            });
        }
        if let Some(latest) = self.store.load(&order_id).await? {
            if latest.status() == RunStatus::Running {
                return Err(SupervisorError::AlreadyRunning(order_id));
            }
            return Err(SupervisorError::Finished {
                order_id,
                status: latest.status(),
            });
        }

        tracing::info!(order_id = %order_id, "Starting run");
        self.launch(&mut runs, order_id, Launch::Fresh(brief));
        Ok(())
    }

    /// Ask a run to stop at its next stage boundary.
    pub async fn cancel_run(&self, order_id: &OrderId) -> Result<(), SupervisorError> {
        let runs = self.runs.lock().await;
        let handle = runs
            .get(order_id)
            .ok_or_else(|| SupervisorError::NotFound(order_id.clone()))?;
        tracing::info!(order_id = %order_id, "Cancelling run");
        handle.cancel.cancel();
        Ok(())
    }

    /// Latest checkpointed view of an order's run.
    pub async fn run_status(&self, order_id: &OrderId) -> Result<RunSnapshot, SupervisorError> {
        if let Some(snapshot) = self.unrecorded.lock().await.get(order_id) {
            return Ok(snapshot.clone());
        }
        let latest = self
            .store
            .load(order_id)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(order_id.clone()))?;
        Ok(RunSnapshot::from(&latest))
    }

    pub async fn active_runs(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Restart every run whose latest checkpoint is still running.
    pub async fn resume_active(&self) -> Result<Vec<OrderId>, SupervisorError> {
        let mut resumed = Vec::new();
        for order_id in self.store.active_orders().await? {
            let mut runs = self.runs.lock().await;
            if runs.contains_key(&order_id) || self.unrecorded.lock().await.contains_key(&order_id) {
                continue;
            }
            let Some(checkpoint) = self.store.load(&order_id).await? else {
                continue;
            };
            tracing::info!(order_id = %order_id, seq = checkpoint.seq, "Resuming interrupted run");
            self.launch(&mut runs, order_id.clone(), Launch::Resume(checkpoint));
            resumed.push(order_id);
        }
        Ok(resumed)
    }

    /// Wait for a run to stop, then return its final snapshot.
    pub async fn wait(&self, order_id: &OrderId) -> Result<RunSnapshot, SupervisorError> {
        let done = self.runs.lock().await.get(order_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            done.wait_for(|finished| *finished)
                .await
                .map_err(|_| SupervisorError::TaskFailed {
                    order_id: order_id.clone(),
                    message: "run task ended without reporting".to_string(),
                })?;
        }
        self.run_status(order_id).await
    }

    /// Cancel every run and wait for the tasks to stop.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut runs = self.runs.lock().await;
            runs.drain()
                .map(|(_, handle)| {
                    handle.cancel.cancel();
                    handle.task
                })
                .collect()
        };
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Run task panicked during shutdown");
            }
        }
    }

    fn ensure_idle(
        runs: &mut HashMap<OrderId, RunHandle>,
        order_id: &OrderId,
    ) -> Result<(), SupervisorError> {
        if let Some(handle) = runs.get(order_id) {
            if !handle.task.is_finished() {
                return Err(SupervisorError::AlreadyRunning(order_id.clone()));
            }
            // The task died without cleaning up after itself.
            runs.remove(order_id);
        }
        Ok(())
    }

    fn launch(&self, runs: &mut HashMap<OrderId, RunHandle>, order_id: OrderId, launch: Launch) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let orchestrator = Orchestrator::new(self.graph.clone(), self.store.clone(), self.settings)
            .with_cancellation(cancel.clone())
            .with_events(self.events.clone());
        let this = self.clone();
        let id = order_id.clone();

        let task = tokio::spawn(async move {
            let (brief, result) = match launch {
                Launch::Fresh(brief) => {
                    this.report_started(&id, &brief).await;
                    let result = orchestrator
                        .start(id.clone(), brief.clone(), this.thresholds)
                        .await;
                    (brief, result)
                }
                Launch::Resume(checkpoint) => {
                    let brief = checkpoint.state.brief().clone();
                    (brief, orchestrator.resume(checkpoint).await)
                }
            };
            this.report(&id, brief, result).await;
            this.runs.lock().await.remove(&id);
            let _ = done_tx.send(true);
        });

        runs.insert(
            order_id,
            RunHandle {
                cancel,
                done: done_rx,
                task,
            },
        );
    }

    async fn report_started(&self, order_id: &OrderId, brief: &OrderBrief) {
        let state = StateContainer::new(order_id.clone(), brief.clone(), self.thresholds);
        self.upsert(OrderRecord::from_state(&state)).await;
    }

    async fn report(&self, order_id: &OrderId, brief: OrderBrief, result: Result<RunOutcome, RunError>) {
        let record = match result {
            Ok(outcome) => {
                match outcome.status() {
                    RunStatus::Completed if outcome.degraded().any() => {
                        tracing::warn!(order_id = %order_id, degraded = ?outcome.degraded(), "Run completed degraded");
                    }
                    RunStatus::Completed => tracing::info!(order_id = %order_id, "Run completed"),
                    RunStatus::Failed => {
                        tracing::error!(order_id = %order_id, error = ?outcome.state.error(), "Run failed");
                    }
                    status => tracing::info!(order_id = %order_id, %status, "Run stopped"),
                }
                OrderRecord::from_state(&outcome.state)
            }
            Err(err) => {
                tracing::error!(order_id = %order_id, error = %err, "Run aborted without a final checkpoint");
                let failed = self.record_failure(order_id, brief, &err).await;
                OrderRecord::from_state(&failed)
            }
        };
        self.upsert(record).await;
    }

    /// Mark a run that stopped on an error as failed.
    ///
    /// The failure is appended after the latest checkpoint. When the store
    /// refuses that write too, the failed state is kept in memory so status
    /// queries and restarts still see a stopped run.
    async fn record_failure(&self, order_id: &OrderId, brief: OrderBrief, err: &RunError) -> StateContainer {
        let latest = match self.store.load(order_id).await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::error!(order_id = %order_id, error = %e, "Failed to load latest checkpoint");
                None
            }
        };
        let (seq, base) = match latest {
            Some(checkpoint) => (checkpoint.seq + 1, checkpoint.state),
            None => (0, StateContainer::new(order_id.clone(), brief, self.thresholds)),
        };
        let stage = base.current_stage().cloned();
        let failed = base.transition(ControlUpdate::Failed(ErrorRecord {
            kind: err.kind().to_string(),
            message: err.to_string(),
            stage: stage.clone(),
        }));

        match self.store.save(order_id, seq, stage.as_ref(), &failed).await {
            Ok(()) => {
                let _ = self.events.send(RunSnapshot::of(seq, &failed));
            }
            Err(e) => {
                tracing::error!(order_id = %order_id, seq, error = %e, "Failure could not be checkpointed");
                let snapshot = RunSnapshot::of(seq, &failed);
                let _ = self.events.send(snapshot.clone());
                self.unrecorded.lock().await.insert(order_id.clone(), snapshot);
            }
        }
        failed
    }

    async fn upsert(&self, record: OrderRecord) {
        let order_id = record.order_id.clone();
        if let Err(e) = self.orders.upsert(record).await {
            tracing::error!(order_id = %order_id, error = %e, "Failed to update order store");
        }
    }
}
