//! Append-only, per-order checkpoint persistence.
//!
//! A checkpoint is written after every stage execution and before routing.
//! Sequence numbers are strictly increasing per order; a save at or below the
//! latest stored sequence is rejected with [`CheckpointError::OutOfOrder`] and
//! leaves the stored history untouched.

mod memory;
mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CheckpointError;
use crate::state::{OrderId, RunStatus, StageName, StateContainer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub order_id: OrderId,
    pub seq: u64,
    /// Stage that had just completed; `None` for the initial snapshot.
    pub stage: Option<StageName>,
    pub state: StateContainer,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn status(&self) -> RunStatus {
        self.state.status()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Returns only once the write is durable.
    async fn save(
        &self,
        order_id: &OrderId,
        seq: u64,
        stage: Option<&StageName>,
        state: &StateContainer,
    ) -> Result<(), CheckpointError>;

    /// Latest checkpoint for the order.
    async fn load(&self, order_id: &OrderId) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn load_at(&self, order_id: &OrderId, seq: u64) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every checkpoint for the order, oldest first.
    async fn history(&self, order_id: &OrderId) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Orders whose latest checkpoint is still running.
    async fn active_orders(&self) -> Result<Vec<OrderId>, CheckpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OrderBrief, Thresholds};
    use std::sync::Arc;

    pub(super) fn state(id: &str) -> StateContainer {
        StateContainer::new(
            OrderId::from(id),
            OrderBrief {
                description: "Essay".into(),
                pages: 1,
                deadline: None,
                target_words: None,
                attachments: vec![],
            },
            Thresholds::default(),
        )
    }

    async fn exercise(store: Arc<dyn CheckpointStore>) {
        let id = OrderId::from("C-1");
        let s0 = state("C-1");
        store.save(&id, 0, None, &s0).await.unwrap();
        let stage = StageName::from("write_draft");
        store.save(&id, 1, Some(&stage), &s0).await.unwrap();

        // Duplicate and stale sequences are rejected.
        for seq in [1, 0] {
            let err = store.save(&id, seq, Some(&stage), &s0).await.unwrap_err();
            assert!(matches!(err, CheckpointError::OutOfOrder { latest: 1, .. }));
        }

        let latest = store.load(&id).await.unwrap().unwrap();
        assert_eq!(latest.seq, 1);
        assert_eq!(latest.stage, Some(stage.clone()));
        assert_eq!(latest.state, s0);

        let first = store.load_at(&id, 0).await.unwrap().unwrap();
        assert_eq!(first.stage, None);
        assert!(store.load_at(&id, 7).await.unwrap().is_none());

        let seqs: Vec<u64> = store.history(&id).await.unwrap().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![0, 1]);

        assert_eq!(store.active_orders().await.unwrap(), vec![id.clone()]);
        let done = s0.transition(crate::state::ControlUpdate::Finished);
        store.save(&id, 2, Some(&stage), &done).await.unwrap();
        assert!(store.active_orders().await.unwrap().is_empty());

        assert!(store.load(&OrderId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(Arc::new(MemoryCheckpointStore::new())).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let db = crate::db::DbHandle::in_memory().unwrap();
        exercise(Arc::new(SqliteCheckpointStore::new(db))).await;
    }
}
