use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Checkpoint, CheckpointStore};
use crate::db::{AppendOutcome, CheckpointRow, DbHandle};
use crate::errors::CheckpointError;
use crate::state::{OrderId, StageName, StateContainer};

/// Durable store on the shared SQLite database (WAL, `synchronous=FULL`).
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: DbHandle,
}

impl SqliteCheckpointStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn decode(row: CheckpointRow) -> Result<Checkpoint, CheckpointError> {
    let order_id = OrderId::new(row.order_id);
    let state: StateContainer =
        serde_json::from_str(&row.state_json).map_err(|source| CheckpointError::Decode {
            order_id: order_id.clone(),
            source,
        })?;
    let created_at = row
        .created_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| CheckpointError::Storage(anyhow::anyhow!("Bad checkpoint timestamp: {}", e)))?;
    Ok(Checkpoint {
        order_id,
        seq: row.seq,
        stage: row.stage.map(StageName::new),
        state,
        created_at,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(
        &self,
        order_id: &OrderId,
        seq: u64,
        stage: Option<&StageName>,
        state: &StateContainer,
    ) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(state).map_err(|source| CheckpointError::Encode {
            order_id: order_id.clone(),
            source,
        })?;
        let id = order_id.to_string();
        let stage = stage.map(|s| s.to_string());
        let status = state.status().as_str();

        let outcome = self
            .db
            .call(move |db| db.append_checkpoint(&id, seq, stage.as_deref(), status, &json))
            .await
            .map_err(CheckpointError::Storage)?;

        match outcome {
            AppendOutcome::Appended => Ok(()),
            AppendOutcome::Rejected { latest } => Err(CheckpointError::OutOfOrder {
                order_id: order_id.clone(),
                seq,
                latest,
            }),
        }
    }

    async fn load(&self, order_id: &OrderId) -> Result<Option<Checkpoint>, CheckpointError> {
        let id = order_id.to_string();
        self.db
            .call(move |db| db.latest_checkpoint(&id))
            .await
            .map_err(CheckpointError::Storage)?
            .map(decode)
            .transpose()
    }

    async fn load_at(&self, order_id: &OrderId, seq: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        let id = order_id.to_string();
        self.db
            .call(move |db| db.checkpoint_at(&id, seq))
            .await
            .map_err(CheckpointError::Storage)?
            .map(decode)
            .transpose()
    }

    async fn history(&self, order_id: &OrderId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let id = order_id.to_string();
        self.db
            .call(move |db| db.checkpoint_history(&id))
            .await
            .map_err(CheckpointError::Storage)?
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn active_orders(&self) -> Result<Vec<OrderId>, CheckpointError> {
        let ids = self
            .db
            .call(|db| db.active_order_ids())
            .await
            .map_err(CheckpointError::Storage)?;
        Ok(ids.into_iter().map(OrderId::new).collect())
    }
}
