use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointStore};
use crate::errors::CheckpointError;
use crate::state::{OrderId, RunStatus, StageName, StateContainer};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    orders: RwLock<HashMap<OrderId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        order_id: &OrderId,
        seq: u64,
        stage: Option<&StageName>,
        state: &StateContainer,
    ) -> Result<(), CheckpointError> {
        let mut orders = self.orders.write().await;
        let history = orders.entry(order_id.clone()).or_default();
        if let Some(latest) = history.last().map(|c| c.seq) {
            if seq <= latest {
                return Err(CheckpointError::OutOfOrder {
                    order_id: order_id.clone(),
                    seq,
                    latest,
                });
            }
        }
        history.push(Checkpoint {
            order_id: order_id.clone(),
            seq,
            stage: stage.cloned(),
            state: state.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn load(&self, order_id: &OrderId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .orders
            .read()
            .await
            .get(order_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn load_at(&self, order_id: &OrderId, seq: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .orders
            .read()
            .await
            .get(order_id)
            .and_then(|h| h.iter().find(|c| c.seq == seq).cloned()))
    }

    async fn history(&self, order_id: &OrderId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn active_orders(&self) -> Result<Vec<OrderId>, CheckpointError> {
        let orders = self.orders.read().await;
        let mut active: Vec<OrderId> = orders
            .iter()
            .filter(|(_, h)| h.last().is_some_and(|c| c.status() == RunStatus::Running))
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        Ok(active)
    }
}
