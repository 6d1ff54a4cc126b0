use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::OrderStore;
use crate::db::DbHandle;
use crate::state::{DegradedFlags, OrderBrief, OrderId, RunStatus, StateContainer};

/// What the supervisor reports about an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub brief: OrderBrief,
    pub status: RunStatus,
    #[serde(default)]
    pub degraded: DegradedFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable_draft: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Summarize a run's state for the order store.
    pub fn from_state(state: &StateContainer) -> Self {
        let completed = state.status() == RunStatus::Completed;
        Self {
            order_id: state.order_id().clone(),
            brief: state.brief().clone(),
            status: state.status(),
            degraded: state.degraded(),
            current_stage: state.current_stage().map(|s| s.to_string()),
            final_text: completed.then(|| state.final_text().to_string()),
            recoverable_draft: if completed {
                None
            } else {
                state.recoverable_draft().map(str::to_string)
            },
            failure: state
                .error()
                .map(|e| format!("{}: {}", e.kind, e.message)),
            updated_at: Utc::now(),
        }
    }
}

/// In-process order store for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    records: RwLock<BTreeMap<OrderId, OrderRecord>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn upsert(&self, record: OrderRecord) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .insert(record.order_id.clone(), record);
        Ok(())
    }

    async fn get(&self, order_id: &OrderId) -> anyhow::Result<Option<OrderRecord>> {
        Ok(self.records.read().await.get(order_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<OrderRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn delete(&self, order_id: &OrderId) -> anyhow::Result<bool> {
        Ok(self.records.write().await.remove(order_id).is_some())
    }
}

/// Order store backed by the shared SQLite database.
#[derive(Clone)]
pub struct SqliteOrderStore {
    db: DbHandle,
}

impl SqliteOrderStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn upsert(&self, record: OrderRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(&record).context("Failed to encode order record")?;
        let id = record.order_id.to_string();
        let status = record.status.as_str();
        self.db
            .call(move |db| db.upsert_order(&id, status, &json))
            .await
    }

    async fn get(&self, order_id: &OrderId) -> anyhow::Result<Option<OrderRecord>> {
        let id = order_id.to_string();
        let json = self.db.call(move |db| db.get_order(&id)).await?;
        json.map(|j| serde_json::from_str(&j).context("Failed to decode order record"))
            .transpose()
    }

    async fn list(&self) -> anyhow::Result<Vec<OrderRecord>> {
        let rows = self.db.call(|db| db.list_orders()).await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).context("Failed to decode order record"))
            .collect()
    }

    async fn delete(&self, order_id: &OrderId) -> anyhow::Result<bool> {
        let id = order_id.to_string();
        self.db.call(move |db| db.delete_order(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Thresholds;

    fn record(id: &str, status: RunStatus) -> OrderRecord {
        let state = StateContainer::new(
            OrderId::from(id),
            OrderBrief {
                description: "Essay".into(),
                pages: 2,
                deadline: None,
                target_words: None,
                attachments: vec![],
            },
            Thresholds::default(),
        );
        let mut rec = OrderRecord::from_state(&state);
        rec.status = status;
        rec
    }

    #[tokio::test]
    async fn memory_store_crud() {
        let store = MemoryOrderStore::new();
        store.upsert(record("A-1", RunStatus::Running)).await.unwrap();
        store.upsert(record("A-1", RunStatus::Completed)).await.unwrap();
        let got = store.get(&OrderId::from("A-1")).await.unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Completed);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete(&OrderId::from("A-1")).await.unwrap());
        assert!(store.get(&OrderId::from("A-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_records() {
        let store = SqliteOrderStore::new(DbHandle::in_memory().unwrap());
        store.upsert(record("B-2", RunStatus::Failed)).await.unwrap();
        let got = store.get(&OrderId::from("B-2")).await.unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Failed);
        assert_eq!(got.brief.pages, 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete(&OrderId::from("B-2")).await.unwrap());
    }

    #[test]
    fn record_from_fresh_state_has_no_content() {
        let rec = record("C-3", RunStatus::Running);
        assert!(rec.final_text.is_none());
        assert!(rec.recoverable_draft.is_none());
        assert!(rec.failure.is_none());
    }
}
