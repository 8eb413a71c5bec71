use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::execution::{Execution, ExecutionLogEntry};

pub type SharedExecutionStore = Arc<dyn ExecutionStore>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution {0} not found")]
    NotFound(String),
    #[error("execution {0} already exists")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for executions, their append-only log, and the durable
/// do-not-auto-trigger marker a transfer leaves on a contact. This is the sole
/// source of truth for resumption; consecutive steps of one conversation may
/// run in different process instances.
#[async_trait]
pub trait ExecutionStore: Send + Sync + Debug {
    async fn create(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    async fn update(&self, execution: &Execution) -> Result<(), StoreError>;

    /// The at-most-one non-terminal execution for (tenant, contact), if any.
    async fn find_live_by_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Execution>, StoreError>;

    /// Paused executions whose scheduled resume timestamp has passed; what an
    /// external delay poller feeds back into `Engine::resume`.
    async fn find_due_resumes(&self, now: DateTime<Utc>) -> Result<Vec<Execution>, StoreError>;

    /// Insert-only; entries are never mutated.
    async fn append_log(&self, entry: ExecutionLogEntry) -> Result<(), StoreError>;

    async fn logs(&self, execution_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError>;

    async fn block_auto_trigger(&self, tenant_id: &str, contact_id: &str)
    -> Result<(), StoreError>;

    async fn is_auto_trigger_blocked(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<bool, StoreError>;
}

fn contact_key(tenant_id: &str, contact_id: &str) -> String {
    format!("{}|{}", tenant_id, contact_id)
}

/// DashMap-backed store for tests and the demo binary. A real deployment puts
/// a database behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: DashMap<String, Execution>,
    /// (tenant|contact) → live execution id; dropped when that execution
    /// reaches a terminal status.
    live_by_contact: DashMap<String, String>,
    logs: DashMap<String, Vec<ExecutionLogEntry>>,
    blocked: DashSet<String>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sync_live_index(&self, execution: &Execution) {
        let key = contact_key(&execution.tenant_id, &execution.contact.id);
        if execution.status.is_live() {
            self.live_by_contact.insert(key, execution.id.clone());
        } else if self
            .live_by_contact
            .get(&key)
            .is_some_and(|id| *id == execution.id)
        {
            self.live_by_contact.remove(&key);
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<(), StoreError> {
        if self.executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists(execution.id.clone()));
        }
        self.executions.insert(execution.id.clone(), execution.clone());
        self.sync_live_index(execution);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        if !self.executions.contains_key(&execution.id) {
            return Err(StoreError::NotFound(execution.id.clone()));
        }
        self.executions.insert(execution.id.clone(), execution.clone());
        self.sync_live_index(execution);
        Ok(())
    }

    async fn find_live_by_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Option<Execution>, StoreError> {
        let key = contact_key(tenant_id, contact_id);
        let Some(id) = self.live_by_contact.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.executions.get(&id).filter(|e| e.status.is_live()).map(|e| e.clone()))
    }

    async fn find_due_resumes(&self, now: DateTime<Utc>) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.status.is_live() && e.resume_at.is_some_and(|at| at <= now))
            .map(|e| e.clone())
            .collect())
    }

    async fn append_log(&self, entry: ExecutionLogEntry) -> Result<(), StoreError> {
        self.logs.entry(entry.execution_id.clone()).or_default().push(entry);
        Ok(())
    }

    async fn logs(&self, execution_id: &str) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        Ok(self.logs.get(execution_id).map(|l| l.clone()).unwrap_or_default())
    }

    async fn block_auto_trigger(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<(), StoreError> {
        self.blocked.insert(contact_key(tenant_id, contact_id));
        Ok(())
    }

    async fn is_auto_trigger_blocked(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.blocked.contains(&contact_key(tenant_id, contact_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Contact;
    use crate::execution::ExecutionStatus;
    use chrono::Duration;
    use serde_json::json;

    fn exec(contact_id: &str) -> Execution {
        Execution::new("f1", "t1", Contact::new(contact_id, "11999998888", None), None)
    }

    #[tokio::test]
    async fn test_create_get_update_roundtrip() {
        let store = InMemoryExecutionStore::new();
        let mut e = exec("c1");
        store.create(&e).await.unwrap();
        assert!(matches!(store.create(&e).await, Err(StoreError::AlreadyExists(_))));

        e.set_last_message("oi");
        store.update(&e).await.unwrap();
        let loaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_message(), Some("oi"));
    }

    #[tokio::test]
    async fn test_update_unknown_execution_fails() {
        let store = InMemoryExecutionStore::new();
        assert!(matches!(store.update(&exec("c1")).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_live_index_follows_status() {
        let store = InMemoryExecutionStore::new();
        let mut e = exec("c1");
        store.create(&e).await.unwrap();

        let live = store.find_live_by_contact("t1", "c1").await.unwrap();
        assert_eq!(live.map(|l| l.id), Some(e.id.clone()));

        e.finish(ExecutionStatus::Completed);
        store.update(&e).await.unwrap();
        assert!(store.find_live_by_contact("t1", "c1").await.unwrap().is_none());

        // slot is free again for a fresh execution
        let e2 = exec("c1");
        store.create(&e2).await.unwrap();
        let live = store.find_live_by_contact("t1", "c1").await.unwrap().unwrap();
        assert_eq!(live.id, e2.id);
    }

    #[tokio::test]
    async fn test_due_resumes() {
        let store = InMemoryExecutionStore::new();
        let mut due = exec("c1");
        due.status = ExecutionStatus::Paused;
        due.resume_at = Some(Utc::now() - Duration::seconds(1));
        store.create(&due).await.unwrap();

        let mut later = exec("c2");
        later.status = ExecutionStatus::Paused;
        later.resume_at = Some(Utc::now() + Duration::hours(1));
        store.create(&later).await.unwrap();

        let found = store.find_due_resumes(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_log_append_order() {
        let store = InMemoryExecutionStore::new();
        let e = exec("c1");
        for action in ["execute", "sent", "finished"] {
            store
                .append_log(ExecutionLogEntry::new(&e.id, Some("n1"), "message", action, json!({})))
                .await
                .unwrap();
        }
        let logs = store.logs(&e.id).await.unwrap();
        let actions: Vec<_> = logs.iter().map(|l| l.action.as_str()).collect();
        assert_eq!(actions, ["execute", "sent", "finished"]);
    }

    #[tokio::test]
    async fn test_auto_trigger_block_is_per_contact() {
        let store = InMemoryExecutionStore::new();
        store.block_auto_trigger("t1", "c1").await.unwrap();
        assert!(store.is_auto_trigger_blocked("t1", "c1").await.unwrap());
        assert!(!store.is_auto_trigger_blocked("t1", "c2").await.unwrap());
        assert!(!store.is_auto_trigger_blocked("t2", "c1").await.unwrap());
    }
}
