pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contact::Contact;
use crate::template::TemplateVars;

pub use store::{ExecutionStore, InMemoryExecutionStore, SharedExecutionStore, StoreError};

pub const CTX_LAST_MESSAGE: &str = "last_message";
pub const CTX_OPERATOR_NAME: &str = "operator_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    WaitingResponse,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Live = occupies the one-conversation-per-contact slot.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

/// One run of a flow for one contact. The triple
/// (status, current_node_id, context) is the entire resumable state: no call
/// stack survives between trigger and resume, every invocation rehydrates
/// from this record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Execution {
    pub id: String,
    pub flow_id: String,
    pub tenant_id: String,
    pub contact: Contact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    pub current_node_id: Option<String>,
    pub status: ExecutionStatus,
    /// Opaque bag; well-known keys are the `CTX_*` constants.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default)]
    pub human_takeover: bool,
    /// Set when a long delay suspends; an external poller fires the resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        flow_id: impl Into<String>,
        tenant_id: impl Into<String>,
        contact: Contact,
        operator_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let mut context = HashMap::new();
        if let Some(op) = operator_name {
            context.insert(CTX_OPERATOR_NAME.to_string(), Value::String(op));
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            tenant_id: tenant_id.into(),
            contact,
            lead_id: None,
            current_node_id: None,
            status: ExecutionStatus::Running,
            context,
            human_takeover: false,
            resume_at: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn last_message(&self) -> Option<&str> {
        self.context_str(CTX_LAST_MESSAGE)
    }

    pub fn set_last_message(&mut self, text: &str) {
        self.context
            .insert(CTX_LAST_MESSAGE.to_string(), Value::String(text.to_string()));
    }

    pub fn template_vars(&self) -> TemplateVars<'_> {
        TemplateVars {
            contact_name: self.contact.name.as_deref(),
            operator_name: self.context_str(CTX_OPERATOR_NAME),
        }
    }

    /// Bumps `updated_at`; the staleness guard measures from this.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.current_node_id = None;
        self.resume_at = None;
        let now = Utc::now();
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

/// Append-only audit record, one per interpreter step or notable event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionLogEntry {
    pub id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub node_kind: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl ExecutionLogEntry {
    pub fn new(
        execution_id: &str,
        node_id: Option<&str>,
        node_kind: &str,
        action: &str,
        detail: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            node_id: node_id.map(str::to_string),
            node_kind: node_kind.to_string(),
            action: action.to_string(),
            detail,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> Execution {
        Execution::new(
            "f1",
            "t1",
            Contact::new("c1", "5511999998888", Some("Maria Silva".into())),
            Some("Carlos".into()),
        )
    }

    #[test]
    fn test_new_execution_is_live_running() {
        let e = exec();
        assert_eq!(e.status, ExecutionStatus::Running);
        assert!(e.status.is_live());
        assert!(e.completed_at.is_none());
        assert!(!e.human_takeover);
    }

    #[test]
    fn test_template_vars_come_from_record() {
        let mut e = exec();
        e.set_last_message("oi");
        let vars = e.template_vars();
        assert_eq!(vars.contact_name, Some("Maria Silva"));
        assert_eq!(vars.operator_name, Some("Carlos"));
        assert_eq!(e.last_message(), Some("oi"));
    }

    #[test]
    fn test_finish_clears_position_and_timer() {
        let mut e = exec();
        e.current_node_id = Some("n1".into());
        e.resume_at = Some(Utc::now());
        e.finish(ExecutionStatus::Completed);
        assert!(e.status.is_terminal());
        assert!(e.current_node_id.is_none());
        assert!(e.resume_at.is_none());
        assert!(e.completed_at.is_some());
    }

    #[test]
    fn test_status_liveness() {
        assert!(ExecutionStatus::Running.is_live());
        assert!(ExecutionStatus::WaitingResponse.is_live());
        assert!(ExecutionStatus::Paused.is_live());
        assert!(!ExecutionStatus::Completed.is_live());
        assert!(!ExecutionStatus::Failed.is_live());
    }
}
