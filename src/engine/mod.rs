pub(crate) mod executors;
pub(crate) mod interpreter;
mod resume;

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::contact::InboundTrigger;
use crate::crm::CrmMutator;
use crate::execution::{Execution, ExecutionLogEntry, ExecutionStore, StoreError};
use crate::flow::select_flow;
use crate::flow::store::{FlowStore, FlowStoreError};
use crate::gateway::MessagingGateway;

pub use resume::ResumeOutcome;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    FlowStore(#[from] FlowStoreError),
    #[error("execution {0} not found")]
    ExecutionNotFound(String),
}

/// Outcome of routing a fresh inbound trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Started { execution_id: String, flow_id: String },
    /// A live execution already owns this contact; the trigger is dropped,
    /// not queued.
    Skipped,
    /// No keyword matched and the tenant has no default flow.
    NoFlow,
    /// The contact carries the do-not-auto-trigger marker a transfer set.
    Blocked,
}

/// The interpreter core. Holds no conversation state of its own: every
/// invocation rehydrates from the execution store, so any number of engine
/// instances can serve the same tenant.
#[derive(Debug, Clone)]
pub struct Engine {
    pub(crate) flows: Arc<dyn FlowStore>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) gateway: Arc<dyn MessagingGateway>,
    pub(crate) crm: Arc<dyn CrmMutator>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        store: Arc<dyn ExecutionStore>,
        gateway: Arc<dyn MessagingGateway>,
        crm: Arc<dyn CrmMutator>,
        config: EngineConfig,
    ) -> Self {
        Self { flows, store, gateway, crm, config }
    }

    /// Entry point for a fresh inbound message (a contact with no live
    /// execution, as far as the caller knows). Selects a flow, creates the
    /// execution and walks it until it suspends or terminates.
    #[tracing::instrument(skip(self, trigger), fields(tenant = %trigger.tenant_id, contact = %trigger.contact.id))]
    pub async fn start_or_route(
        &self,
        trigger: &InboundTrigger,
    ) -> Result<TriggerOutcome, EngineError> {
        let tenant_id = &trigger.tenant_id;
        let contact = &trigger.contact;

        if self.store.is_auto_trigger_blocked(tenant_id, &contact.id).await? {
            info!("contact is blocked from auto-trigger (human takeover)");
            return Ok(TriggerOutcome::Blocked);
        }

        // At most one live execution per contact, enforced here at creation
        // time. A stale one is force-failed so it cannot wedge the contact
        // forever; the fresh trigger then proceeds.
        if let Some(live) = self.store.find_live_by_contact(tenant_id, &contact.id).await? {
            if let Some(reason) = self.staleness_of(&live) {
                self.force_fail(live, reason).await?;
            } else {
                info!("live execution exists, skipping trigger");
                return Ok(TriggerOutcome::Skipped);
            }
        }

        let flows = self.flows.active_flows(tenant_id).await?;
        let Some(flow) = select_flow(&flows, &trigger.text) else {
            info!("no flow matched");
            return Ok(TriggerOutcome::NoFlow);
        };
        let flow_id = flow.id.clone();

        let Some(graph) = self.flows.graph(&flow_id).await? else {
            warn!(flow = %flow_id, "selected flow has no stored graph");
            return Ok(TriggerOutcome::NoFlow);
        };
        let Some(entry) = graph.entry_node().map(str::to_string) else {
            warn!(flow = %flow_id, "flow has no start successor, nothing to run");
            return Ok(TriggerOutcome::NoFlow);
        };

        let mut execution = Execution::new(
            flow_id.clone(),
            tenant_id.clone(),
            contact.clone(),
            trigger.operator_name.clone(),
        );
        execution.set_last_message(&trigger.text);
        execution.current_node_id = Some(entry.clone());
        self.store.create(&execution).await?;
        self.store
            .append_log(ExecutionLogEntry::new(
                &execution.id,
                None,
                "start",
                "started",
                json!({ "flow_id": flow_id, "trigger_text": trigger.text }),
            ))
            .await?;
        info!(flow = %flow_id, execution = %execution.id, "starting execution");

        interpreter::run(self, &graph, &mut execution, Some(entry)).await?;

        Ok(TriggerOutcome::Started { execution_id: execution.id, flow_id })
    }

    pub(crate) async fn force_fail(
        &self,
        mut execution: Execution,
        reason: &str,
    ) -> Result<(), EngineError> {
        warn!(execution = %execution.id, reason, "force-finalizing execution as failed");
        self.store
            .append_log(ExecutionLogEntry::new(
                &execution.id,
                execution.current_node_id.as_deref(),
                "guard",
                "force_failed",
                json!({ "reason": reason }),
            ))
            .await?;
        execution.finish(crate::execution::ExecutionStatus::Failed);
        self.store.update(&execution).await?;
        Ok(())
    }
}
