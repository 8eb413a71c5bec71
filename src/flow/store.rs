use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::flow::graph::{Edge, Flow, FlowDefinitionError, FlowGraph, Node};

pub type SharedFlowStore = Arc<dyn FlowStore>;

#[derive(Debug, Error)]
pub enum FlowStoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("flow parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Definition(#[from] FlowDefinitionError),
}

/// Read-only view over flow definitions. The engine never writes here; the
/// authoring UI owns the rows.
#[async_trait]
pub trait FlowStore: Send + Sync + Debug {
    /// All active flows of a tenant, in a stable enumeration order.
    async fn active_flows(&self, tenant_id: &str) -> Result<Vec<Flow>, FlowStoreError>;

    async fn graph(&self, flow_id: &str) -> Result<Option<FlowGraph>, FlowStoreError>;
}

/// On-disk shape of one flow definition (what the demo binary loads and what
/// an authoring export looks like).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowDefinition {
    pub flow: Flow,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn into_graph(self) -> Result<FlowGraph, FlowDefinitionError> {
        FlowGraph::build(self.flow, self.nodes, self.edges)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    graphs: DashMap<String, FlowGraph>,
    /// tenant id → flow ids in registration order (enumeration order matters
    /// for first-match-wins selection).
    by_tenant: DashMap<String, Vec<String>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, graph: FlowGraph) {
        let flow = graph.flow().clone();
        self.by_tenant.entry(flow.tenant_id.clone()).or_default().push(flow.id.clone());
        self.graphs.insert(flow.id.clone(), graph);
        info!(flow = %flow.id, tenant = %flow.tenant_id, "registered flow");
    }

    pub fn load_from_file(&self, path: &Path) -> Result<String, FlowStoreError> {
        let contents = fs::read_to_string(path)?;
        let definition: FlowDefinition = serde_json::from_str(&contents)?;
        let graph = definition.into_graph()?;
        let id = graph.flow().id.clone();
        self.register(graph);
        Ok(id)
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn active_flows(&self, tenant_id: &str) -> Result<Vec<Flow>, FlowStoreError> {
        let ids = self.by_tenant.get(tenant_id).map(|v| v.clone()).unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.graphs.get(id))
            .map(|g| g.flow().clone())
            .filter(|f| f.active)
            .collect())
    }

    async fn graph(&self, flow_id: &str) -> Result<Option<FlowGraph>, FlowStoreError> {
        Ok(self.graphs.get(flow_id).map(|g| g.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::graph::NodeKind;

    fn graph(id: &str, tenant: &str, active: bool) -> FlowGraph {
        FlowGraph::build(
            Flow {
                id: id.into(),
                tenant_id: tenant.into(),
                name: id.into(),
                active,
                is_default: false,
                keywords: vec![],
            },
            vec![Node { id: "start".into(), kind: NodeKind::Start }],
            vec![],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list_keeps_order() {
        let store = InMemoryFlowStore::new();
        store.register(graph("f1", "t1", true));
        store.register(graph("f2", "t1", true));
        store.register(graph("other", "t2", true));

        let flows = store.active_flows("t1").await.unwrap();
        let ids: Vec<_> = flows.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, ["f1", "f2"]);
    }

    #[tokio::test]
    async fn test_inactive_flows_filtered() {
        let store = InMemoryFlowStore::new();
        store.register(graph("f1", "t1", false));
        assert!(store.active_flows("t1").await.unwrap().is_empty());
        // graph itself is still loadable (a suspended execution may finish)
        assert!(store.graph("f1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_flow_graph_is_none() {
        let store = InMemoryFlowStore::new();
        assert!(store.graph("ghost").await.unwrap().is_none());
    }
}
