use std::collections::HashMap;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A named, versionless conversation script owned by one tenant. The authoring
/// UI writes these rows; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Fallback flow when no keyword matches. Uniqueness is not enforced; the
    /// first default in enumeration order wins.
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// A typed step. New node types are a compile-time-checked extension: add a
/// variant here and the executor match stops compiling until it is handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry marker; performs no action, execution begins at its successor.
    Start,
    Message(MessageConfig),
    Question(QuestionConfig),
    Delay(DelayConfig),
    Pause,
    Condition(ConditionConfig),
    Action(ActionConfig),
    Transfer(TransferConfig),
    End,
    /// Node types this engine version does not know. Deserializes instead of
    /// failing the whole flow; the executor passes it through.
    #[serde(other)]
    Unknown,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Message(_) => "message",
            NodeKind::Question(_) => "question",
            NodeKind::Delay(_) => "delay",
            NodeKind::Pause => "pause",
            NodeKind::Condition(_) => "condition",
            NodeKind::Action(_) => "action",
            NodeKind::Transfer(_) => "transfer",
            NodeKind::End => "end",
            NodeKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MediaAttachment {
    pub url: String,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionConfig {
    pub text: String,
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QuestionOption {
    pub label: String,
}

/// Branch handle for option `index` (0-based): `option-1`, `option-2`, ..
pub fn option_handle(index: usize) -> String {
    format!("option-{}", index + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DelayConfig {
    pub value: u64,
    pub unit: DelayUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        let secs = match self.unit {
            DelayUnit::Seconds => self.value,
            DelayUnit::Minutes => self.value * 60,
            DelayUnit::Hours => self.value * 3600,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConditionConfig {
    /// Context-bag key the predicate reads; today only the last inbound text
    /// is populated.
    #[serde(default = "default_condition_field")]
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

fn default_condition_field() -> String {
    "last_message".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionConfig {
    /// Case-insensitive evaluation. A missing field never satisfies a value
    /// operator; `is_empty` treats missing as empty.
    pub fn eval(&self, actual: Option<&str>) -> bool {
        use ConditionOperator::*;
        match self.operator {
            IsEmpty => actual.is_none_or(|v| v.trim().is_empty()),
            IsNotEmpty => actual.is_some_and(|v| !v.trim().is_empty()),
            _ => {
                let Some(actual) = actual else { return false };
                let actual = actual.to_lowercase();
                let expected = self.value.as_deref().unwrap_or_default().to_lowercase();
                match self.operator {
                    Contains => actual.contains(&expected),
                    NotContains => !actual.contains(&expected),
                    Equals => actual == expected,
                    NotEquals => actual != expected,
                    StartsWith => actual.starts_with(&expected),
                    NotStartsWith => !actual.starts_with(&expected),
                    EndsWith => actual.ends_with(&expected),
                    NotEndsWith => !actual.ends_with(&expected),
                    IsEmpty | IsNotEmpty => unreachable!(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionConfig {
    MoveLeadToStage { stage_id: String },
    AddTag { tag: String },
    RemoveTag { tag: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransferConfig {
    /// Hand-off notice sent to the contact; templated like message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// A directed connection, optionally discriminated by a source handle
/// (`"true"`/`"false"`, `option-N`) for branching nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Error)]
pub enum FlowDefinitionError {
    #[error("flow `{flow}` defines node `{node}` twice")]
    DuplicateNode { flow: String, node: String },
}

/// Id-keyed arena over one flow's nodes and edges, with a
/// `(source, handle)` index built once so each step is a map lookup, never a
/// scan. Cycles are legal; the interpreter's step cap is the runaway guard.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    flow: Flow,
    nodes: HashMap<String, Node>,
    by_handle: HashMap<(String, Option<String>), String>,
    out_order: HashMap<String, Vec<String>>,
}

impl FlowGraph {
    pub fn build(
        flow: Flow,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
    ) -> Result<Self, FlowDefinitionError> {
        let mut node_map = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node_map.insert(node.id.clone(), node.clone()).is_some() {
                return Err(FlowDefinitionError::DuplicateNode {
                    flow: flow.id.clone(),
                    node: node.id,
                });
            }
        }

        let mut by_handle = HashMap::with_capacity(edges.len());
        let mut out_order: HashMap<String, Vec<String>> = HashMap::new();
        for edge in edges {
            if !node_map.contains_key(&edge.source) || !node_map.contains_key(&edge.target) {
                warn!(flow = %flow.id, edge = %edge.id, "skipping edge with dangling endpoint");
                continue;
            }
            let key = (edge.source.clone(), edge.handle.clone());
            if by_handle.contains_key(&key) {
                warn!(flow = %flow.id, edge = %edge.id, "duplicate (source, handle) edge, keeping first");
                continue;
            }
            by_handle.insert(key, edge.target.clone());
            out_order.entry(edge.source).or_default().push(edge.target);
        }

        Ok(Self { flow, nodes: node_map, by_handle, out_order })
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Target of the edge leaving `source` with exactly this handle.
    pub fn next(&self, source: &str, handle: Option<&str>) -> Option<&str> {
        self.by_handle
            .get(&(source.to_string(), handle.map(str::to_string)))
            .map(String::as_str)
    }

    /// Target for nodes with a single logical successor: the handle-less edge
    /// if one exists, otherwise the first outgoing edge.
    pub fn default_next(&self, source: &str) -> Option<&str> {
        self.next(source, None)
            .or_else(|| self.out_order.get(source)?.first().map(String::as_str))
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.values().find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Where execution actually begins: the Start node's single successor.
    pub fn entry_node(&self) -> Option<&str> {
        self.default_next(&self.start_node()?.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: NodeKind) -> Node {
        Node { id: id.into(), kind }
    }

    fn edge(id: &str, source: &str, target: &str, handle: Option<&str>) -> Edge {
        Edge {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            handle: handle.map(str::to_string),
        }
    }

    fn flow() -> Flow {
        Flow {
            id: "f1".into(),
            tenant_id: "t1".into(),
            name: "test".into(),
            active: true,
            is_default: false,
            keywords: vec![],
        }
    }

    #[test]
    fn test_handle_index_and_entry() {
        let graph = FlowGraph::build(
            flow(),
            vec![
                node("start", NodeKind::Start),
                node(
                    "cond",
                    NodeKind::Condition(ConditionConfig {
                        field: "last_message".into(),
                        operator: ConditionOperator::Contains,
                        value: Some("sim".into()),
                    }),
                ),
                node("yes", NodeKind::End),
                node("no", NodeKind::End),
            ],
            vec![
                edge("e1", "start", "cond", None),
                edge("e2", "cond", "yes", Some("true")),
                edge("e3", "cond", "no", Some("false")),
            ],
        )
        .unwrap();

        assert_eq!(graph.entry_node(), Some("cond"));
        assert_eq!(graph.next("cond", Some("true")), Some("yes"));
        assert_eq!(graph.next("cond", Some("false")), Some("no"));
        assert_eq!(graph.next("cond", Some("option-1")), None);
    }

    #[test]
    fn test_default_next_prefers_handleless_edge() {
        let graph = FlowGraph::build(
            flow(),
            vec![node("a", NodeKind::Pause), node("b", NodeKind::End), node("c", NodeKind::End)],
            vec![edge("e1", "a", "b", Some("x")), edge("e2", "a", "c", None)],
        )
        .unwrap();
        assert_eq!(graph.default_next("a"), Some("c"));
    }

    #[test]
    fn test_cycles_are_legal() {
        let graph = FlowGraph::build(
            flow(),
            vec![node("a", NodeKind::Pause), node("b", NodeKind::Pause)],
            vec![edge("e1", "a", "b", None), edge("e2", "b", "a", None)],
        )
        .unwrap();
        assert_eq!(graph.default_next("a"), Some("b"));
        assert_eq!(graph.default_next("b"), Some("a"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = FlowGraph::build(
            flow(),
            vec![node("a", NodeKind::End), node("a", NodeKind::End)],
            vec![],
        );
        assert!(matches!(err, Err(FlowDefinitionError::DuplicateNode { .. })));
    }

    #[test]
    fn test_dangling_edge_skipped() {
        let graph = FlowGraph::build(
            flow(),
            vec![node("a", NodeKind::End)],
            vec![edge("e1", "a", "ghost", None)],
        )
        .unwrap();
        assert_eq!(graph.default_next("a"), None);
    }

    #[test]
    fn test_node_kind_deserializes_by_type_tag() {
        let n: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "delay",
            "value": 5,
            "unit": "minutes"
        }))
        .unwrap();
        match n.kind {
            NodeKind::Delay(cfg) => assert_eq!(cfg.duration(), Duration::from_secs(300)),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_node_type_is_tolerated() {
        let n: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "webhook"
        }))
        .unwrap();
        assert_eq!(n.kind, NodeKind::Unknown);
        assert_eq!(n.kind.name(), "unknown");
    }

    #[test]
    fn test_condition_eval() {
        let contains = ConditionConfig {
            field: "last_message".into(),
            operator: ConditionOperator::Contains,
            value: Some("sim".into()),
        };
        assert!(contains.eval(Some("Sim, claro!")));
        assert!(!contains.eval(Some("não")));
        assert!(!contains.eval(None));

        let empty = ConditionConfig {
            field: "last_message".into(),
            operator: ConditionOperator::IsEmpty,
            value: None,
        };
        assert!(empty.eval(None));
        assert!(empty.eval(Some("  ")));
        assert!(!empty.eval(Some("oi")));

        let starts = ConditionConfig {
            field: "last_message".into(),
            operator: ConditionOperator::StartsWith,
            value: Some("bom".into()),
        };
        assert!(starts.eval(Some("Bom dia")));
        assert!(!starts.eval(Some("dia bom")));
    }

    #[test]
    fn test_option_handles_are_one_based() {
        assert_eq!(option_handle(0), "option-1");
        assert_eq!(option_handle(4), "option-5");
    }
}
