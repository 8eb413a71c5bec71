pub mod graph;
pub mod selector;
pub mod store;

pub use graph::{Flow, FlowGraph, Node, NodeKind};
pub use selector::select_flow;
pub use store::{FlowDefinition, FlowStore, InMemoryFlowStore};
