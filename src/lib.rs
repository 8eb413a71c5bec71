//! zapflow: conversation flow automation for chat channels.
//!
//! A tenant authors a directed graph of typed steps; the engine walks one
//! contact through that graph in response to inbound messages and timers.
//! Nothing survives in memory between steps: the execution store holds the
//! whole resumable state, so triggers and resumes can land on any instance.

pub mod config;
pub mod contact;
pub mod crm;
pub mod engine;
pub mod execution;
pub mod flow;
pub mod gateway;
pub mod telemetry;
pub mod template;

pub use config::EngineConfig;
pub use contact::{Contact, InboundReply, InboundTrigger};
pub use engine::{Engine, EngineError, ResumeOutcome, TriggerOutcome};
pub use execution::{Execution, ExecutionLogEntry, ExecutionStatus, ExecutionStore};
pub use flow::{Flow, FlowGraph, FlowStore};
pub use gateway::MessagingGateway;
