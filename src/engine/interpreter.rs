use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::engine::executors::{self, StepOutcome};
use crate::engine::{Engine, EngineError};
use crate::execution::{Execution, ExecutionLogEntry, ExecutionStatus};
use crate::flow::FlowGraph;

/// Drives repeated node execution from `start` until the execution suspends,
/// terminates, or hits the step cap. The execution record is persisted after
/// every step so a crash mid-run leaves a `running` row the staleness guard
/// can reap.
pub(crate) async fn run(
    engine: &Engine,
    graph: &FlowGraph,
    execution: &mut Execution,
    start: Option<String>,
) -> Result<(), EngineError> {
    let mut current = start;
    let mut steps = 0usize;

    loop {
        let Some(node_id) = current.take() else {
            // Node stream ended without a terminal executor: completed.
            finish(engine, execution, ExecutionStatus::Completed, "completed").await?;
            break;
        };

        steps += 1;
        if steps > engine.config.max_steps_per_run {
            warn!(execution = %execution.id, steps, "step cap exceeded, flow is cyclic or runaway");
            engine
                .store
                .append_log(ExecutionLogEntry::new(
                    &execution.id,
                    Some(&node_id),
                    "guard",
                    "step_cap_exceeded",
                    json!({ "cap": engine.config.max_steps_per_run }),
                ))
                .await?;
            finish(engine, execution, ExecutionStatus::Failed, "failed").await?;
            break;
        }

        let Some(node) = graph.node(&node_id) else {
            warn!(execution = %execution.id, node = %node_id, "current node missing from graph");
            engine
                .store
                .append_log(ExecutionLogEntry::new(
                    &execution.id,
                    Some(&node_id),
                    "guard",
                    "missing_node",
                    json!({}),
                ))
                .await?;
            finish(engine, execution, ExecutionStatus::Failed, "failed").await?;
            break;
        };

        execution.current_node_id = Some(node_id.clone());
        engine
            .store
            .append_log(ExecutionLogEntry::new(
                &execution.id,
                Some(&node.id),
                node.kind.name(),
                "execute",
                json!({ "step": steps }),
            ))
            .await?;
        debug!(execution = %execution.id, node = %node.id, kind = node.kind.name(), "executing node");

        match executors::execute(engine, graph, execution, node).await? {
            StepOutcome::Next(next) => {
                execution.touch();
                engine.store.update(execution).await?;
                current = next;
                if current.is_some() && !engine.config.step_throttle.is_zero() {
                    sleep(engine.config.step_throttle).await;
                }
            }
            StepOutcome::Suspend { status, resume_at } => {
                execution.status = status;
                execution.resume_at = resume_at;
                execution.touch();
                engine.store.update(execution).await?;
                engine
                    .store
                    .append_log(ExecutionLogEntry::new(
                        &execution.id,
                        Some(&node.id),
                        node.kind.name(),
                        "suspended",
                        json!({ "status": status, "resume_at": resume_at }),
                    ))
                    .await?;
                break;
            }
            StepOutcome::Finish(status) => {
                let action = if status == ExecutionStatus::Failed { "failed" } else { "completed" };
                finish(engine, execution, status, action).await?;
                break;
            }
        }
    }

    Ok(())
}

async fn finish(
    engine: &Engine,
    execution: &mut Execution,
    status: ExecutionStatus,
    action: &str,
) -> Result<(), EngineError> {
    execution.finish(status);
    engine.store.update(execution).await?;
    engine
        .store
        .append_log(ExecutionLogEntry::new(&execution.id, None, "flow", action, json!({})))
        .await?;
    Ok(())
}
