use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::warn;

use crate::engine::{Engine, EngineError};
use crate::execution::{Execution, ExecutionLogEntry, ExecutionStatus};
use crate::flow::FlowGraph;
use crate::flow::graph::{
    ActionConfig, DelayConfig, MessageConfig, Node, NodeKind, QuestionConfig, TransferConfig,
    option_handle,
};
use crate::gateway::Choice;
use crate::template::render;

/// Options up to this count go out as the channel's native selection UI;
/// larger sets fall back to a numbered text prompt.
pub(crate) const MAX_STRUCTURED_OPTIONS: usize = 3;

/// What one node execution decided.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// Continue to this node; `None` means the stream ended and the
    /// interpreter marks the execution completed.
    Next(Option<String>),
    /// Persist and wait for an external event.
    Suspend { status: ExecutionStatus, resume_at: Option<DateTime<Utc>> },
    /// Terminal; the node already did its bookkeeping.
    Finish(ExecutionStatus),
}

impl StepOutcome {
    fn next_from(graph: &FlowGraph, node_id: &str) -> Self {
        StepOutcome::Next(graph.default_next(node_id).map(str::to_string))
    }
}

/// Dispatches one node. Exhaustive over `NodeKind`: adding a variant without
/// handling it here is a compile error. Side-effect failures (gateway, CRM)
/// are caught, logged and swallowed so a transient external fault never
/// wedges the conversation.
pub(crate) async fn execute(
    engine: &Engine,
    graph: &FlowGraph,
    execution: &mut Execution,
    node: &Node,
) -> Result<StepOutcome, EngineError> {
    match &node.kind {
        NodeKind::Start => Ok(StepOutcome::next_from(graph, &node.id)),
        NodeKind::Message(cfg) => message(engine, graph, execution, node, cfg).await,
        NodeKind::Question(cfg) => question(engine, execution, node, cfg).await,
        NodeKind::Delay(cfg) => delay(engine, graph, node, cfg).await,
        NodeKind::Pause => Ok(StepOutcome::Suspend {
            status: ExecutionStatus::WaitingResponse,
            resume_at: None,
        }),
        NodeKind::Condition(cfg) => {
            let actual = execution.context_str(&cfg.field);
            let met = cfg.eval(actual);
            let handle = if met { "true" } else { "false" };
            log_step(engine, execution, node, "branch", json!({ "result": met })).await?;
            Ok(StepOutcome::Next(graph.next(&node.id, Some(handle)).map(str::to_string)))
        }
        NodeKind::Action(cfg) => action(engine, graph, execution, node, cfg).await,
        NodeKind::Transfer(cfg) => transfer(engine, execution, node, cfg).await,
        NodeKind::End => Ok(StepOutcome::Finish(ExecutionStatus::Completed)),
        NodeKind::Unknown => {
            warn!(node = %node.id, "unknown node type, passing through");
            log_step(engine, execution, node, "skipped_unknown", json!({})).await?;
            Ok(StepOutcome::next_from(graph, &node.id))
        }
    }
}

async fn message(
    engine: &Engine,
    graph: &FlowGraph,
    execution: &mut Execution,
    node: &Node,
    cfg: &MessageConfig,
) -> Result<StepOutcome, EngineError> {
    let vars = execution.template_vars();
    let contact = &execution.contact;

    let result = if let Some(media) = &cfg.media {
        let caption = media
            .caption
            .as_deref()
            .or(cfg.text.as_deref())
            .map(|c| render(c, &vars));
        engine.gateway.send_media(contact, media, caption.as_deref()).await
    } else {
        let text = render(cfg.text.as_deref().unwrap_or_default(), &vars);
        engine.gateway.send_text(contact, &text).await
    };

    match result {
        Ok(()) => log_step(engine, execution, node, "sent", json!({})).await?,
        Err(err) => {
            warn!(node = %node.id, %err, "message send failed, continuing");
            log_step(engine, execution, node, "send_failed", json!({ "error": err.to_string() }))
                .await?;
        }
    }
    Ok(StepOutcome::next_from(graph, &node.id))
}

async fn question(
    engine: &Engine,
    execution: &mut Execution,
    node: &Node,
    cfg: &QuestionConfig,
) -> Result<StepOutcome, EngineError> {
    send_question_prompt(engine, execution, cfg).await;
    log_step(engine, execution, node, "asked", json!({ "options": cfg.options.len() })).await?;
    Ok(StepOutcome::Suspend { status: ExecutionStatus::WaitingResponse, resume_at: None })
}

/// Sends a question prompt: structured up to `MAX_STRUCTURED_OPTIONS`,
/// numbered text beyond that. Shared with the resume path's re-prompt.
pub(crate) async fn send_question_prompt(
    engine: &Engine,
    execution: &Execution,
    cfg: &QuestionConfig,
) {
    let vars = execution.template_vars();
    let contact = &execution.contact;
    let text = render(&cfg.text, &vars);

    let result = if (1..=MAX_STRUCTURED_OPTIONS).contains(&cfg.options.len()) {
        let choices: Vec<Choice> = cfg
            .options
            .iter()
            .enumerate()
            .map(|(i, opt)| Choice { id: option_handle(i), label: opt.label.clone() })
            .collect();
        engine.gateway.send_choice_prompt(contact, &text, &choices).await
    } else {
        engine.gateway.send_text(contact, &numbered_prompt(&text, cfg)).await
    };

    if let Err(err) = result {
        warn!(%err, "question prompt send failed, staying suspended");
    }
}

fn numbered_prompt(rendered_text: &str, cfg: &QuestionConfig) -> String {
    let mut prompt = rendered_text.to_string();
    for (i, opt) in cfg.options.iter().enumerate() {
        prompt.push_str(&format!("\n{} - {}", i + 1, opt.label));
    }
    prompt
}

async fn delay(
    engine: &Engine,
    graph: &FlowGraph,
    node: &Node,
    cfg: &DelayConfig,
) -> Result<StepOutcome, EngineError> {
    let wait = cfg.duration();
    if wait <= engine.config.sync_delay_cap {
        sleep(wait).await;
        Ok(StepOutcome::next_from(graph, &node.id))
    } else {
        let resume_at = Utc::now()
            + ChronoDuration::from_std(wait).unwrap_or_else(|_| ChronoDuration::seconds(0));
        Ok(StepOutcome::Suspend { status: ExecutionStatus::Paused, resume_at: Some(resume_at) })
    }
}

async fn action(
    engine: &Engine,
    graph: &FlowGraph,
    execution: &mut Execution,
    node: &Node,
    cfg: &ActionConfig,
) -> Result<StepOutcome, EngineError> {
    match run_crm_action(engine, execution, cfg).await {
        Ok(detail) => log_step(engine, execution, node, "action_applied", detail).await?,
        Err(err) => {
            // Best-effort: CRM trouble must not block flow progression.
            warn!(node = %node.id, error = %err, "crm action failed, continuing");
            log_step(engine, execution, node, "action_failed", json!({ "error": err })).await?;
        }
    }
    Ok(StepOutcome::next_from(graph, &node.id))
}

async fn run_crm_action(
    engine: &Engine,
    execution: &mut Execution,
    cfg: &ActionConfig,
) -> Result<Value, String> {
    let lead_id = match &execution.lead_id {
        Some(id) => id.clone(),
        None => {
            let lead = engine
                .crm
                .find_lead_by_phone(&execution.tenant_id, &execution.contact.phone)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("no lead for phone {}", execution.contact.phone))?;
            execution.lead_id = Some(lead.id.clone());
            lead.id
        }
    };

    match cfg {
        ActionConfig::MoveLeadToStage { stage_id } => {
            engine
                .crm
                .move_lead_to_stage(&lead_id, stage_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "lead_id": lead_id, "stage_id": stage_id }))
        }
        ActionConfig::AddTag { tag } => {
            engine.crm.add_tag(&lead_id, tag).await.map_err(|e| e.to_string())?;
            Ok(json!({ "lead_id": lead_id, "added_tag": tag }))
        }
        ActionConfig::RemoveTag { tag } => {
            engine.crm.remove_tag(&lead_id, tag).await.map_err(|e| e.to_string())?;
            Ok(json!({ "lead_id": lead_id, "removed_tag": tag }))
        }
    }
}

const DEFAULT_TRANSFER_NOTICE: &str = "You will be connected to a human agent shortly.";

async fn transfer(
    engine: &Engine,
    execution: &mut Execution,
    node: &Node,
    cfg: &TransferConfig,
) -> Result<StepOutcome, EngineError> {
    let vars = execution.template_vars();
    let notice = render(cfg.notice.as_deref().unwrap_or(DEFAULT_TRANSFER_NOTICE), &vars);
    if let Err(err) = engine.gateway.send_text(&execution.contact, &notice).await {
        warn!(node = %node.id, %err, "hand-off notice send failed");
    }

    execution.human_takeover = true;
    engine
        .store
        .block_auto_trigger(&execution.tenant_id, &execution.contact.id)
        .await?;
    log_step(engine, execution, node, "transferred", json!({})).await?;
    Ok(StepOutcome::Finish(ExecutionStatus::Completed))
}

async fn log_step(
    engine: &Engine,
    execution: &Execution,
    node: &Node,
    action: &str,
    detail: Value,
) -> Result<(), EngineError> {
    engine
        .store
        .append_log(ExecutionLogEntry::new(
            &execution.id,
            Some(&node.id),
            node.kind.name(),
            action,
            detail,
        ))
        .await?;
    Ok(())
}

/// Resolves a free-text reply against a numbered option list: a 1-based index
/// first, then a case-insensitive substring match in either direction.
pub(crate) fn match_option(cfg: &QuestionConfig, reply: &str) -> Option<usize> {
    let trimmed = reply.trim();
    if let Ok(n) = trimmed.parse::<usize>() {
        if (1..=cfg.options.len()).contains(&n) {
            return Some(n - 1);
        }
    }
    let needle = trimmed.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    cfg.options.iter().position(|opt| {
        let label = opt.label.to_lowercase();
        label.contains(&needle) || needle.contains(&label)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::graph::QuestionOption;

    fn question(labels: &[&str]) -> QuestionConfig {
        QuestionConfig {
            text: "Pick one".into(),
            options: labels.iter().map(|l| QuestionOption { label: l.to_string() }).collect(),
        }
    }

    #[test]
    fn test_match_option_by_index() {
        let q = question(&["Sales", "Support", "Billing", "Cancel", "Other"]);
        assert_eq!(match_option(&q, "3"), Some(2));
        assert_eq!(match_option(&q, " 1 "), Some(0));
        assert_eq!(match_option(&q, "0"), None);
        assert_eq!(match_option(&q, "6"), None);
    }

    #[test]
    fn test_match_option_by_label_substring() {
        let q = question(&["Sales", "Support", "Billing", "Cancel", "Other"]);
        assert_eq!(match_option(&q, "billing"), Some(2));
        assert_eq!(match_option(&q, "BILLING"), Some(2));
        // reply containing the label also matches
        assert_eq!(match_option(&q, "I want support please"), Some(1));
        assert_eq!(match_option(&q, "refund"), None);
        assert_eq!(match_option(&q, "   "), None);
    }

    #[test]
    fn test_numbered_prompt_layout() {
        let q = question(&["A", "B"]);
        let prompt = numbered_prompt("Pick one", &q);
        assert_eq!(prompt, "Pick one\n1 - A\n2 - B");
    }
}
