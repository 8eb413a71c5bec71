use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::contact::InboundReply;
use crate::engine::executors::{self, MAX_STRUCTURED_OPTIONS, match_option};
use crate::engine::{Engine, EngineError, interpreter};
use crate::execution::{Execution, ExecutionLogEntry, ExecutionStatus};
use crate::flow::graph::{NodeKind, QuestionConfig, option_handle};

/// Outcome of re-entering a suspended execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The event was processed: the execution advanced, re-prompted, or
    /// deliberately ignored unusable input and stayed suspended.
    Continued,
    /// The staleness guard fired; the execution is now `failed` and the
    /// contact's slot is free again.
    ForceFailed,
    /// The execution was already terminal; nothing to do.
    AlreadyFinished,
}

/// What the current node's resume semantics decided.
enum ResumeStep {
    /// No actionable branch; leave the execution untouched (modulo the
    /// recorded inbound text).
    Stay,
    /// Advance to this node; `None` means the graph ends here.
    Advance(Option<String>),
}

impl Engine {
    /// Entry point for a later event on a suspended execution: an inbound
    /// message (free text or a structured choice id) or a fired delay timer.
    /// Rehydrates the (status, current node, context) triple and re-enters the
    /// interpreter with the same cap and logging discipline.
    #[tracing::instrument(skip(self, reply), fields(execution = %execution_id))]
    pub async fn resume(
        &self,
        execution_id: &str,
        reply: &InboundReply,
    ) -> Result<ResumeOutcome, EngineError> {
        let Some(mut execution) = self.store.get(execution_id).await? else {
            return Err(EngineError::ExecutionNotFound(execution_id.to_string()));
        };

        if execution.status.is_terminal() {
            return Ok(ResumeOutcome::AlreadyFinished);
        }

        if let Some(reason) = self.staleness_of(&execution) {
            self.force_fail(execution, reason).await?;
            return Ok(ResumeOutcome::ForceFailed);
        }

        let Some(graph) = self.flows.graph(&execution.flow_id).await? else {
            // Flow deleted while the execution slept; fail it rather than
            // leaving the contact's slot occupied forever.
            self.force_fail(execution, "flow definition missing").await?;
            return Ok(ResumeOutcome::ForceFailed);
        };

        if let Some(text) = reply.text.as_deref() {
            execution.set_last_message(text);
        }

        let current_id = execution.current_node_id.clone();
        let step = match current_id.as_deref().and_then(|id| graph.node(id)) {
            Some(node) => match &node.kind {
                NodeKind::Question(cfg) => {
                    self.resume_question(&execution, &node.id, cfg, reply, &graph).await?
                }
                // Any inbound message resumes a pause, regardless of content.
                NodeKind::Pause => ResumeStep::Advance(
                    graph.default_next(&node.id).map(str::to_string),
                ),
                // Only a fired timer continues a long delay: a contentless
                // wake-up, or any event once the scheduled timestamp passed.
                // A contact messaging mid-delay must not cut the wait short;
                // the text is recorded and the execution keeps sleeping.
                NodeKind::Delay(_) => {
                    let contentless = reply.text.is_none() && reply.choice_id.is_none();
                    let due = execution.resume_at.is_some_and(|at| at <= Utc::now());
                    if contentless || due {
                        ResumeStep::Advance(graph.default_next(&node.id).map(str::to_string))
                    } else {
                        info!("inbound message during a scheduled delay, staying paused");
                        ResumeStep::Stay
                    }
                }
                other => {
                    warn!(kind = other.name(), "node defines no resume semantics, ignoring event");
                    ResumeStep::Stay
                }
            },
            None => {
                self.force_fail(execution, "current node missing").await?;
                return Ok(ResumeOutcome::ForceFailed);
            }
        };

        match step {
            ResumeStep::Stay => {
                // Persist the recorded inbound text; status and position are
                // deliberately untouched.
                execution.touch();
                self.store.update(&execution).await?;
                Ok(ResumeOutcome::Continued)
            }
            ResumeStep::Advance(next) => {
                info!(next = next.as_deref().unwrap_or("<end>"), "resuming execution");
                self.store
                    .append_log(ExecutionLogEntry::new(
                        &execution.id,
                        current_id.as_deref(),
                        "resume",
                        "resumed",
                        json!({ "choice_id": reply.choice_id, "has_text": reply.text.is_some() }),
                    ))
                    .await?;
                execution.status = ExecutionStatus::Running;
                execution.resume_at = None;
                interpreter::run(self, &graph, &mut execution, next).await?;
                Ok(ResumeOutcome::Continued)
            }
        }
    }

    /// A `running` execution past the short bound means a step crashed; a
    /// suspended one past the long bound was abandoned by the contact. Either
    /// way it must not block future automation for that contact.
    pub(crate) fn staleness_of(&self, execution: &Execution) -> Option<&'static str> {
        let age = (Utc::now() - execution.updated_at)
            .to_std()
            .unwrap_or_default();
        match execution.status {
            ExecutionStatus::Running if age > self.config.running_stale_after => {
                Some("running past short staleness bound")
            }
            ExecutionStatus::WaitingResponse | ExecutionStatus::Paused
                if age > self.config.suspended_stale_after =>
            {
                Some("suspended past long staleness bound")
            }
            _ => None,
        }
    }

    async fn resume_question(
        &self,
        execution: &Execution,
        node_id: &str,
        cfg: &QuestionConfig,
        reply: &InboundReply,
        graph: &crate::flow::FlowGraph,
    ) -> Result<ResumeStep, EngineError> {
        // Structured choice ids map straight onto edge handles.
        if let Some(choice_id) = reply.choice_id.as_deref() {
            return Ok(match graph.next(node_id, Some(choice_id)) {
                Some(next) => ResumeStep::Advance(Some(next.to_string())),
                None => {
                    warn!(choice_id, "structured choice has no matching edge, staying suspended");
                    ResumeStep::Stay
                }
            });
        }

        if cfg.options.len() > MAX_STRUCTURED_OPTIONS {
            // Numbered prompt: accept an index or a label substring; on no
            // match, re-issue the prompt and remain suspended.
            let Some(text) = reply.text.as_deref() else {
                return Ok(ResumeStep::Stay);
            };
            return Ok(match match_option(cfg, text) {
                Some(index) => {
                    let handle = option_handle(index);
                    ResumeStep::Advance(
                        graph.next(node_id, Some(&handle)).map(str::to_string),
                    )
                }
                None => {
                    executors::send_question_prompt(self, execution, cfg).await;
                    self.store
                        .append_log(ExecutionLogEntry::new(
                            &execution.id,
                            Some(node_id),
                            "question",
                            "reprompted",
                            json!({}),
                        ))
                        .await?;
                    ResumeStep::Stay
                }
            });
        }

        // Small option sets used the channel's native selection UI: only a
        // structured choice id advances; ambiguous free text waits silently.
        Ok(ResumeStep::Stay)
    }
}
