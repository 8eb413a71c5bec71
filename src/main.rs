use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use zapflow::config::EngineConfig;
use zapflow::contact::{Contact, InboundReply, InboundTrigger};
use zapflow::crm::{InMemoryCrm, Lead};
use zapflow::engine::{Engine, TriggerOutcome};
use zapflow::execution::{ExecutionStore, InMemoryExecutionStore};
use zapflow::flow::graph::MediaAttachment;
use zapflow::flow::store::InMemoryFlowStore;
use zapflow::gateway::{Choice, GatewayError, MessagingGateway};
use zapflow::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "zapflow", about = "Conversation flow automation engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a flow definition file without running it
    Validate {
        file: PathBuf,
    },
    /// Load a flow file and chat with it on stdin
    Chat {
        file: PathBuf,
        /// Tenant the flow belongs to (must match the file)
        #[arg(long, default_value = "demo")]
        tenant: String,
        /// Phone number to impersonate
        #[arg(long, default_value = "5511999998888")]
        phone: String,
        /// Contact display name for {{contact_name}} substitution
        #[arg(long, default_value = "Contact")]
        contact_name: String,
        /// Operator display name for {{operator_name}} substitution
        #[arg(long)]
        operator: Option<String>,
        /// Log level when RUST_LOG is unset
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

/// Gateway that prints outbound traffic to the terminal.
#[derive(Debug)]
struct ConsoleGateway;

#[async_trait]
impl MessagingGateway for ConsoleGateway {
    async fn send_text(&self, _to: &Contact, text: &str) -> Result<(), GatewayError> {
        println!("<< {}", text);
        Ok(())
    }

    async fn send_media(
        &self,
        _to: &Contact,
        media: &MediaAttachment,
        caption: Option<&str>,
    ) -> Result<(), GatewayError> {
        println!("<< [{:?}] {} {}", media.kind, media.url, caption.unwrap_or_default());
        Ok(())
    }

    async fn send_choice_prompt(
        &self,
        _to: &Contact,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), GatewayError> {
        println!("<< {}", text);
        for choice in choices {
            println!("   [{}] {}", choice.id, choice.label);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let flows = InMemoryFlowStore::new();
            let id = flows
                .load_from_file(&file)
                .with_context(|| format!("invalid flow file {}", file.display()))?;
            println!("ok: flow `{}`", id);
            Ok(())
        }
        Commands::Chat { file, tenant, phone, contact_name, operator, log_level } => {
            init_tracing(&log_level);
            chat(file, tenant, phone, contact_name, operator).await
        }
    }
}

async fn chat(
    file: PathBuf,
    tenant: String,
    phone: String,
    contact_name: String,
    operator: Option<String>,
) -> anyhow::Result<()> {
    let flows = Arc::new(InMemoryFlowStore::new());
    let flow_id = flows.load_from_file(&file)?;
    info!(flow = %flow_id, "flow loaded");

    let store = Arc::new(InMemoryExecutionStore::new());
    let crm = Arc::new(InMemoryCrm::new());
    crm.add_lead(Lead {
        id: "demo-lead".into(),
        tenant_id: tenant.clone(),
        phone: phone.clone(),
        created_at: Utc::now(),
    });

    let engine = Engine::new(
        flows,
        store.clone(),
        Arc::new(ConsoleGateway),
        crm,
        EngineConfig::from_env(),
    );

    let contact = Contact::new("demo-contact", phone, Some(contact_name));
    println!("chatting with `{}`: type a message, `/pick <choice-id>`, or ctrl-d to quit", flow_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        // Run any delay timers that came due while we were waiting for input;
        // in production an external poller does this.
        for due in store.find_due_resumes(Utc::now()).await? {
            engine.resume(&due.id, &InboundReply::timer()).await?;
        }

        let reply = match line.strip_prefix("/pick ") {
            Some(choice) => InboundReply::choice(choice.trim()),
            None => InboundReply::text(&line),
        };

        // Route the way the channel-connection manager would: a live
        // execution gets the reply, otherwise the message is a fresh trigger.
        if let Some(live) = store.find_live_by_contact(&tenant, &contact.id).await? {
            engine.resume(&live.id, &reply).await?;
        } else {
            let trigger = InboundTrigger {
                tenant_id: tenant.clone(),
                contact: contact.clone(),
                text: line,
                operator_name: operator.clone(),
            };
            match engine.start_or_route(&trigger).await? {
                TriggerOutcome::Started { flow_id, .. } => info!(flow = %flow_id, "started"),
                TriggerOutcome::Skipped => info!("skipped: live execution exists"),
                TriggerOutcome::NoFlow => println!("-- no flow matched --"),
                TriggerOutcome::Blocked => println!("-- contact handed off to a human --"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        super::Cli::command().debug_assert();
    }
}
