use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contact::Contact;
use crate::flow::graph::MediaAttachment;

/// One entry of a structured choice prompt; `id` doubles as the branch handle
/// (`option-N`) the channel echoes back when the contact taps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Choice {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("channel disconnected: {0}")]
    Disconnected(String),
    #[error("send rejected: {0}")]
    Rejected(String),
}

/// Outbound side of the chat channel. Every call reports success or failure;
/// the engine logs failures and moves on, it never retries.
#[async_trait]
pub trait MessagingGateway: Send + Sync + Debug {
    async fn send_text(&self, to: &Contact, text: &str) -> Result<(), GatewayError>;

    async fn send_media(
        &self,
        to: &Contact,
        media: &MediaAttachment,
        caption: Option<&str>,
    ) -> Result<(), GatewayError>;

    /// Sends the channel's native selection UI (small fixed option sets only).
    async fn send_choice_prompt(
        &self,
        to: &Contact,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), GatewayError>;
}

/// What a `RecordingGateway` captured, in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text { to: String, text: String },
    Media { to: String, url: String, caption: Option<String> },
    ChoicePrompt { to: String, text: String, choices: Vec<Choice> },
}

/// In-process gateway double used by tests and available to embedders; records
/// every outbound message and can be flipped into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<Outbound>>,
    fail_sends: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every send reports `GatewayError::Disconnected` (after still
    /// recording the attempt, so tests can assert on it).
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn record(&self, out: Outbound) -> Result<(), GatewayError> {
        self.sent.lock().unwrap().push(out);
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(GatewayError::Disconnected("recording gateway set to fail".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send_text(&self, to: &Contact, text: &str) -> Result<(), GatewayError> {
        self.record(Outbound::Text { to: to.id.clone(), text: text.to_string() })
    }

    async fn send_media(
        &self,
        to: &Contact,
        media: &MediaAttachment,
        caption: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.record(Outbound::Media {
            to: to.id.clone(),
            url: media.url.clone(),
            caption: caption.map(str::to_string),
        })
    }

    async fn send_choice_prompt(
        &self,
        to: &Contact,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), GatewayError> {
        self.record(Outbound::ChoicePrompt {
            to: to.id.clone(),
            text: text.to_string(),
            choices: choices.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact::new("c1", "5511999998888", Some("Maria".into()))
    }

    #[tokio::test]
    async fn test_recording_gateway_captures_order() {
        let gw = RecordingGateway::new();
        gw.send_text(&contact(), "first").await.unwrap();
        gw.send_choice_prompt(
            &contact(),
            "pick one",
            &[Choice { id: "option-1".into(), label: "Yes".into() }],
        )
        .await
        .unwrap();

        let sent = gw.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Outbound::Text { text, .. } if text == "first"));
        assert!(matches!(&sent[1], Outbound::ChoicePrompt { choices, .. } if choices.len() == 1));
    }

    #[tokio::test]
    async fn test_failing_mode_still_records() {
        let gw = RecordingGateway::new();
        gw.set_failing(true);
        let err = gw.send_text(&contact(), "oops").await;
        assert!(err.is_err());
        assert_eq!(gw.sent().len(), 1);
    }
}
