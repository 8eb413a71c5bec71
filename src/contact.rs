use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A person on the other end of the chat channel. `id` is the channel-level
/// identity (what the gateway addresses); `phone` is what the CRM matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Contact {
    pub id: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Contact {
    pub fn new(
        id: impl Into<String>,
        phone: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self { id: id.into(), phone: phone.into(), name }
    }
}

/// An inbound message from a contact with no live execution. Carries the
/// display name of the account operator so greetings can be personalized.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InboundTrigger {
    pub tenant_id: String,
    pub contact: Contact,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
}

/// What arrived for a suspended execution. A channel button tap sets
/// `choice_id` (and usually echoes the label into `text`); free text sets only
/// `text`; a due-delay timer sets neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct InboundReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice_id: Option<String>,
}

impl InboundReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), choice_id: None }
    }

    pub fn choice(choice_id: impl Into<String>) -> Self {
        Self { text: None, choice_id: Some(choice_id.into()) }
    }

    /// Timer wake-up for a scheduled-delay resume; no contact input at all.
    pub fn timer() -> Self {
        Self::default()
    }
}
