use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Audio (or other) payload attached to a user message, base64 encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Attachment {
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl Attachment {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Messages exchanged between the coordinating process and a tab's UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BrowserMessage {
    /// UI listener became ready (or went away) for its tab.
    #[serde(rename_all = "camelCase")]
    ActiveTabListener { active: bool },

    #[serde(rename_all = "camelCase")]
    ActivateAgent { agent_id: String, url: String },

    DeactivateAgent,

    #[serde(rename_all = "camelCase")]
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<Attachment>,
    },

    #[serde(rename_all = "camelCase")]
    AgentActivated {
        agent_id: String,
        agent_name: String,
        agent_logo: String,
    },

    #[serde(rename_all = "camelCase")]
    AgentMessage {
        text: String,
        is_complete: bool,
        is_success: bool,
    },

    #[serde(rename_all = "camelCase")]
    InteractionSummary {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ActivationFailed {
        agent_name: String,
        contact_email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "activeTabListener",
    "activateAgent",
    "deactivateAgent",
    "userMessage",
    "agentActivated",
    "agentMessage",
    "interactionSummary",
    "activationFailed",
];

impl BrowserMessage {
    /// Decode by the `type` discriminant; unknown discriminants are rejected.
    pub fn from_json(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(Error::UnknownMessageType(kind));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn incomplete(text: &str) -> Self {
        BrowserMessage::AgentMessage {
            text: text.to_string(),
            is_complete: false,
            is_success: true,
        }
    }

    pub fn complete(text: &str) -> Self {
        BrowserMessage::AgentMessage {
            text: text.to_string(),
            is_complete: true,
            is_success: true,
        }
    }

    pub fn failure(detail: Option<&str>) -> Self {
        BrowserMessage::AgentMessage {
            text: detail.unwrap_or_default().to_string(),
            is_complete: true,
            is_success: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrowserMessage::ActiveTabListener { .. } => "activeTabListener",
            BrowserMessage::ActivateAgent { .. } => "activateAgent",
            BrowserMessage::DeactivateAgent => "deactivateAgent",
            BrowserMessage::UserMessage { .. } => "userMessage",
            BrowserMessage::AgentActivated { .. } => "agentActivated",
            BrowserMessage::AgentMessage { .. } => "agentMessage",
            BrowserMessage::InteractionSummary { .. } => "interactionSummary",
            BrowserMessage::ActivationFailed { .. } => "activationFailed",
        }
    }
}
