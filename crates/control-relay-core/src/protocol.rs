//! Messages the broker sends to peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Element;

/// Machine-readable code carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The targeted agent id is not connected.
    UnknownAgent,
}

/// Message from broker to a peer (admin or agent).
///
/// `ts` is an opaque correlation token supplied by the caller and echoed back
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Assigned or confirmed session id.
    Id { id: String },
    /// Result of admin authentication.
    Auth { success: bool },
    /// An agent is live.
    AgentOn {
        id: String,
        label: String,
        elements: Vec<Element>,
    },
    /// An agent disconnected.
    AgentOff { id: String },
    /// An agent's slider changed.
    AgentUpd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
        name: String,
        val: f64,
    },
    /// An agent completed an action.
    AgentDone {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
        name: String,
    },
    /// Forwarded action trigger.
    Act {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
        name: String,
    },
    /// Forwarded slider set.
    Set {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
        name: String,
        val: f64,
    },
    /// A command could not be carried out.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
}

impl ServerMessage {
    /// Wire discriminator, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Id { .. } => "id",
            Self::Auth { .. } => "auth",
            Self::AgentOn { .. } => "agent-on",
            Self::AgentOff { .. } => "agent-off",
            Self::AgentUpd { .. } => "agent-upd",
            Self::AgentDone { .. } => "agent-done",
            Self::Act { .. } => "act",
            Self::Set { .. } => "set",
            Self::Error { .. } => "error",
        }
    }

    /// Error event for a command aimed at an agent that is not connected.
    #[must_use]
    pub fn unknown_agent(id: impl Into<String>, ts: Option<Value>) -> Self {
        let id = id.into();
        Self::Error {
            code: ErrorCode::UnknownAgent,
            message: format!("no agent with id {id:?} is connected"),
            id: Some(id),
            ts,
        }
    }
}
