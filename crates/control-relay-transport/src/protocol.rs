//! Wire protocol for peer-to-broker messages.
//!
//! Frames are JSON objects with a `type` discriminator. Unknown types decode to
//! [`PeerMessage::Unknown`] and are ignored by the broker rather than treated as
//! errors.

use control_relay_core::RelayError;
pub use control_relay_core::ServerMessage;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Handshake payload.
///
/// Fields stay untyped here; the handshake validates them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Intro {
    /// Admin secret. Its presence makes this an admin intro, even when `null`.
    #[serde(default, deserialize_with = "present")]
    pub auth: Option<Value>,
    /// Preferred persistent agent id.
    #[serde(default)]
    pub id: Option<Value>,
    /// Agent display label.
    #[serde(default, alias = "disp")]
    pub label: Option<Value>,
    /// Agent element descriptions.
    #[serde(default)]
    pub elements: Option<Value>,
}

/// Message from a peer (admin or agent) to the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    /// Handshake.
    Intro(Intro),
    /// Admin: trigger action `name` on agent `id`.
    Act {
        id: String,
        #[serde(default)]
        ts: Option<Value>,
        #[serde(alias = "action")]
        name: String,
    },
    /// Admin: set slider `name` on agent `id`.
    Set {
        id: String,
        #[serde(default)]
        ts: Option<Value>,
        #[serde(alias = "key")]
        name: String,
        val: Value,
    },
    /// Agent: a slider has a new value.
    Upd {
        #[serde(default)]
        ts: Option<Value>,
        #[serde(alias = "key")]
        name: String,
        val: Value,
    },
    /// Agent: an action completed.
    Done {
        #[serde(default)]
        ts: Option<Value>,
        #[serde(alias = "action")]
        name: String,
    },
    /// Any other `type`.
    #[serde(other)]
    Unknown,
}

/// An explicit `null` stays `Some(Value::Null)`; only a missing field is `None`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Whether `text` is a JSON object typed `intro`, even if the rest of it does not decode.
#[must_use]
pub fn is_intro_frame(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .is_ok_and(|frame| frame.get("type").and_then(Value::as_str) == Some("intro"))
}

impl PeerMessage {
    /// Decode one text frame.
    ///
    /// # Errors
    /// Returns `RelayError::Malformed` for non-JSON input, a missing `type`, or a
    /// known type with missing fields.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(text)?)
    }
}
