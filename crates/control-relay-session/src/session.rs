//! Introduced connections.

use control_relay_core::{ConnId, Element, Peer, ServerMessage};
use serde_json::Value;

/// A connection that completed the agent handshake.
#[derive(Debug)]
pub struct AgentSession {
    /// Logical agent id (broker-assigned or declared).
    pub id: String,
    /// Display label.
    pub label: String,
    /// Elements in declaration order; slider values are the current-state cache.
    pub elements: Vec<Element>,
    /// Channel currently representing this id.
    pub peer: Peer,
}

impl AgentSession {
    /// Create a new agent session.
    #[must_use]
    pub fn new(id: String, label: String, elements: Vec<Element>, peer: Peer) -> Self {
        Self {
            id,
            label,
            elements,
            peer,
        }
    }

    /// Connection backing this session.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.peer.conn()
    }

    /// `agent-on` announcement with the current element state.
    #[must_use]
    pub fn announcement(&self) -> ServerMessage {
        ServerMessage::AgentOn {
            id: self.id.clone(),
            label: self.label.clone(),
            elements: self.elements.clone(),
        }
    }

    /// One `agent-upd` per slider, carrying its current value.
    pub fn slider_updates(&self) -> impl Iterator<Item = ServerMessage> + '_ {
        self.elements.iter().filter_map(|el| {
            el.slider_value().map(|val| ServerMessage::AgentUpd {
                id: self.id.clone(),
                ts: Some(Value::String(String::new())),
                name: el.name().to_owned(),
                val,
            })
        })
    }

    /// Update the cached value of the slider called `name`.
    ///
    /// Returns `false` if there is no slider with that name.
    pub fn set_slider(&mut self, name: &str, val: f64) -> bool {
        self.elements
            .iter_mut()
            .find(|el| el.name() == name)
            .is_some_and(|el| el.set_value(val))
    }
}

/// A connection that authenticated as admin.
#[derive(Debug)]
pub struct AdminSession {
    /// Broker-assigned id.
    pub id: String,
    /// Admin's channel.
    pub peer: Peer,
}

impl AdminSession {
    /// Create a new admin session.
    #[must_use]
    pub const fn new(id: String, peer: Peer) -> Self {
        Self { id, peer }
    }

    /// Connection backing this session.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.peer.conn()
    }
}
