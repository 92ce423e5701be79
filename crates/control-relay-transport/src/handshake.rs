//! Per-connection handshake.
//!
//! ```text
//! Connecting --open--> AwaitingIntro --intro(auth ok)--> AuthenticatedAdmin
//!                           |  ^  \---intro(elements)--> ActiveAgent
//!                           |  |
//!                           |  +-- intro(auth wrong): reply, disarm deadline, stay
//!                           +--deadline / bad schema--> Closed
//! ```
//!
//! The state machine is pure: it decides, the broker performs the I/O.

use std::{fmt, time::Duration};

use control_relay_core::{Element, RelayError, SchemaError, ServerMessage, parse_elements};
use serde_json::Value;
use tokio::time::Instant;

use crate::protocol::Intro;

/// Admin secret, compared in constant time.
#[derive(Clone)]
pub struct AdminSecret(String);

impl AdminSecret {
    /// Wrap the configured secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Check a candidate taken from an `intro.auth` field.
    ///
    /// Non-string candidates never match.
    #[must_use]
    pub fn verify(&self, candidate: &Value) -> bool {
        candidate
            .as_str()
            .is_some_and(|c| constant_time_eq(c.as_bytes(), self.0.as_bytes()))
    }
}

impl fmt::Debug for AdminSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminSecret(..)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Channel open, id not yet sent.
    Connecting,
    /// Id sent, waiting for `intro`.
    AwaitingIntro,
    /// Admin secret accepted.
    AuthenticatedAdmin,
    /// Agent schema accepted.
    ActiveAgent,
    /// Timed out, rejected, or closed by the peer.
    Closed,
}

/// A validated agent introduction.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentIntro {
    /// Declared id, or the broker-assigned one.
    pub id: String,
    /// Whether `id` was declared by the agent.
    pub declared: bool,
    /// Display label.
    pub label: String,
    /// Elements in declaration order.
    pub elements: Vec<Element>,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// Authenticated admin; keeps the assigned id.
    Admin { id: String },
    /// Introduced agent.
    Agent(AgentIntro),
}

/// Handshake for one connection.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    assigned_id: String,
    deadline: Option<Instant>,
}

impl Handshake {
    /// Start a handshake for a freshly opened channel.
    #[must_use]
    pub fn new(assigned_id: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::Connecting,
            assigned_id: assigned_id.into(),
            deadline: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Broker-assigned id.
    #[must_use]
    pub fn assigned_id(&self) -> &str {
        &self.assigned_id
    }

    /// Deadline for `intro`, while one is armed.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Move to `AwaitingIntro` and arm the intro deadline.
    ///
    /// Returns the `id` message to send to the peer.
    pub fn open(&mut self, grace: Duration) -> ServerMessage {
        if self.state == HandshakeState::Connecting {
            self.state = HandshakeState::AwaitingIntro;
            self.deadline = Some(Instant::now() + grace);
        }
        ServerMessage::Id {
            id: self.assigned_id.clone(),
        }
    }

    /// Apply an `intro`.
    ///
    /// A wrong admin secret leaves the handshake in `AwaitingIntro` but disarms
    /// the deadline, since an intro did arrive. It is never re-armed.
    ///
    /// # Errors
    /// - `RelayError::Auth` on a wrong admin secret (the peer may retry)
    /// - `RelayError::Schema` on an invalid agent intro (the handshake is closed)
    /// - `RelayError::Malformed` if the handshake is not awaiting an intro
    pub fn on_intro(&mut self, intro: Intro, secret: &AdminSecret) -> Result<Role, RelayError> {
        if self.state != HandshakeState::AwaitingIntro {
            return Err(RelayError::Malformed(format!(
                "unexpected intro in state {:?}",
                self.state
            )));
        }

        if let Some(auth) = intro.auth {
            if !secret.verify(&auth) {
                self.deadline = None;
                return Err(RelayError::Auth);
            }
            self.finish(HandshakeState::AuthenticatedAdmin);
            return Ok(Role::Admin {
                id: self.assigned_id.clone(),
            });
        }

        match self.agent_intro(intro) {
            Ok(agent) => {
                self.finish(HandshakeState::ActiveAgent);
                Ok(Role::Agent(agent))
            }
            Err(e) => {
                self.finish(HandshakeState::Closed);
                Err(e.into())
            }
        }
    }

    fn agent_intro(&self, intro: Intro) -> Result<AgentIntro, SchemaError> {
        let label = match intro.label {
            Some(Value::String(label)) => label,
            _ => return Err(SchemaError::MissingLabel),
        };
        let elements = parse_elements(&intro.elements.ok_or(SchemaError::MissingElements)?)?;

        let (id, declared) = match intro.id {
            None => (self.assigned_id.clone(), false),
            Some(Value::String(id)) if !id.is_empty() => (id, true),
            Some(_) => return Err(SchemaError::InvalidId),
        };

        Ok(AgentIntro {
            id,
            declared,
            label,
            elements,
        })
    }

    /// The intro deadline passed.
    ///
    /// Returns `true` if this closed the handshake. A disarmed deadline never
    /// expires.
    pub fn expire(&mut self) -> bool {
        if self.state == HandshakeState::AwaitingIntro && self.deadline.is_some() {
            self.finish(HandshakeState::Closed);
            true
        } else {
            false
        }
    }

    /// The channel went away.
    pub fn close(&mut self) {
        self.finish(HandshakeState::Closed);
    }

    fn finish(&mut self, state: HandshakeState) {
        self.state = state;
        self.deadline = None;
    }
}
