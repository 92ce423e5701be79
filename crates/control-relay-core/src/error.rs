//! Error taxonomy shared by every layer of the relay.

use thiserror::Error;

/// Rejection of an agent's declared schema.
///
/// Any of these fails the whole `intro`; elements are never partially accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("elements must be a list")]
    NotAList,
    #[error("element {index} is not an object")]
    NotAnObject { index: usize },
    #[error("element {index} has unknown type {kind:?}")]
    UnknownType { index: usize, kind: String },
    #[error("element {index} is missing field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("element {index} field `{field}` is not a string")]
    NotAString { index: usize, field: &'static str },
    #[error("element {index} field `{field}` is not numeric")]
    NotNumeric { index: usize, field: &'static str },
    #[error("element {index} has an empty name")]
    EmptyName { index: usize },
    #[error("element {index} has a negative step")]
    NegativeStep { index: usize },
    #[error("duplicate element name {0:?}")]
    DuplicateName(String),
    #[error("intro is missing a label")]
    MissingLabel,
    #[error("intro is missing elements")]
    MissingElements,
    #[error("declared id must be a non-empty string")]
    InvalidId,
}

/// Errors raised while handling a single connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Channel-level failure; only ever leads to the channel closing.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed `intro` payload.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    /// Wrong admin secret.
    #[error("admin authentication failed")]
    Auth,
    /// An admin command targeted an id with no live agent.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    /// Non-JSON frame or missing fields on an active session.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl RelayError {
    /// Whether this error must tear the channel down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Schema(_))
    }
}
