//! Core building blocks for the control relay.
//!
//! This crate provides:
//! - `Element` - Typed actions and sliders exposed by an agent
//! - `ServerMessage` - Everything the broker sends to a peer
//! - `Peer` - Buffered, closable outbound half of a connection
//! - `RelayError` / `SchemaError` - The error taxonomy

pub mod element;
pub mod error;
pub mod peer;
pub mod protocol;

pub use element::{Element, Step, coerce_number, parse_elements};
pub use error::{RelayError, SchemaError};
pub use peer::{CloseReason, CloseSignal, ConnId, Peer, PeerOutbox};
pub use protocol::{ErrorCode, ServerMessage};
