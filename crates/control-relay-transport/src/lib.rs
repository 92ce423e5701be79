//! Connection handling for the control relay.
//!
//! Provides:
//! - Inbound wire protocol (JSON, `type`-tagged)
//! - Handshake state machine classifying a connection as admin or agent
//! - `Broker` - the routing engine driving one connection at a time
//! - WebSocket transport (feature: websocket)

pub mod broker;
pub mod handshake;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use broker::{Broker, BrokerConfig};
pub use handshake::{AdminSecret, AgentIntro, Handshake, HandshakeState, Role};
pub use protocol::{Intro, PeerMessage, ServerMessage};
