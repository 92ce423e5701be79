//! Session registry for the control relay.
//!
//! Provides:
//! - `AgentSession` / `AdminSession` - Live, introduced connections
//! - `Registry` - The single owner of "who is connected"

pub mod registry;
pub mod session;

pub use registry::{Installed, Registry, RegistryError};
pub use session::{AdminSession, AgentSession};
