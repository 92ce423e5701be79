//! Registry of live agent and admin sessions.
//!
//! Both maps sit behind one lock, and every broadcast an operation causes is
//! queued while that lock is held. Admins therefore see events in exactly the
//! order the registry applied them; an admin never gets `agent-upd` for an
//! agent before its `agent-on`.

use control_relay_core::{CloseReason, ConnId, Peer, RelayError, ServerMessage};
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{AdminSession, AgentSession};

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent not found: {0}")]
    UnknownAgent(String),
    #[error("Agent {id} has no slider named {name:?}")]
    UnknownSlider { id: String, name: String },
    #[error("Connection {conn} no longer owns agent {id}")]
    Superseded { id: String, conn: ConnId },
}

impl From<RegistryError> for RelayError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownAgent(id) => Self::UnknownAgent(id),
            other @ RegistryError::UnknownSlider { .. } => Self::Malformed(other.to_string()),
            other @ RegistryError::Superseded { .. } => Self::Transport(other.to_string()),
        }
    }
}

/// How an agent session entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// New id; admins were sent `agent-on`.
    Registered,
    /// The id was taken; the previous connection was retired.
    Replaced { previous: ConnId },
}

#[derive(Default)]
struct Inner {
    agents: IndexMap<String, AgentSession>,
    admins: IndexMap<String, AdminSession>,
}

impl Inner {
    fn broadcast(&self, msg: &ServerMessage) -> usize {
        let delivered = self
            .admins
            .values()
            .filter(|admin| admin.peer.send(msg.clone()))
            .count();
        if delivered < self.admins.len() {
            tracing::debug!(
                kind = msg.kind(),
                delivered,
                admins = self.admins.len(),
                "broadcast skipped some admins"
            );
        }
        delivered
    }

    fn owned_agent_mut(
        &mut self,
        id: &str,
        conn: ConnId,
    ) -> Result<&mut AgentSession, RegistryError> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_owned()))?;
        if agent.conn() == conn {
            Ok(agent)
        } else {
            Err(RegistryError::Superseded {
                id: id.to_owned(),
                conn,
            })
        }
    }

    fn register_agent(&mut self, session: AgentSession) {
        let announcement = session.announcement();
        self.agents.insert(session.id.clone(), session);
        self.broadcast(&announcement);
    }

    /// Retire the current holder of `session.id` and install `session` in its
    /// place without an `agent-off`/`agent-on` pair.
    fn replace_agent(&mut self, session: AgentSession) -> Option<ConnId> {
        let previous = self.agents.get(&session.id)?.peer.clone();
        // Its connection task will find the id owned by another conn and stay quiet.
        previous.close(CloseReason::Replaced);

        let updates: Vec<_> = session.slider_updates().collect();
        for update in &updates {
            self.broadcast(update);
        }
        tracing::debug!(
            id = %session.id,
            previous = %previous.conn(),
            conn = %session.conn(),
            sliders = updates.len(),
            "agent session replaced"
        );
        self.agents.insert(session.id.clone(), session);
        Some(previous.conn())
    }
}

/// Concurrent registry of live sessions.
///
/// The only place the agent and admin maps are touched.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated admin.
    ///
    /// Queues `auth {success: true}` followed by one `agent-on` per live agent,
    /// so the admin's view starts consistent. Returns the number of agents sent.
    pub async fn register_admin(&self, session: AdminSession) -> usize {
        let mut inner = self.inner.write().await;
        session.peer.send(ServerMessage::Auth { success: true });
        for agent in inner.agents.values() {
            session.peer.send(agent.announcement());
        }
        let count = inner.agents.len();
        inner.admins.insert(session.id.clone(), session);
        count
    }

    /// Remove an admin if `conn` still owns `id`.
    pub async fn remove_admin(&self, id: &str, conn: ConnId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.admins.get(id).is_some_and(|admin| admin.conn() == conn) {
            inner.admins.shift_remove(id);
            true
        } else {
            tracing::debug!(%conn, %id, "admin not registered under this connection");
            false
        }
    }

    /// Insert an introduced agent, replacing any stale session under the same id.
    pub async fn install_agent(&self, session: AgentSession) -> Installed {
        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(&session.id) {
            if let Some(previous) = inner.replace_agent(session) {
                return Installed::Replaced { previous };
            }
            return Installed::Registered;
        }
        inner.register_agent(session);
        Installed::Registered
    }

    /// Remove an agent if `conn` still owns `id`, broadcasting `agent-off`.
    ///
    /// Returns `false` when the id is gone or owned by a newer connection, so a
    /// retired or twice-closed connection never produces a second `agent-off`.
    pub async fn remove_agent(&self, id: &str, conn: ConnId) -> bool {
        let mut inner = self.inner.write().await;
        if let Err(e) = inner.owned_agent_mut(id, conn) {
            tracing::debug!(%conn, "agent left registry untouched: {e}");
            return false;
        }
        inner.agents.shift_remove(id);
        inner.broadcast(&ServerMessage::AgentOff { id: id.to_owned() });
        true
    }

    /// Peers of all admins at this instant.
    pub async fn snapshot_admins(&self) -> Vec<Peer> {
        self.inner
            .read()
            .await
            .admins
            .values()
            .map(|admin| admin.peer.clone())
            .collect()
    }

    /// Channel currently representing agent `id`.
    pub async fn lookup_agent(&self, id: &str) -> Option<Peer> {
        self.inner
            .read()
            .await
            .agents
            .get(id)
            .map(|agent| agent.peer.clone())
    }

    /// Queue `msg` for agent `id`.
    ///
    /// # Errors
    /// Returns `UnknownAgent` if no agent is registered under `id`.
    pub async fn forward_to_agent(&self, id: &str, msg: ServerMessage) -> Result<bool, RegistryError> {
        let inner = self.inner.read().await;
        let agent = inner
            .agents
            .get(id)
            .ok_or_else(|| RegistryError::UnknownAgent(id.to_owned()))?;
        Ok(agent.peer.send(msg))
    }

    /// Broadcast an agent-originated event, if `conn` still owns `id`.
    ///
    /// # Errors
    /// Returns an error if the agent is gone or was superseded.
    pub async fn publish(&self, id: &str, conn: ConnId, msg: ServerMessage) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write().await;
        inner.owned_agent_mut(id, conn)?;
        Ok(inner.broadcast(&msg))
    }

    /// Record a slider's new value and broadcast `agent-upd`.
    ///
    /// # Errors
    /// Returns an error if the agent is gone, was superseded, or has no such slider.
    pub async fn update_slider(
        &self,
        id: &str,
        conn: ConnId,
        name: &str,
        val: f64,
        ts: Option<Value>,
    ) -> Result<usize, RegistryError> {
        let mut inner = self.inner.write().await;
        let agent = inner.owned_agent_mut(id, conn)?;
        if !agent.set_slider(name, val) {
            return Err(RegistryError::UnknownSlider {
                id: id.to_owned(),
                name: name.to_owned(),
            });
        }
        Ok(inner.broadcast(&ServerMessage::AgentUpd {
            id: id.to_owned(),
            ts,
            name: name.to_owned(),
            val,
        }))
    }

    /// Number of registered agents.
    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    /// Number of registered admins.
    pub async fn admin_count(&self) -> usize {
        self.inner.read().await.admins.len()
    }
}
