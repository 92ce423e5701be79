//! Routing engine.
//!
//! [`Broker::serve`] owns one connection from open to close: it runs the
//! handshake, registers the session, routes every inbound frame according to
//! the session's role, and unwinds registry membership on the way out.
//!
//! Errors local to one frame are logged (and, for unknown agents, reported to
//! the admin) but never end the connection. Only handshake failures and the
//! intro deadline close a channel.

use std::{sync::Arc, time::Duration};

use control_relay_core::{CloseReason, Peer, PeerOutbox, RelayError, ServerMessage, coerce_number};
use control_relay_session::{AdminSession, AgentSession, Installed, Registry, RegistryError};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    handshake::{AdminSecret, AgentIntro, Handshake, Role},
    protocol::{PeerMessage, is_intro_frame},
};

/// Default time a new connection has to send `intro`.
pub const DEFAULT_INTRO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-peer outbound buffer.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Secret an admin must present in `intro.auth`.
    pub admin_secret: String,
    /// Grace period for `intro`.
    pub intro_timeout: Duration,
    /// Messages buffered per peer before sends are dropped.
    pub outbox_capacity: usize,
}

impl BrokerConfig {
    /// Config with default timings.
    #[must_use]
    pub fn new(admin_secret: impl Into<String>) -> Self {
        Self {
            admin_secret: admin_secret.into(),
            intro_timeout: DEFAULT_INTRO_TIMEOUT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }

    /// Override the intro grace period.
    #[must_use]
    pub fn with_intro_timeout(mut self, timeout: Duration) -> Self {
        self.intro_timeout = timeout;
        self
    }

    /// Override the outbox capacity.
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }
}

/// The control relay broker. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Broker {
    registry: Arc<Registry>,
    secret: AdminSecret,
    intro_timeout: Duration,
    outbox_capacity: usize,
}

impl Broker {
    /// Create a broker with an empty registry.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            secret: AdminSecret::new(config.admin_secret),
            intro_timeout: config.intro_timeout,
            outbox_capacity: config.outbox_capacity,
        }
    }

    /// Shared session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Allocate the outbound channel for a new connection.
    #[must_use]
    pub fn open_peer(&self) -> (Peer, PeerOutbox) {
        Peer::channel(self.outbox_capacity)
    }

    /// Drive one connection until the peer goes away or the broker closes it.
    ///
    /// `inbound` yields the connection's text frames in arrival order and ends
    /// when the peer disconnects.
    pub async fn serve<S>(&self, peer: Peer, inbound: S)
    where
        S: Stream<Item = String> + Send,
    {
        let mut inbound = std::pin::pin!(inbound);
        let mut handshake = Handshake::new(Uuid::new_v4().to_string());
        peer.send(handshake.open(self.intro_timeout));
        info!(conn = %peer.conn(), id = handshake.assigned_id(), "peer connected");

        let Some(role) = self.negotiate(&mut handshake, &peer, &mut inbound).await else {
            return;
        };

        match role {
            Role::Admin { id } => self.run_admin(id, &peer, &mut inbound).await,
            Role::Agent(intro) => self.run_agent(intro, &peer, &mut inbound).await,
        }
    }

    async fn negotiate<S>(
        &self,
        handshake: &mut Handshake,
        peer: &Peer,
        inbound: &mut S,
    ) -> Option<Role>
    where
        S: Stream<Item = String> + Unpin,
    {
        let conn = peer.conn();
        let deadline = handshake.deadline()?;
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                () = peer.closed() => {
                    handshake.close();
                    return None;
                }
                () = &mut expiry, if handshake.deadline().is_some() => {
                    handshake.expire();
                    info!(%conn, "peer never introduced itself, disconnecting");
                    peer.close(CloseReason::IntroTimeout);
                    return None;
                }
                frame = inbound.next() => {
                    let Some(text) = frame else {
                        handshake.close();
                        debug!(%conn, "peer left before intro");
                        return None;
                    };
                    let intro = match PeerMessage::parse(&text) {
                        Ok(PeerMessage::Intro(intro)) => intro,
                        Ok(_) => {
                            debug!(%conn, "ignoring message before intro");
                            continue;
                        }
                        Err(e) if is_intro_frame(&text) => {
                            handshake.close();
                            warn!(%conn, error = %e, "rejecting unreadable intro");
                            peer.close(CloseReason::InvalidIntro(e.to_string()));
                            return None;
                        }
                        Err(e) => {
                            debug!(%conn, error = %e, "ignoring unreadable frame before intro");
                            continue;
                        }
                    };
                    match handshake.on_intro(intro, &self.secret) {
                        Ok(role) => return Some(role),
                        Err(RelayError::Auth) => {
                            // The intro arrived, so the deadline is off; the peer may retry.
                            warn!(%conn, "peer failed to authorize as administrator");
                            peer.send(ServerMessage::Auth { success: false });
                        }
                        Err(e) => {
                            warn!(%conn, error = %e, "rejecting intro");
                            peer.close(CloseReason::InvalidIntro(e.to_string()));
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn run_admin<S>(&self, id: String, peer: &Peer, inbound: &mut S)
    where
        S: Stream<Item = String> + Unpin,
    {
        let conn = peer.conn();
        let agents = self
            .registry
            .register_admin(AdminSession::new(id.clone(), peer.clone()))
            .await;
        info!(%conn, %id, agents, "peer authorized as administrator");

        while let Some(text) = next_frame(peer, inbound).await {
            if let Err(e) = self.route_admin(peer, &text).await {
                warn!(%conn, %id, error = %e, "admin command dropped");
            }
        }

        self.registry.remove_admin(&id, conn).await;
        info!(%conn, %id, "administrator disconnected");
    }

    async fn route_admin(&self, peer: &Peer, text: &str) -> Result<(), RelayError> {
        let (target, ts, msg) = match PeerMessage::parse(text)? {
            PeerMessage::Act { id, ts, name } => {
                let msg = ServerMessage::Act { ts: ts.clone(), name };
                (id, ts, msg)
            }
            PeerMessage::Set { id, ts, name, val } => {
                let val = numeric(&val)?;
                let msg = ServerMessage::Set { ts: ts.clone(), name, val };
                (id, ts, msg)
            }
            other => {
                debug!(conn = %peer.conn(), ?other, "ignoring message from admin");
                return Ok(());
            }
        };

        match self.registry.forward_to_agent(&target, msg).await {
            Ok(_) => Ok(()),
            Err(RegistryError::UnknownAgent(id)) => {
                peer.send(ServerMessage::unknown_agent(id.clone(), ts));
                Err(RelayError::UnknownAgent(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_agent<S>(&self, intro: AgentIntro, peer: &Peer, inbound: &mut S)
    where
        S: Stream<Item = String> + Unpin,
    {
        let conn = peer.conn();
        let AgentIntro {
            id,
            declared,
            label,
            elements,
        } = intro;
        if declared {
            peer.send(ServerMessage::Id { id: id.clone() });
        }

        let session = AgentSession::new(id.clone(), label, elements, peer.clone());
        match self.registry.install_agent(session).await {
            Installed::Registered => info!(%conn, %id, declared, "agent registered"),
            Installed::Replaced { previous } => {
                info!(%conn, %id, %previous, "agent registered, replacing original");
            }
        }

        while let Some(text) = next_frame(peer, inbound).await {
            if let Err(e) = self.route_agent(&id, peer, &text).await {
                warn!(%conn, %id, error = %e, "agent event dropped");
            }
        }

        if self.registry.remove_agent(&id, conn).await {
            info!(%conn, %id, "agent disconnected");
        } else {
            debug!(%conn, %id, "superseded agent connection closed");
        }
    }

    async fn route_agent(&self, id: &str, peer: &Peer, text: &str) -> Result<(), RelayError> {
        let conn = peer.conn();
        match PeerMessage::parse(text)? {
            PeerMessage::Done { ts, name } => {
                let msg = ServerMessage::AgentDone {
                    id: id.to_owned(),
                    ts,
                    name,
                };
                self.registry.publish(id, conn, msg).await?;
            }
            PeerMessage::Upd { ts, name, val } => {
                let val = numeric(&val)?;
                self.registry.update_slider(id, conn, &name, val, ts).await?;
            }
            other => debug!(%conn, %id, ?other, "ignoring message from agent"),
        }
        Ok(())
    }
}

/// Next inbound frame, or `None` once the peer leaves or the broker closes it.
async fn next_frame<S>(peer: &Peer, inbound: &mut S) -> Option<String>
where
    S: Stream<Item = String> + Unpin,
{
    tokio::select! {
        biased;
        () = peer.closed() => None,
        frame = inbound.next() => frame,
    }
}

fn numeric(val: &Value) -> Result<f64, RelayError> {
    coerce_number(val).ok_or_else(|| RelayError::Malformed(format!("value {val} is not numeric")))
}
