//! Outbound half of a peer connection.
//!
//! A [`Peer`] is the handle the registry and routing engine hold for a live
//! channel: a bounded outbox plus a close switch. The matching [`PeerOutbox`] is
//! drained by whatever task owns the actual socket.
//!
//! Sends never wait. A full outbox drops the message with a warning.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::ServerMessage;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one physical connection.
///
/// Distinct from the session id: a replacement reuses the session id but
/// always arrives on a new `ConnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why the broker closed a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No `intro` arrived within the grace period.
    IntroTimeout,
    /// A newer connection took over this agent id.
    Replaced,
    /// The agent's `intro` failed validation.
    InvalidIntro(String),
}

impl CloseReason {
    /// WebSocket close code (application range).
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::IntroTimeout => 4000,
            Self::Replaced => 4001,
            Self::InvalidIntro(_) => 4002,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntroTimeout => f.write_str("intro timeout"),
            Self::Replaced => f.write_str("replaced"),
            Self::InvalidIntro(detail) => write!(f, "invalid intro: {detail}"),
        }
    }
}

struct Closer {
    token: CancellationToken,
    reason: OnceLock<CloseReason>,
}

/// Broker-side handle to a connected peer.
#[derive(Clone)]
pub struct Peer {
    conn: ConnId,
    tx: mpsc::Sender<ServerMessage>,
    closer: Arc<Closer>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("conn", &self.conn)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Create a peer handle and the outbox its socket task drains.
    ///
    /// `capacity` is clamped to at least one message.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, PeerOutbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closer = Arc::new(Closer {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        });
        let conn = ConnId::next();

        let peer = Self {
            conn,
            tx,
            closer: Arc::clone(&closer),
        };
        let outbox = PeerOutbox { conn, rx, closer };
        (peer, outbox)
    }

    /// Connection id.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Queue a message without waiting.
    ///
    /// Returns `false` if the message was dropped.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(conn = %self.conn, kind = msg.kind(), "outbox full, dropping message");
                false
            }
            Err(TrySendError::Closed(msg)) => {
                tracing::debug!(conn = %self.conn, kind = msg.kind(), "peer gone, skipping message");
                false
            }
        }
    }

    /// Ask the socket task to close the channel.
    ///
    /// Only the first call takes effect; returns whether this call did.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closer.reason.set(reason).is_ok() {
            self.closer.token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether the broker has closed this channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.token.is_cancelled()
    }

    /// Reason given to the first [`Peer::close`].
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closer.reason.get()
    }

    /// Resolves once the broker closes this channel.
    pub async fn closed(&self) {
        self.closer.token.cancelled().await;
    }
}

/// Socket-side end of a [`Peer`].
pub struct PeerOutbox {
    conn: ConnId,
    rx: mpsc::Receiver<ServerMessage>,
    closer: Arc<Closer>,
}

impl PeerOutbox {
    /// Connection id.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Next queued message. `None` once every `Peer` handle is dropped.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Next queued message, if one is ready.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.rx.try_recv().ok()
    }

    /// Owned handle on the close switch.
    ///
    /// Lets the socket task wait for a close while it keeps receiving from
    /// this outbox.
    #[must_use]
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            closer: Arc::clone(&self.closer),
        }
    }

    /// Resolves with the close reason once the broker closes the channel.
    pub async fn closed(&self) -> CloseReason {
        self.close_signal().closed().await
    }
}

/// Waits for the broker to close a channel.
#[derive(Clone)]
pub struct CloseSignal {
    closer: Arc<Closer>,
}

impl CloseSignal {
    /// Resolves with the close reason once the broker closes the channel.
    pub async fn closed(&self) -> CloseReason {
        self.closer.token.cancelled().await;
        // The reason is always set before the token is cancelled.
        self.closer
            .reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::Replaced)
    }
}
