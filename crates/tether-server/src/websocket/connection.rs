//! Relay connection state.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{AccountId, CloseCode, ConnectionId, ConnectionStatus, Role, status_frame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Item queued for a connection's socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Binary frame, written verbatim.
    Binary(Bytes),
    /// Keepalive probe.
    Ping,
    /// Terminal item. `None` means the transport is already gone and no
    /// close frame is written.
    Close(Option<CloseCode>),
}

/// One accepted socket.
///
/// The peer link is stored as an id and resolved through the registry's
/// connection index, so a torn-down peer is never reachable from here.
pub struct PeerConnection {
    id: ConnectionId,
    role: Role,
    account: OnceLock<AccountId>,
    closed: AtomicBool,
    peer: Mutex<Option<ConnectionId>>,
    tx: mpsc::UnboundedSender<Outbound>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Create a connection with a fresh id.
    pub fn new(role: Role, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::next(),
            role,
            account: OnceLock::new(),
            closed: AtomicBool::new(false),
            peer: Mutex::new(None),
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            cancel: CancellationToken::new(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Tool or device.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Authenticated account, if any.
    pub fn account(&self) -> Option<&AccountId> {
        self.account.get()
    }

    /// Whether an account has been recorded.
    pub fn is_authenticated(&self) -> bool {
        self.account.get().is_some()
    }

    /// Record the authenticated account. Returns `false` if one was
    /// already set; the first account sticks.
    pub fn authenticate(&self, account: AccountId) -> bool {
        self.account.set(account).is_ok()
    }

    /// Whether close has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Not closed and the writer is still draining the queue.
    pub fn is_live(&self) -> bool {
        !self.is_closed() && !self.tx.is_closed()
    }

    /// Queue a binary frame. Returns `false` if the connection is not live.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_live() {
            return false;
        }
        self.tx.send(Outbound::Binary(frame)).is_ok()
    }

    /// Queue a keepalive probe. No-op once the connection is not live.
    pub fn ping(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.tx.send(Outbound::Ping).is_ok()
    }

    /// Currently paired peer.
    pub fn peer(&self) -> Option<ConnectionId> {
        *self.peer.lock()
    }

    /// Replace the paired peer, reporting the change on this connection.
    ///
    /// Sends a disconnect status when a previous peer existed, then a
    /// connect status when a new peer is assigned. Setting the current
    /// value again sends nothing, and a closed connection never reports.
    pub(crate) fn set_peer(&self, peer: Option<ConnectionId>) {
        let mut slot = self.peer.lock();
        if *slot == peer {
            return;
        }
        let old = std::mem::replace(&mut *slot, peer);
        drop(slot);

        if self.is_closed() {
            return;
        }
        trace!(conn_id = %self.id, ?old, new = ?peer, "peer changed");
        if old.is_some() {
            let _ = self.send(status_frame(ConnectionStatus::Disconnected));
        }
        if peer.is_some() {
            let _ = self.send(status_frame(ConnectionStatus::Connected));
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time of the last inbound activity (or accept).
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Token cancelled when close begins.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the connection closed and queue the terminal writer item.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn begin_close(&self, code: Option<CloseCode>) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Outbound::Close(code));
        self.cancel.cancel();
        true
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("account", &self.account.get())
            .field("closed", &self.is_closed())
            .field("peer", &self.peer())
            .finish_non_exhaustive()
    }
}
