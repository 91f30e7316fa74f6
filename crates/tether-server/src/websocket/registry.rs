//! Account sessions, pairing, and eviction.
//!
//! Every live socket is in the connection index. Authenticated sockets are
//! also slotted into their account's session: at most one tool and an
//! ordered list of devices (oldest first). All session mutations, and the
//! peer reassignments they trigger, run under one lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tether_core::{AccountId, CloseCode, ConnectionId, Role};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::connection::PeerConnection;
use crate::metrics::EVICTIONS_TOTAL;

const EVENT_CAPACITY: usize = 256;

/// Contract violations when registering a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryFault {
    /// The connection has no account.
    #[error("connection {0} is not authenticated")]
    Unauthenticated(ConnectionId),
    /// The connection has already been closed or removed.
    #[error("connection {0} is no longer live")]
    NotLive(ConnectionId),
}

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A connection was slotted into its account's session.
    Registered {
        /// Connection id.
        id: ConnectionId,
        /// Connection role.
        role: Role,
        /// Owning account.
        account: AccountId,
    },
    /// A connection left the connection index.
    Removed {
        /// Connection id.
        id: ConnectionId,
        /// Connection role.
        role: Role,
        /// Owning account, if it had authenticated.
        account: Option<AccountId>,
    },
}

/// Point-in-time view of one account's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Tool slot.
    pub tool: Option<ConnectionId>,
    /// Device slots, oldest first.
    pub devices: Vec<ConnectionId>,
}

#[derive(Default)]
struct Session {
    tool: Option<Arc<PeerConnection>>,
    devices: VecDeque<Arc<PeerConnection>>,
}

impl Session {
    fn is_empty(&self) -> bool {
        self.tool.is_none() && self.devices.is_empty()
    }

    fn len(&self) -> usize {
        usize::from(self.tool.is_some()) + self.devices.len()
    }
}

/// Process-wide table of connections and account sessions.
pub struct SessionRegistry {
    max_devices: usize,
    connections: DashMap<ConnectionId, Arc<PeerConnection>>,
    sessions: Mutex<HashMap<AccountId, Session>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    /// Create a registry allowing `max_devices` devices per account.
    pub fn new(max_devices: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            max_devices: max_devices.max(1),
            connections: DashMap::new(),
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to registry notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add a freshly accepted connection to the index.
    pub fn add(&self, conn: Arc<PeerConnection>) {
        let _ = self.connections.insert(conn.id(), conn);
    }

    /// Look up a live connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<PeerConnection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve a connection's current peer.
    pub fn peer_of(&self, conn: &PeerConnection) -> Option<Arc<PeerConnection>> {
        conn.peer().and_then(|id| self.get(id))
    }

    /// Slot an authenticated connection into its account's session and
    /// pair it.
    ///
    /// A device pairs with the session's tool, taking the tool away from any
    /// previous device; devices over the limit are evicted oldest first. A
    /// tool replaces any existing tool and pairs with the newest device.
    pub fn register(&self, conn: &Arc<PeerConnection>) -> Result<(), RegistryFault> {
        let account = conn
            .account()
            .cloned()
            .ok_or(RegistryFault::Unauthenticated(conn.id()))?;

        let mut sessions = self.sessions.lock();
        if conn.is_closed() || !self.connections.contains_key(&conn.id()) {
            return Err(RegistryFault::NotLive(conn.id()));
        }
        let session = sessions.entry(account.clone()).or_default();

        match conn.role() {
            Role::Device => {
                session.devices.push_back(Arc::clone(conn));

                if let Some(tool) = session.tool.clone() {
                    if let Some(previous) = self.peer_of(&tool) {
                        if previous.id() != conn.id() {
                            previous.set_peer(None);
                        }
                    }
                    tool.set_peer(Some(conn.id()));
                    conn.set_peer(Some(tool.id()));
                }

                if session.devices.len() > self.max_devices {
                    if let Some(oldest) = session.devices.pop_front() {
                        info!(
                            conn_id = %oldest.id(),
                            account = %account,
                            limit = self.max_devices,
                            "device limit reached, evicting oldest"
                        );
                        counter!(EVICTIONS_TOTAL, "reason" => "device_limit").increment(1);
                        self.evict(session, &oldest);
                    }
                }
            }
            Role::Tool => {
                if let Some(previous) = session.tool.take() {
                    info!(
                        conn_id = %previous.id(),
                        account = %account,
                        "tool replaced by newer connection"
                    );
                    counter!(EVICTIONS_TOTAL, "reason" => "tool_replaced").increment(1);
                    self.evict(session, &previous);
                }

                session.tool = Some(Arc::clone(conn));

                if let Some(device) = session.devices.back().cloned() {
                    conn.set_peer(Some(device.id()));
                    device.set_peer(Some(conn.id()));
                }
            }
        }
        drop(sessions);

        debug!(
            conn_id = %conn.id(),
            role = %conn.role(),
            account = %account,
            "connection registered"
        );
        self.emit(RegistryEvent::Registered {
            id: conn.id(),
            role: conn.role(),
            account,
        });
        Ok(())
    }

    /// Drop a connection from the index and its session, unpairing it.
    ///
    /// Safe to call for unauthenticated or already removed connections;
    /// only the first call for a connection emits a notification.
    pub fn remove(&self, conn: &PeerConnection) {
        let indexed = self.connections.remove(&conn.id()).is_some();

        if let Some(account) = conn.account() {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(account) {
                self.detach(session, conn);
                if session.is_empty() {
                    let _ = sessions.remove(account);
                    debug!(account = %account, "session closed");
                }
            } else {
                // No session: only the peer link can be left over.
                self.unpair(conn);
            }
        }

        if indexed {
            self.emit(RegistryEvent::Removed {
                id: conn.id(),
                role: conn.role(),
                account: conn.account().cloned(),
            });
        }
    }

    /// Close a connection with `code` and remove it. Idempotent.
    pub fn close(&self, conn: &PeerConnection, code: CloseCode) {
        if conn.begin_close(Some(code)) {
            debug!(conn_id = %conn.id(), code = code.as_u16(), "closing connection");
        }
        self.remove(conn);
    }

    /// Finalize a connection whose transport has already gone away.
    pub fn finish_close(&self, conn: &PeerConnection) {
        let _ = conn.begin_close(None);
        self.remove(conn);
    }

    /// Close every live connection with `code`.
    pub fn close_all(&self, code: CloseCode) {
        let conns: Vec<Arc<PeerConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(count = conns.len(), code = code.as_u16(), "closing all connections");
        for conn in conns {
            self.close(&conn, code);
        }
    }

    /// Snapshot of an account's session.
    pub fn session(&self, account: &AccountId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock();
        sessions.get(account).map(|s| SessionSnapshot {
            tool: s.tool.as_ref().map(|c| c.id()),
            devices: s.devices.iter().map(|c| c.id()).collect(),
        })
    }

    /// Live connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections slotted into a session.
    pub fn authenticated_count(&self) -> usize {
        self.sessions.lock().values().map(Session::len).sum()
    }

    /// Accounts with at least one slotted connection.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Close an evicted connection and detach it while the session lock is
    /// already held.
    fn evict(&self, session: &mut Session, victim: &Arc<PeerConnection>) {
        let _ = victim.begin_close(Some(CloseCode::ConnectionReplaced));
        let indexed = self.connections.remove(&victim.id()).is_some();
        self.detach(session, victim);
        if indexed {
            self.emit(RegistryEvent::Removed {
                id: victim.id(),
                role: victim.role(),
                account: victim.account().cloned(),
            });
        }
    }

    fn detach(&self, session: &mut Session, conn: &PeerConnection) {
        match conn.role() {
            Role::Tool => {
                if session.tool.as_ref().is_some_and(|t| t.id() == conn.id()) {
                    session.tool = None;
                }
            }
            Role::Device => session.devices.retain(|d| d.id() != conn.id()),
        }
        self.unpair(conn);
    }

    fn unpair(&self, conn: &PeerConnection) {
        if let Some(peer) = self.peer_of(conn) {
            // The peer may already be paired elsewhere.
            if peer.peer() == Some(conn.id()) {
                peer.set_peer(None);
            }
        }
        conn.set_peer(None);
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(10)
    }
}
