//! Concurrent session registry.
//!
//! Two indices are kept: the primary map from session id to session and a
//! secondary map from bound datagram address to session id. Both are
//! `DashMap`s; sessions are handed out as `Arc<Session>` clones so no map
//! guard ever lives across an `.await`.

use super::state::Session;
use crate::error::{Result, ServerError};
use crate::protocol::{ReliablePacket, SessionId, UnreliablePacket};
use crate::transport::ReliableConnection;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Sessions the packet was handed to successfully.
    pub delivered: usize,
    /// Sessions whose delivery failed.
    pub failed: Vec<SessionId>,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_unreliable_addr: DashMap<SocketAddr, SessionId>,
    /// Serializes changes that touch both indices.
    binding: Mutex<()>,
    next_session_id: AtomicU32,
    unreliable_socket: Option<Arc<UdpSocket>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SessionRegistry {
    /// `unreliable_socket` is handed to every session for outbound datagrams.
    pub fn new(unreliable_socket: Option<Arc<UdpSocket>>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_unreliable_addr: DashMap::new(),
            binding: Mutex::new(()),
            next_session_id: AtomicU32::new(1),
            unreliable_socket,
        }
    }

    /// Allocates the next id and registers a session owning `connection`.
    pub fn create_session(&self, connection: Arc<ReliableConnection>) -> Result<Arc<Session>> {
        let id = self
            .next_session_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| next.checked_add(1))
            .map_err(|_| ServerError::SessionIdsExhausted)?;

        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ServerError::DuplicateSessionId(id)),
            Entry::Vacant(slot) => {
                let session = Arc::new(Session::new(
                    id,
                    connection,
                    self.unreliable_socket.clone(),
                ));
                slot.insert(session.clone());
                info!("🎮 Session {} created for {}", id, session.peer_addr());
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn get_by_unreliable_addr(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        let id = self.by_unreliable_addr.get(&addr).map(|entry| *entry.value())?;
        self.get(id)
    }

    /// Binds `addr` to `session`.
    ///
    /// An address belongs to at most one session: if another session owned
    /// `addr`, its binding is evicted and its id returned. The session's own
    /// previous address, if different, is released. Sessions that are no
    /// longer registered are not bound.
    pub fn bind_unreliable_address(&self, session: &Session, addr: SocketAddr) -> Option<SessionId> {
        let _guard = self.binding.lock();

        if !self.sessions.contains_key(&session.id()) {
            debug!("Not binding {} to departed session {}", addr, session.id());
            return None;
        }

        let evicted = match self.by_unreliable_addr.insert(addr, session.id()) {
            Some(owner) if owner != session.id() => {
                if let Some(previous) = self.get(owner) {
                    previous.set_unreliable_addr(None);
                }
                warn!("Address {} moved from session {} to {}", addr, owner, session.id());
                Some(owner)
            }
            _ => None,
        };

        if let Some(old_addr) = session.unreliable_addr() {
            if old_addr != addr {
                self.by_unreliable_addr
                    .remove_if(&old_addr, |_, owner| *owner == session.id());
            }
        }
        session.set_unreliable_addr(Some(addr));

        debug!("Session {} bound to {}", session.id(), addr);
        evicted
    }

    /// Removes a session from both indices and closes its connection.
    ///
    /// Returns `None` when the id is not registered.
    pub fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = {
            let _guard = self.binding.lock();
            let (_, session) = self.sessions.remove(&id)?;
            if let Some(addr) = session.unreliable_addr() {
                self.by_unreliable_addr.remove_if(&addr, |_, owner| *owner == id);
            }
            session
        };

        session.close();
        info!("👋 Session {} removed", id);
        Some(session)
    }

    /// Point-in-time copy of every registered session.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn bound_address_count(&self) -> usize {
        self.by_unreliable_addr.len()
    }

    /// Sends to every ready session with an open connection.
    pub async fn broadcast_reliable(&self, packet: &ReliablePacket) -> Result<BroadcastOutcome> {
        self.broadcast_reliable_filtered(packet, None).await
    }

    /// Like [`broadcast_reliable`](Self::broadcast_reliable) but skips `except`.
    pub async fn broadcast_reliable_except(
        &self,
        packet: &ReliablePacket,
        except: SessionId,
    ) -> Result<BroadcastOutcome> {
        self.broadcast_reliable_filtered(packet, Some(except)).await
    }

    async fn broadcast_reliable_filtered(
        &self,
        packet: &ReliablePacket,
        except: Option<SessionId>,
    ) -> Result<BroadcastOutcome> {
        let frame = packet.to_bytes()?;
        let targets: Vec<Arc<Session>> = self
            .all_sessions()
            .into_iter()
            .filter(|s| Some(s.id()) != except && s.is_ready() && s.is_open())
            .collect();

        let results = join_all(targets.iter().map(|session| {
            let frame = &frame;
            async move { (session.id(), session.send_reliable_frame(frame).await) }
        }))
        .await;

        let outcome = collect_outcome(results, "reliable");
        for id in &outcome.failed {
            self.remove_session(*id);
        }
        Ok(outcome)
    }

    /// Sends to every ready session with a bound datagram address, skipping `except`.
    ///
    /// Failures are logged only; a lost datagram says nothing about the session.
    pub async fn broadcast_unreliable(
        &self,
        packet: &UnreliablePacket,
        except: Option<SessionId>,
    ) -> BroadcastOutcome {
        let datagram = packet.to_bytes();
        let targets: Vec<Arc<Session>> = self
            .all_sessions()
            .into_iter()
            .filter(|s| Some(s.id()) != except && s.is_ready() && s.unreliable_addr().is_some())
            .collect();

        let results = join_all(targets.iter().map(|session| {
            let datagram = &datagram;
            async move { (session.id(), session.send_unreliable_datagram(datagram).await) }
        }))
        .await;

        collect_outcome(results, "unreliable")
    }

    /// Moves the id counter; lets tests reach the collision and exhaustion paths.
    #[cfg(test)]
    pub(crate) fn set_next_session_id(&self, next: SessionId) {
        self.next_session_id.store(next, Ordering::Release);
    }
}

fn collect_outcome(results: Vec<(SessionId, Result<()>)>, transport: &str) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();
    for (id, result) in results {
        match result {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                warn!("{} broadcast to session {} failed: {}", transport, id, e);
                outcome.failed.push(id);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    fn connection(id: u64) -> (Arc<ReliableConnection>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let connection = Arc::new(ReliableConnection::new(
            id,
            SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16)),
            server,
            CancellationToken::new(),
        ));
        (connection, client)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    async fn assert_silent(client: &mut DuplexStream) {
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), client.read(&mut buf)).await;
        assert!(read.is_err(), "unexpected bytes on a skipped session");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_distinct_ids() {
        let registry = Arc::new(SessionRegistry::default());
        let mut tasks = Vec::new();
        for i in 0..64u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (conn, _client) = connection(i);
                registry.create_session(conn).unwrap().id()
            }));
        }

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 64);
        assert_eq!(registry.len(), 64);
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let registry = SessionRegistry::default();
        let (a, _ca) = connection(1);
        let (b, _cb) = connection(2);
        assert_eq!(registry.create_session(a).unwrap().id(), 1);
        assert_eq!(registry.create_session(b).unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_exhausted_ids() {
        let registry = SessionRegistry::default();
        let (a, _ca) = connection(1);
        registry.create_session(a).unwrap();

        registry.set_next_session_id(1);
        let (b, _cb) = connection(2);
        assert!(matches!(
            registry.create_session(b),
            Err(ServerError::DuplicateSessionId(1))
        ));

        registry.set_next_session_id(SessionId::MAX);
        let (c, _cc) = connection(3);
        assert!(matches!(
            registry.create_session(c),
            Err(ServerError::SessionIdsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let registry = SessionRegistry::default();
        let (conn, _client) = connection(1);
        let session = registry.create_session(conn.clone()).unwrap();
        registry.bind_unreliable_address(&session, addr(5000));

        assert!(registry.remove_session(session.id()).is_some());
        assert!(registry.remove_session(session.id()).is_none());
        assert!(registry.get(session.id()).is_none());
        assert!(registry.get_by_unreliable_addr(addr(5000)).is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_rebinding_address_moves_ownership() {
        let registry = SessionRegistry::default();
        let (c1, _k1) = connection(1);
        let (c2, _k2) = connection(2);
        let s = registry.create_session(c1).unwrap();
        let s2 = registry.create_session(c2).unwrap();

        assert_eq!(registry.bind_unreliable_address(&s, addr(6000)), None);
        assert_eq!(registry.bind_unreliable_address(&s2, addr(6000)), Some(s.id()));

        assert_eq!(registry.get_by_unreliable_addr(addr(6000)).unwrap().id(), s2.id());
        assert_eq!(s.unreliable_addr(), None);
        assert_eq!(registry.bound_address_count(), 1);

        // Removing the evicted owner must not drop the new binding.
        registry.remove_session(s.id());
        assert_eq!(registry.get_by_unreliable_addr(addr(6000)).unwrap().id(), s2.id());
    }

    #[tokio::test]
    async fn test_session_moving_address_releases_old_one() {
        let registry = SessionRegistry::default();
        let (c1, _k1) = connection(1);
        let s = registry.create_session(c1).unwrap();

        registry.bind_unreliable_address(&s, addr(7000));
        registry.bind_unreliable_address(&s, addr(7001));

        assert!(registry.get_by_unreliable_addr(addr(7000)).is_none());
        assert_eq!(registry.get_by_unreliable_addr(addr(7001)).unwrap().id(), s.id());
        assert_eq!(registry.bound_address_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_except_reaches_ready_sessions_once() {
        let registry = SessionRegistry::default();
        let mut clients = Vec::new();
        for i in 1..=7u64 {
            let (conn, client) = connection(i);
            let session = registry.create_session(conn).unwrap();
            if session.id() >= 5 {
                session.set_ready(true);
            }
            clients.push(client);
        }

        let packet = ReliablePacket::new(20, 0, &b"hello"[..]);
        let outcome = registry.broadcast_reliable_except(&packet, 6).await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.failed.is_empty());

        let expected = packet.to_bytes().unwrap();
        for (index, client) in clients.iter_mut().enumerate() {
            let id = index + 1;
            if id == 5 || id == 7 {
                let mut buf = vec![0u8; expected.len()];
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, expected.to_vec());
            }
            assert_silent(client).await;
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_removes_only_that_session() {
        let registry = SessionRegistry::default();
        let (c1, mut k1) = connection(1);
        let (c2, k2) = connection(2);
        let healthy = registry.create_session(c1).unwrap();
        let broken = registry.create_session(c2).unwrap();
        healthy.set_ready(true);
        broken.set_ready(true);
        drop(k2);

        let packet = ReliablePacket::new(21, 0, &b"still here"[..]);
        let outcome = registry.broadcast_reliable(&packet).await.unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, vec![broken.id()]);
        assert!(registry.get(broken.id()).is_none());
        assert!(registry.get(healthy.id()).is_some());

        let mut buf = vec![0u8; packet.to_bytes().unwrap().len()];
        k1.read_exact(&mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreliable_broadcast_skips_unbound_sessions() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let registry = SessionRegistry::new(Some(socket));
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (c1, _k1) = connection(1);
        let (c2, _k2) = connection(2);
        let (c3, _k3) = connection(3);
        let bound = registry.create_session(c1).unwrap();
        let unbound = registry.create_session(c2).unwrap();
        let sender = registry.create_session(c3).unwrap();
        for s in [&bound, &unbound, &sender] {
            s.set_ready(true);
        }
        registry.bind_unreliable_address(&bound, receiver.local_addr().unwrap());

        let packet = UnreliablePacket::new(30, sender.id(), &b"pos"[..]).with_sequence(9);
        let outcome = registry.broadcast_unreliable(&packet, Some(sender.id())).await;
        assert_eq!(outcome.delivered, 1);

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(UnreliablePacket::decode(&buf[..len]).unwrap(), packet);
    }
}
