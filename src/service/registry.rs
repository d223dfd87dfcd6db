use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::protocol::Message;
use crate::service::SessionHandle;

/// Result of one [`SessionRegistry::broadcast`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Sessions the message was written to.
    pub delivered: usize,
    /// Inactive or failing sessions removed during the pass.
    pub pruned: usize,
}

/// Sessions that are currently being served, keyed by session id.
///
/// The lock only guards the map. Network writes happen on a snapshot taken
/// under the lock, so a slow peer never stalls registration or removal.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn add(&self, session: Arc<SessionHandle>) {
        let id = session.id();
        if self.sessions.lock().insert(id, session).is_some() {
            error!(session = id, "session id registered twice");
        }
    }

    pub fn remove(&self, id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Sends `message` to every active session.
    ///
    /// Sends run concurrently, one task per session, and the call returns
    /// once every send has finished. Sessions that were already inactive,
    /// whose send fails, or that closed while the send was in flight are
    /// removed from the registry. The message goes out
    /// as-is; callers keep broadcasts small enough for a single frame.
    pub async fn broadcast(&self, message: &Message) -> BroadcastOutcome {
        let mut dead = Vec::new();
        let mut pending = Vec::new();

        for session in self.snapshot() {
            if !session.is_active() {
                dead.push(session.id());
                continue;
            }
            let id = session.id();
            let message = message.clone();
            let task = tokio::spawn(async move {
                let sent = match session.send(&message).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(session = session.id(), error = %e, "broadcast send failed");
                        false
                    }
                };
                // closed while this send was in flight
                (sent, session.is_active())
            });
            pending.push((id, task));
        }

        let mut delivered = 0;
        for (id, task) in pending {
            match task.await {
                Ok((true, true)) => delivered += 1,
                Ok((true, false)) => {
                    delivered += 1;
                    dead.push(id);
                }
                Ok((false, _)) => dead.push(id),
                Err(e) => {
                    error!(session = id, error = %e, "broadcast task failed");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.lock();
            for id in &dead {
                sessions.remove(id);
            }
        }
        debug!(
            monotonic_counter.broadcasts = 1u64,
            delivered,
            pruned = dead.len(),
            message = %message,
            "broadcast finished"
        );

        BroadcastOutcome {
            delivered,
            pruned: dead.len(),
        }
    }

    /// Asks every registered session to close. Sessions deregister
    /// themselves as their workers exit.
    pub fn close_all(&self) {
        let sessions = self.snapshot();
        if !sessions.is_empty() {
            info!("closing {} sessions", sessions.len());
        }
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use super::*;
    use crate::protocol::codes::CMD_NOTIFY;

    fn session(id: u64) -> (Arc<SessionHandle>, DuplexStream) {
        let (client, server) = duplex(4096);
        (Arc::new(SessionHandle::new(id, format!("peer-{id}"), server, None)), client)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_active_session() {
        let registry = SessionRegistry::new();
        let mut clients = Vec::new();
        for id in 1..=3 {
            let (handle, client) = session(id);
            registry.add(handle);
            clients.push(client);
        }

        let notice = Message::new(CMD_NOTIFY, 0).with_field(1, "schedule changed");
        let mut expected = bytes::BytesMut::new();
        notice.encode(&mut expected);

        let outcome = registry.broadcast(&notice).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 3, pruned: 0 });

        for client in clients.iter_mut() {
            let mut received = vec![0u8; expected.len()];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(&received[..], &expected[..]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_prunes_inactive_and_failed_sessions() {
        let registry = SessionRegistry::new();
        let (alive, _alive_client) = session(1);
        let (closed, _closed_client) = session(2);
        let (broken, broken_client) = session(3);
        registry.add(alive);
        registry.add(closed.clone());
        registry.add(broken.clone());

        closed.close();
        // writes to a duplex fail once the other end is gone
        drop(broken_client);

        let outcome = registry.broadcast(&Message::new(CMD_NOTIFY, 0)).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 1, pruned: 2 });
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
        assert!(!broken.is_active());
    }

    #[tokio::test]
    async fn test_broadcast_on_empty_registry() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        let outcome = registry.broadcast(&Message::new(CMD_NOTIFY, 0)).await;
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn test_close_all_keeps_entries_until_removed() {
        let registry = SessionRegistry::new();
        let (first, _c1) = session(1);
        let (second, _c2) = session(2);
        registry.add(first.clone());
        registry.add(second.clone());

        registry.close_all();
        assert!(!first.is_active());
        assert!(!second.is_active());
        assert_eq!(registry.len(), 2);

        registry.remove(1);
        registry.remove(2);
        assert!(registry.is_empty());
        assert!(registry.remove(2).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcast_while_sessions_close() {
        const TOTAL: u64 = 32;
        const CLOSING: u64 = 12;

        let registry = Arc::new(SessionRegistry::new());
        let mut clients = Vec::new();
        for id in 0..TOTAL {
            let (handle, client) = session(id);
            registry.add(handle);
            clients.push(client);
        }

        // the first CLOSING sessions go away while the broadcast runs, the
        // way a session worker closes and deregisters itself
        let closer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for id in 0..CLOSING {
                    if let Some(session) = registry.get(id) {
                        session.close();
                    }
                    tokio::task::yield_now().await;
                    registry.remove(id);
                }
            })
        };

        let notice = Message::new(CMD_NOTIFY, 0).with_field(1, "report finished");
        let outcome = registry.broadcast(&notice).await;
        closer.await.unwrap();

        assert!(outcome.delivered >= (TOTAL - CLOSING) as usize);
        assert_eq!(registry.len(), (TOTAL - CLOSING) as usize);

        let mut expected = bytes::BytesMut::new();
        notice.encode(&mut expected);
        for (id, client) in clients.iter_mut().enumerate() {
            if (id as u64) < CLOSING {
                continue;
            }
            let mut received = vec![0u8; expected.len()];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(&received[..], &expected[..]);
            // exactly one copy
            let mut extra = [0u8; 1];
            assert!(
                tokio::time::timeout(Duration::from_millis(50), client.read(&mut extra))
                    .await
                    .is_err()
            );
        }
    }
}
