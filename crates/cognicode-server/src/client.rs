use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use cognicode_core::SessionId;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Identifies one WebSocket connection. A session may outlive many clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Client {
    pub id: ClientId,
    session_id: Mutex<Option<SessionId>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            session_id: Mutex::new(None),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    /// Connected and answered a ping within the liveness window.
    pub fn is_alive(&self) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Connected WebSocket clients and the session each one is bound to.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a client. Returns the session it was bound to.
    pub fn unregister(&self, id: &ClientId) -> Option<SessionId> {
        let (_, client) = self.clients.remove(id)?;
        client.connected.store(false, Ordering::Relaxed);
        client.session_id()
    }

    fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| c.value().clone())
    }

    /// Bind a client to a session, returning the previous binding.
    pub fn set_session(&self, client_id: &ClientId, session_id: SessionId) -> Option<SessionId> {
        let client = self.get(client_id)?;
        let previous = client.session_id.lock().replace(session_id);
        previous
    }

    /// Clear a client's binding, returning it.
    pub fn unbind(&self, client_id: &ClientId) -> Option<SessionId> {
        let client = self.get(client_id)?;
        let previous = client.session_id.lock().take();
        previous
    }

    pub fn session_of(&self, client_id: &ClientId) -> Option<SessionId> {
        self.get(client_id).and_then(|c| c.session_id())
    }

    /// Queue a message without waiting. Dropped when the queue is full.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.get(client_id) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a message, waiting for room. Job events go through here so a
    /// slow reader is never handed a gap.
    pub async fn deliver(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.get(client_id) else {
            return false;
        };
        let tx = client.tx.clone();
        drop(client);
        tx.send(message).await.is_ok()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients_for_session(&self, session_id: &SessionId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|c| c.session_id().as_ref() == Some(session_id))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Remove clients that haven't answered a ping within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| !c.is_alive())
            .map(|c| c.id.clone())
            .collect();
        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "cleaned up dead client");
        }
        dead.len()
    }
}

/// Pump one WebSocket: a writer forwarding queued frames plus heartbeat
/// pings, and a reader handing text frames to `on_message`. Returns when
/// either side stops.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }

        if let Some(client) = writer_registry.get(&writer_cid) {
            client.connected.store(false, Ordering::Relaxed);
        }
        let _ = ws_tx.close().await;
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_cid.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_cid) {
                        client.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        let session = SessionId::new();
        registry.set_session(&id1, session.clone());
        assert_eq!(registry.unregister(&id1), Some(session));
        assert_eq!(registry.unregister(&id2), None);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.unregister(&id2), None);
    }

    #[test]
    fn rebinding_returns_previous_session() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let first = SessionId::new();
        let second = SessionId::new();
        assert_eq!(registry.set_session(&id, first.clone()), None);
        assert_eq!(registry.set_session(&id, second.clone()), Some(first.clone()));
        assert_eq!(registry.session_of(&id), Some(second.clone()));
        assert_eq!(registry.clients_for_session(&second), vec![id.clone()]);
        assert!(registry.clients_for_session(&first).is_empty());
        assert_eq!(registry.unbind(&id), Some(second));
        assert_eq!(registry.session_of(&id), None);
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(!registry.send_to(&ClientId::new(), "nobody".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();
        assert!(registry.send_to(&id, "msg1".into()));
        assert!(registry.send_to(&id, "msg2".into()));
        assert!(!registry.send_to(&id, "msg3".into()));
    }

    #[tokio::test]
    async fn deliver_waits_for_room() {
        let registry = Arc::new(ClientRegistry::new(1));
        let (id, mut rx) = registry.register();
        assert!(registry.deliver(&id, "first".into()).await);

        let pending = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.deliver(&id, "second".into()).await })
        };
        assert_eq!(rx.recv().await.unwrap(), "first");
        assert!(pending.await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let (_live, _rx2) = registry.register();
        registry.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn closed_writer_counts_as_dead() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let client = registry.get(&id).unwrap();
        assert!(client.is_alive());
        client.connected.store(false, Ordering::Relaxed);
        assert!(!client.is_alive());
        assert_eq!(registry.cleanup_dead_clients(), 1);
    }
}
