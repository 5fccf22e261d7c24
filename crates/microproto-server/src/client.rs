use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use microproto_core::{ClientId, SessionId};
use tokio_util::sync::CancellationToken;

/// A connected WebSocket peer, established or not.
pub struct Client {
    pub id: ClientId,
    /// 0 until the handshake completes.
    session_id: AtomicU32,
    last_activity: AtomicU64,
    cancel: CancellationToken,
}

impl Client {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            session_id: AtomicU32::new(0),
            last_activity: AtomicU64::new(now_millis()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.session_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(SessionId(id)),
        }
    }

    pub fn record_activity(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Fires when the connection should shut down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Every open WebSocket connection, keyed by [`ClientId`].
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<Client> {
        let client = Arc::new(Client::new(ClientId::new()));
        self.clients.insert(client.id.clone(), Arc::clone(&client));
        client
    }

    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.cancel.cancel();
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn set_session(&self, id: &ClientId, session_id: SessionId) {
        if let Some(client) = self.clients.get(id) {
            client.session_id.store(session_id.0, Ordering::Relaxed);
        }
    }

    pub fn record_activity(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_activity();
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Clients that completed the HELLO handshake.
    pub fn established_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|c| c.session_id().is_some())
            .count()
    }

    /// Cancel and forget clients with no traffic for `idle`. Their connection
    /// tasks see the cancellation, close the socket and leave the engine.
    pub fn cleanup_stale_clients(&self, idle: Duration) -> usize {
        let stale: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| c.idle_for() >= idle)
            .map(|c| c.id.clone())
            .collect();

        for id in &stale {
            tracing::info!(client_id = %id, idle_secs = idle.as_secs(), "closing idle client");
            self.unregister(id);
        }
        stale.len()
    }
}

/// Periodically close idle clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    idle: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_stale_clients(idle);
            if removed > 0 {
                tracing::info!(removed, "idle client sweep");
            }
        }
    })
}
