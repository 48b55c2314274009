//! The bus node: owns the listener, the dialer, the session registry, the
//! keyring reference, and the replay window. One node serves one store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ed25519_dalek::SigningKey;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use bank_core::capability::Keyring;
use bank_core::config::BankConfig;
use bank_core::storage::PatternStore;
use bank_core::types::IntentCapability;

use crate::codec::MuxCodec;
use crate::error::{BusError, Result};
use crate::gossip;
use crate::reasoning::ReasoningEvent;
use crate::replay::ReplayGuard;
use crate::session::{
    perform_handshake, spawn_session, HandshakeParams, SessionContext, SessionHandle,
};

/// One bus endpoint: accepts peers, dials peers, and keeps the session
/// registry. All sessions share the node's store, keyring, and replay
/// window.
pub struct BusNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    signing: Arc<SigningKey>,
    keyring: Arc<Keyring>,
    store: Arc<dyn PatternStore>,
    config: BankConfig,
    replay: Arc<ReplayGuard>,
    local_capability: RwLock<Option<IntentCapability>>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_session_id: AtomicU64,
    reasoning_sink: RwLock<Option<mpsc::Sender<ReasoningEvent>>>,
}

impl BusNode {
    /// Node over `store`, authenticated by `signing`, trusting the
    /// issuers in `keyring`.
    #[must_use]
    pub fn new(
        store: Arc<dyn PatternStore>,
        signing: SigningKey,
        keyring: Keyring,
        config: BankConfig,
    ) -> Self {
        let replay = Arc::new(ReplayGuard::new(config.capability.replay_window));
        Self {
            inner: Arc::new(NodeInner {
                signing: Arc::new(signing),
                keyring: Arc::new(keyring),
                store,
                config,
                replay,
                local_capability: RwLock::new(None),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                reasoning_sink: RwLock::new(None),
            }),
        }
    }

    /// This node's long-term public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.signing.verifying_key().to_bytes()
    }

    /// Capability presented to peers when none is given per connection.
    pub fn set_local_capability(&self, capability: IntentCapability) {
        *self.inner.local_capability.write() = Some(capability);
    }

    /// Receive inbound reasoning streams through `sink`.
    pub fn set_reasoning_sink(&self, sink: mpsc::Sender<ReasoningEvent>) {
        *self.inner.reasoning_sink.write() = Some(sink);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Handles to all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    /// The session connected to `peer_key`, if any.
    #[must_use]
    pub fn session_for(&self, peer_key: [u8; 32]) -> Option<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .values()
            .find(|s| s.peer_key() == peer_key)
            .cloned()
    }

    /// Pull a snapshot from `peer_key`'s store since `since`.
    pub async fn request_snapshot(
        &self,
        peer_key: [u8; 32],
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        let session = self
            .session_for(peer_key)
            .ok_or_else(|| BusError::SessionClosed("no session to that peer".to_string()))?;
        session.request_snapshot(since).await
    }

    /// Bind `addr` and accept peers until the node is dropped. Returns
    /// the bound address (useful with port 0).
    pub async fn listen(&self, addr: &str) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "bus listening");

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        let Some(node) = inner.upgrade() else { return };
                        if node.sessions.lock().len() >= node.config.bus.max_sessions {
                            warn!(%peer_addr, "session limit reached; refusing connection");
                            continue;
                        }
                        let weak = Weak::clone(&inner);
                        tokio::spawn(async move {
                            if let Some(node) = weak.upgrade() {
                                if let Err(e) =
                                    NodeInner::establish(&node, socket, false, None).await
                                {
                                    warn!(%peer_addr, reason = e.reason_code(), "inbound session refused");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        });
        Ok(local_addr)
    }

    /// Dial a peer, presenting the node's default capability.
    pub async fn connect(&self, addr: &str) -> Result<SessionHandle> {
        self.connect_with(addr, None).await
    }

    /// Dial a peer, presenting `capability` for this session.
    pub async fn connect_with(
        &self,
        addr: &str,
        capability: Option<IntentCapability>,
    ) -> Result<SessionHandle> {
        if self.inner.sessions.lock().len() >= self.inner.config.bus.max_sessions {
            return Err(BusError::TooManySessions);
        }
        let socket = TcpStream::connect(addr).await?;
        NodeInner::establish(&self.inner, socket, true, capability).await
    }

    /// Orderly shutdown of every session.
    pub async fn close_all(&self) {
        let sessions = self.sessions();
        for session in sessions {
            session.shutdown().await;
        }
    }
}

impl NodeInner {
    async fn establish(
        node: &Arc<NodeInner>,
        socket: TcpStream,
        initiator: bool,
        capability: Option<IntentCapability>,
    ) -> Result<SessionHandle> {
        socket.set_nodelay(true)?;

        let local_capability = match capability.or_else(|| node.local_capability.read().clone()) {
            Some(capability) => capability,
            None => {
                return Err(BusError::Protocol(
                    "no local capability configured".to_string(),
                ))
            }
        };
        let local_dim = node
            .store
            .embedding_dim()
            .await?
            .map_or(0, |d| d as u32);

        let mut framed = Framed::new(socket, MuxCodec::new(node.config.bus.max_frame_bytes));
        let params = HandshakeParams {
            signing: Arc::clone(&node.signing),
            keyring: Arc::clone(&node.keyring),
            replay: Arc::clone(&node.replay),
            local_capability,
            credit_per_stream: node.config.bus.credit_per_stream.max(1),
            local_dim,
            timeout: std::time::Duration::from_secs(
                node.config.bus.handshake_timeout_secs.max(1),
            ),
        };
        let peer_hello = perform_handshake(&mut framed, &params).await?;

        let session_id = node.next_session_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(node);
        let cleanup: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(node) = weak.upgrade() {
                node.sessions.lock().remove(&session_id);
            }
        });

        let ctx = SessionContext {
            store: Arc::clone(&node.store),
            keyring: Arc::clone(&node.keyring),
            replay: Arc::clone(&node.replay),
            bus_config: node.config.bus.clone(),
            reasoning_sink: node.reasoning_sink.read().clone(),
        };
        let handle = spawn_session(framed, &peer_hello, session_id, initiator, ctx, cleanup);
        node.sessions.lock().insert(session_id, handle.clone());
        // The actor may have died between spawn and insert; do not strand
        // a dead handle in the registry
        if handle.is_closed() {
            node.sessions.lock().remove(&session_id);
        }
        info!(
            session_id,
            peer = %hex::encode(handle.peer_key()),
            "session established"
        );

        tokio::spawn(gossip::run(
            handle.clone(),
            Arc::clone(&node.store),
            node.config.gossip.clone(),
        ));

        Ok(handle)
    }
}
