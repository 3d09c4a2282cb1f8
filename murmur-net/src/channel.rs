//! In-memory transport.
//!
//! A shared [`ChannelHub`] broker routes publisher fan-out and router
//! requests between [`ChannelTransport`] instances by their binding
//! strings, so whole fleets run inside one process for tests.

use crate::{BoundAddrs, Frame, Inbound, Transport, TransportError};
use async_trait::async_trait;
use murmur_model::PeerBinding;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAP: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type RequestSender = mpsc::Sender<(Frame, oneshot::Sender<Frame>)>;

/// Shared fabric broker. Each publisher binding gets a broadcast channel,
/// each router binding an mpsc queue.
#[derive(Clone, Default)]
pub struct ChannelHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    publishers: HashMap<String, broadcast::Sender<Frame>>,
    routers: HashMap<String, RequestSender>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get or create the broadcast channel for a publisher binding.
    fn publisher(&self, addr: &str) -> broadcast::Sender<Frame> {
        self.lock()
            .publishers
            .entry(addr.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAP).0)
            .clone()
    }

    fn router(&self, addr: &str) -> Option<RequestSender> {
        self.lock().routers.get(addr).cloned()
    }
}

/// In-memory [`Transport`]. One instance per simulated node.
pub struct ChannelTransport {
    hub: ChannelHub,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pub_addr: Option<String>,
    router_addr: Option<String>,
    pub_tx: Option<broadcast::Sender<Frame>>,
    inbound_tx: Option<mpsc::Sender<Frame>>,
    subscriptions: HashMap<String, CancellationToken>,
}

impl ChannelTransport {
    pub fn new(hub: ChannelHub) -> Self {
        Self {
            hub,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn bind(
        &self,
        pub_spec: &str,
        router_spec: &str,
    ) -> Result<(BoundAddrs, Inbound), TransportError> {
        let pub_tx = self.hub.publisher(pub_spec);
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAP);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAP);

        {
            let mut hub = self.hub.lock();
            if hub.routers.contains_key(router_spec) {
                return Err(TransportError::Bind(format!(
                    "router binding {router_spec} already taken"
                )));
            }
            hub.routers.insert(router_spec.to_string(), requests_tx);
        }

        let mut state = self.lock();
        state.pub_addr = Some(pub_spec.to_string());
        state.router_addr = Some(router_spec.to_string());
        state.pub_tx = Some(pub_tx);
        state.inbound_tx = Some(inbound_tx);

        Ok((
            BoundAddrs {
                pub_addr: pub_spec.to_string(),
                router_addr: router_spec.to_string(),
            },
            Inbound {
                frames: inbound_rx,
                requests: requests_rx,
            },
        ))
    }

    async fn publish(&self, frame: &Frame) -> Result<(), TransportError> {
        let tx = self.lock().pub_tx.clone().ok_or(TransportError::Closed)?;
        // No subscribers yet is fine.
        let _ = tx.send(frame.clone());
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerBinding) -> Result<(), TransportError> {
        let (inbound_tx, token) = {
            let mut state = self.lock();
            if state.subscriptions.contains_key(&peer.pub_addr) {
                return Ok(());
            }
            let inbound_tx = state.inbound_tx.clone().ok_or(TransportError::Closed)?;
            let token = CancellationToken::new();
            state
                .subscriptions
                .insert(peer.pub_addr.clone(), token.clone());
            (inbound_tx, token)
        };

        let mut rx = self.hub.publisher(&peer.pub_addr).subscribe();
        let addr = peer.pub_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(peer = %addr, lagged = n, "in-memory subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(())
    }

    async fn unsubscribe(&self, peer: &PeerBinding) {
        if let Some(token) = self.lock().subscriptions.remove(&peer.pub_addr) {
            token.cancel();
        }
    }

    async fn request(&self, peer: &PeerBinding, frame: &Frame) -> Result<Frame, TransportError> {
        let tx = self
            .hub
            .router(&peer.router_addr)
            .ok_or_else(|| TransportError::Peer(format!("no router at {}", peer.router_addr)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((frame.clone(), reply_tx))
            .await
            .map_err(|_| TransportError::Peer(format!("router {} gone", peer.router_addr)))?;

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Peer("request dropped".into())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn shutdown(&self) {
        let (pub_addr, router_addr, tokens) = {
            let mut state = self.lock();
            (
                state.pub_addr.take(),
                state.router_addr.take(),
                std::mem::take(&mut state.subscriptions),
            )
        };
        for (_, token) in tokens {
            token.cancel();
        }
        let mut hub = self.hub.lock();
        if let Some(addr) = pub_addr {
            hub.publishers.remove(&addr);
        }
        if let Some(addr) = router_addr {
            hub.routers.remove(&addr);
        }
    }
}
