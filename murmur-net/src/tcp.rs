//! TCP transport.
//!
//! The publisher endpoint accepts follower connections and writes every
//! published frame to each of them; the router endpoint serves framed
//! request/reply exchanges. Followers redial dropped publishers with a
//! capped backoff, so a restarted peer is picked up again without any
//! bookkeeping above this layer.

use crate::{BoundAddrs, Frame, FrameSink, FrameStream, Inbound, Transport, TransportError};
use async_trait::async_trait;
use murmur_model::bindings::resolve_binding;
use murmur_model::config::{DEFAULT_PUB_PORT, DEFAULT_ROUTER_PORT};
use murmur_model::PeerBinding;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAP: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REDIAL_FLOOR: Duration = Duration::from_millis(250);
const REDIAL_CEIL: Duration = Duration::from_secs(5);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

type RequestSender = mpsc::Sender<(Frame, oneshot::Sender<Frame>)>;
type Subscribers = Arc<tokio::sync::Mutex<HashMap<SocketAddr, FrameSink<OwnedWriteHalf>>>>;

pub struct TcpTransport {
    state: Mutex<State>,
    subscribers: Subscribers,
}

struct State {
    inbound_tx: Option<mpsc::Sender<Frame>>,
    subscriptions: HashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                inbound_tx: None,
                subscriptions: HashMap::new(),
                shutdown: CancellationToken::new(),
            }),
            subscribers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn set_keepalive(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "could not enable TCP keepalive");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(
        &self,
        pub_spec: &str,
        router_spec: &str,
    ) -> Result<(BoundAddrs, Inbound), TransportError> {
        let pub_addr = resolve_binding(pub_spec, DEFAULT_PUB_PORT)
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        let router_addr = resolve_binding(router_spec, DEFAULT_ROUTER_PORT)
            .map_err(|e| TransportError::Bind(e.to_string()))?;

        let pub_listener = TcpListener::bind(pub_addr)
            .await
            .map_err(|e| TransportError::Bind(format!("publisher {pub_addr}: {e}")))?;
        let router_listener = TcpListener::bind(router_addr)
            .await
            .map_err(|e| TransportError::Bind(format!("router {router_addr}: {e}")))?;

        let bound = BoundAddrs {
            pub_addr: pub_listener
                .local_addr()
                .map_err(|e| TransportError::Bind(e.to_string()))?
                .to_string(),
            router_addr: router_listener
                .local_addr()
                .map_err(|e| TransportError::Bind(e.to_string()))?
                .to_string(),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAP);
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAP);

        let shutdown = {
            let mut state = self.lock();
            state.inbound_tx = Some(inbound_tx);
            state.shutdown.clone()
        };

        // Publisher accept loop: every follower gets our fan-out writes.
        let subscribers = self.subscribers.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = pub_listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            set_keepalive(&stream);
                            let (_read, write) = stream.into_split();
                            subscribers.lock().await.insert(remote, FrameSink::new(write));
                            tracing::debug!(follower = %remote, "publisher follower connected");
                        }
                        Err(e) => tracing::warn!(error = %e, "publisher accept failed"),
                    },
                }
            }
        });

        // Router accept loop: one framed request/reply exchange at a time
        // per connection.
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = router_listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_router_conn(
                                stream,
                                requests_tx.clone(),
                                token.clone(),
                            ));
                        }
                        Err(e) => tracing::warn!(error = %e, "router accept failed"),
                    },
                }
            }
        });

        Ok((
            bound,
            Inbound {
                frames: inbound_rx,
                requests: requests_rx,
            },
        ))
    }

    async fn publish(&self, frame: &Frame) -> Result<(), TransportError> {
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for (remote, sink) in subs.iter_mut() {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!(follower = %remote, error = %e, "dropping dead follower");
                dead.push(*remote);
            }
        }
        for remote in dead {
            subs.remove(&remote);
        }
        Ok(())
    }

    async fn subscribe(&self, peer: &PeerBinding) -> Result<(), TransportError> {
        let addr: SocketAddr = peer
            .pub_addr
            .parse()
            .map_err(|_| TransportError::Peer(format!("bad publisher address {}", peer.pub_addr)))?;

        let (inbound_tx, token) = {
            let mut state = self.lock();
            if state.subscriptions.contains_key(&peer.pub_addr) {
                return Ok(());
            }
            let inbound_tx = state.inbound_tx.clone().ok_or(TransportError::Closed)?;
            let token = state.shutdown.child_token();
            state
                .subscriptions
                .insert(peer.pub_addr.clone(), token.clone());
            (inbound_tx, token)
        };

        tokio::spawn(async move {
            let mut backoff = REDIAL_FLOOR;
            while !token.is_cancelled() {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        set_keepalive(&stream);
                        backoff = REDIAL_FLOOR;
                        let (read, _write) = stream.into_split();
                        let mut frames = FrameStream::new(read);
                        loop {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                received = frames.recv() => match received {
                                    Ok(Some(frame)) => {
                                        if inbound_tx.send(frame).await.is_err() {
                                            return;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        tracing::debug!(peer = %addr, error = %e, "publisher stream error");
                                        break;
                                    }
                                },
                            }
                        }
                        tracing::debug!(peer = %addr, "publisher stream ended, redialing");
                    }
                    Err(e) => {
                        tracing::debug!(peer = %addr, error = %e, "publisher dial failed");
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(REDIAL_CEIL);
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
        let addr: SocketAddr = peer
            .router_addr
            .parse()
            .map_err(|_| TransportError::Peer(format!("bad router address {}", peer.router_addr)))?;

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Peer(format!("{addr}: {e}")))?;
        set_keepalive(&stream);

        let (read, write) = stream.into_split();
        let mut sink = FrameSink::new(write);
        let mut frames = FrameStream::new(read);

        sink.send(frame).await?;
        match tokio::time::timeout(REQUEST_TIMEOUT, frames.recv()).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(TransportError::Peer("router closed the stream".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn shutdown(&self) {
        let tokens = {
            let mut state = self.lock();
            state.inbound_tx = None;
            state.shutdown.cancel();
            std::mem::take(&mut state.subscriptions)
        };
        for (_, token) in tokens {
            token.cancel();
        }
        self.subscribers.lock().await.clear();
    }
}

async fn serve_router_conn(stream: TcpStream, requests_tx: RequestSender, token: CancellationToken) {
    set_keepalive(&stream);
    let (read, write) = stream.into_split();
    let mut frames = FrameStream::new(read);
    let mut sink = FrameSink::new(write);

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            received = frames.recv() => match received {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "router stream error");
                    break;
                }
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if requests_tx.send((frame, reply_tx)).await.is_err() {
            break;
        }
        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => reply,
            _ => break,
        };
        if sink.send(&reply).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_model::Topic;
    use serde_json::json;

    async fn bound() -> (TcpTransport, BoundAddrs, Inbound) {
        let transport = TcpTransport::new();
        let (addrs, inbound) = transport
            .bind("127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        (transport, addrs, inbound)
    }

    fn binding(addrs: &BoundAddrs) -> PeerBinding {
        PeerBinding {
            pub_addr: addrs.pub_addr.clone(),
            router_addr: addrs.router_addr.clone(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_followers() {
        let (a, a_addrs, _a_in) = bound().await;
        let (b, _b_addrs, mut b_in) = bound().await;

        b.subscribe(&binding(&a_addrs)).await.unwrap();
        // Let the follower connection land before fanning out.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame = Frame::new(Topic::Sync, json!({"event": "validators"}));
        a.publish(&frame).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), b_in.frames.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(frame));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (a, _a_addrs, _a_in) = bound().await;
        let (_b, b_addrs, mut b_in) = bound().await;

        tokio::spawn(async move {
            while let Some((frame, reply)) = b_in.requests.recv().await {
                let _ = reply.send(Frame {
                    topic: frame.topic,
                    payload: json!({"ok": true}),
                });
            }
        });

        let reply = a
            .request(&binding(&b_addrs), &Frame::new(Topic::Ready, json!({})))
            .await
            .unwrap();
        assert_eq!(reply.payload, json!({"ok": true}));

        a.shutdown().await;
    }

    #[tokio::test]
    async fn request_against_nobody_fails() {
        let (a, _a_addrs, _a_in) = bound().await;
        let gone = PeerBinding {
            pub_addr: "127.0.0.1:1".into(),
            router_addr: "127.0.0.1:1".into(),
        };
        assert!(a
            .request(&gone, &Frame::new(Topic::Ready, json!({})))
            .await
            .is_err());
        a.shutdown().await;
    }
}
