//! Node-to-node message fabric.
//!
//! Every node exposes two endpoints: a publisher that fans frames out to
//! subscribed peers and a router that answers one-shot requests. Framing
//! is length-delimited JSON. Delivery is at-most-once; loss is tolerated
//! because the coordinator store holds truth and a `state:all` round
//! resynchronizes.

pub mod channel;
pub mod framing;
pub mod tcp;

pub use channel::{ChannelHub, ChannelTransport};
pub use framing::{FrameSink, FrameStream};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use murmur_model::{PeerBinding, Topic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("peer unavailable: {0}")]
    Peer(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

/// One framed message: a topic plus its self-describing payload.
///
/// The topic travels as a string so a node can receive (and ignore) topics
/// it does not know yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.as_str().to_string(),
            payload,
        }
    }

    /// Build a frame from any serializable payload.
    pub fn encode(topic: Topic, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_value(payload)?))
    }

    pub fn topic(&self) -> Option<Topic> {
        Topic::parse(&self.topic)
    }
}

/// Addresses a transport actually bound, as advertised to peers.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundAddrs {
    pub pub_addr: String,
    pub router_addr: String,
}

/// Inbound traffic handed to the node once at bind time: fan-out frames
/// from followed publishers, and router requests awaiting a reply.
pub struct Inbound {
    pub frames: mpsc::Receiver<Frame>,
    pub requests: mpsc::Receiver<(Frame, oneshot::Sender<Frame>)>,
}

/// Transport seam. Production uses [`TcpTransport`]; tests swap in
/// [`ChannelTransport`] to run whole fleets in-process.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind the publisher and router endpoints. Called once.
    async fn bind(
        &self,
        pub_spec: &str,
        router_spec: &str,
    ) -> Result<(BoundAddrs, Inbound), TransportError>;

    /// Fan a frame out to every peer following our publisher.
    async fn publish(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Follow a peer's publisher; its frames arrive on [`Inbound::frames`].
    /// Subscribing twice to the same peer is a no-op.
    async fn subscribe(&self, peer: &PeerBinding) -> Result<(), TransportError>;

    /// Stop following a peer's publisher.
    async fn unsubscribe(&self, peer: &PeerBinding);

    /// One request/reply exchange against a peer's router.
    async fn request(&self, peer: &PeerBinding, frame: &Frame) -> Result<Frame, TransportError>;

    /// Tear down endpoints and every outbound subscription.
    async fn shutdown(&self);
}
