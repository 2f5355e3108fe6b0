//! Session layer contract
//!
//! The session is the shared room every participant of a call is connected to.
//! It can broadcast or address small text signals, knows how many streams are
//! published, and announces streams appearing and disappearing. Everything in
//! this crate is built on top of this contract.

pub mod local;

pub use local::{LocalHub, LocalSession};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Opaque identifier of one participant's connection to the session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a session-assigned identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Whether a message was produced by the local participant or by a remote one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    /// The local participant's own stream
    Publisher,
    /// A remote participant's stream
    Subscriber,
}

/// Signal as delivered by the session, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSignal {
    pub signal_type: String,
    pub data: String,
    pub from: ConnectionId,
}

/// Events published by a session to each subscriber, one at a time and in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A signal addressed to (or broadcast to) this participant
    Signal(RawSignal),
    /// A remote participant's stream became visible
    StreamCreated(ConnectionId),
    /// A remote participant's stream went away
    StreamDestroyed(ConnectionId),
    /// This participant left the session
    Disconnected,
}

/// Capabilities the session layer must provide
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// This participant's connection id
    fn connection_id(&self) -> &ConnectionId;

    /// Number of published streams visible here, including our own
    fn stream_count(&self) -> usize;

    /// Whether `id` is connected right now
    ///
    /// A stream is gone from here before its `StreamDestroyed` is delivered.
    fn is_present(&self, id: &ConnectionId) -> bool;

    /// Send a signal. An empty `to` broadcasts to every participant, the sender included.
    async fn signal(&self, signal_type: &str, data: String, to: &[ConnectionId]) -> Result<()>;

    /// Subscribe to session events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;
}
