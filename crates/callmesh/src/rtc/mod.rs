//! Negotiation capability set
//!
//! The negotiator and the file transport only need a small slice of a WebRTC
//! stack: create a peer, apply and generate descriptions, exchange candidates,
//! open ordered data channels. These traits describe that slice; `webrtc_engine`
//! implements it on top of the `webrtc` crate.

pub mod webrtc_engine;

use crate::session::ConnectionId;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged through `offer`/`answer` signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged through `candidate` signals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Called with each locally gathered candidate
pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// Called with each data channel opened by the remote side
pub type ChannelHandler = Box<dyn Fn(Arc<dyn RtcChannel>) + Send + Sync>;

/// Called once the channel is open (immediately if it already is)
pub type OpenHandler = Box<dyn Fn() + Send + Sync>;

/// Called with each inbound binary frame, in order
pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Factory of peer connections
#[async_trait]
pub trait RtcEngine: Send + Sync + 'static {
    /// Create a fresh peer connection towards `remote`
    async fn create_peer(&self, remote: &ConnectionId) -> Result<Arc<dyn RtcPeer>>;
}

/// One peer connection
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Open an ordered, reliable data channel
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcChannel>>;

    fn on_data_channel(&self, handler: ChannelHandler);

    fn on_ice_candidate(&self, handler: CandidateHandler);

    /// Create an offer or answer and apply it locally
    async fn generate_local_description(&self, kind: SdpKind) -> Result<SessionDescription>;

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One data channel
#[async_trait]
pub trait RtcChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Send one binary frame
    async fn send(&self, frame: Bytes) -> Result<()>;

    fn on_open(&self, handler: OpenHandler);

    fn on_message(&self, handler: MessageHandler);

    async fn close(&self) -> Result<()>;
}
