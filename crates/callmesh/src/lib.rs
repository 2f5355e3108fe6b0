//! Peer-to-peer signaling multiplexer and data-channel file transfer for multi-party calls
//!
//! Participants of a call already share a session layer that can broadcast small
//! signals and announce when peers join or leave. This crate builds on top of it:
//!
//! - A typed signal bus that multiplexes many logical channels over one session
//! - Offer/answer negotiation of one WebRTC peer connection per remote participant
//! - A file transport that chunks files over ordered data channels and queues
//!   them until every visible peer is reachable
//! - A text transport over plain signals, and a composite that fans one send out
//!   to several transports while echoing the sender's own messages locally
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CallTransports                       │
//! │  ┌────────────────────────┐  ┌─────────────────────────┐ │
//! │  │ CompositeTransport     │  │ CompositeTransport      │ │
//! │  │  SignalTextTransport   │  │  DataChannelTransport   │ │
//! │  │  OwnMessageRepeater    │  │  OwnMessageRepeater     │ │
//! │  └───────────┬────────────┘  └────────────┬────────────┘ │
//! └──────────────┼────────────────────────────┼──────────────┘
//!                │                            │
//!         ┌──────▼──────┐          ┌──────────▼───────────┐
//!         │  SignalBus  │◄─────────┤ Offerer / Answerer   │
//!         └──────┬──────┘          │ PeerRegistry         │
//!                │                 └──────────┬───────────┘
//!         ┌──────▼──────┐          ┌──────────▼───────────┐
//!         │   Session   │          │ RtcEngine (webrtc)   │
//!         └─────────────┘          └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use callmesh::{
//!     CallTransports, FileMessage, FilePayload, LocalHub, MeshConfig, NoopTransferLog,
//!     Transport, WebRtcEngine,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> callmesh::Result<()> {
//! let config = MeshConfig::default();
//! let hub = LocalHub::new();
//! let session = hub.session("alice");
//!
//! let transports = CallTransports::bind(
//!     session.clone(),
//!     Arc::new(WebRtcEngine::new(&config)),
//!     config,
//!     Arc::new(NoopTransferLog),
//! )?;
//! session.connect()?;
//!
//! let file = FilePayload::new("notes.txt", "text/plain", b"hello".to_vec());
//! transports.file().send(FileMessage::new(file)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod call;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod registry;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod transport;

pub use backend::{
    spawn_record, transfer_log_from_config, HttpTransferLog, MessageType, NoopTransferLog,
    TransferLog, TransferRecord, TypeDetail,
};
pub use call::CallTransports;
pub use config::{MeshConfig, TurnServerConfig, DEFAULT_CHUNK_SIZE};
pub use error::{Error, Result};
pub use negotiation::{
    should_initiate, AnswerFailure, Answerer, NegotiationState, Offerer, PeerNegotiation, Role,
};
pub use registry::PeerRegistry;
pub use rtc::webrtc_engine::WebRtcEngine;
pub use rtc::{IceCandidate, RtcChannel, RtcEngine, RtcPeer, SdpKind, SessionDescription};
pub use session::{ConnectionId, LocalHub, LocalSession, RawSignal, Session, SessionEvent, StreamRole};
pub use signal::{SignalBus, SignalFilter, SignalMessage};
pub use transport::composite::{CompositeTransport, OwnMessageRepeater};
pub use transport::file::{DataChannelTransport, FileMessage, FilePayload, TransportStats};
pub use transport::text::{SignalTextTransport, TextMessage};
pub use transport::{MessageSystem, ReceiveHandler, ReceivedMessage, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the library version
pub fn version() -> &'static str {
    VERSION
}
