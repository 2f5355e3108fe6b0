//! File transport over ordered data channels
//!
//! Every remote participant gets one peer connection carrying one ordered,
//! reliable data channel. Outgoing files are queued and the queue is drained
//! only while every visible remote has an open channel, so a file reaches
//! everybody present or stays queued. Drains never overlap.

use super::frame::{split_chunks, FileAssembler, FileMetadata, WireFrame};
use super::{HandlerSet, MessageSystem, ReceiveHandler, ReceivedMessage, Transport};
use crate::backend::{spawn_record, TransferLog, TransferRecord};
use crate::config::MeshConfig;
use crate::negotiation::{should_initiate, AnswerFailure, Answerer, Offerer, PeerNegotiation};
use crate::registry::PeerRegistry;
use crate::rtc::{RtcChannel, RtcEngine};
use crate::session::{ConnectionId, Session, SessionEvent, StreamRole};
use crate::signal::SignalBus;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// File contents plus the attributes carried in its metadata frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FilePayload {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A file as sent and received through the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    pub file: FilePayload,
    pub time: DateTime<Utc>,
}

impl FileMessage {
    /// Stamp `file` with the current time
    pub fn new(file: FilePayload) -> Self {
        Self {
            file,
            time: Utc::now(),
        }
    }
}

/// Transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub files_sent: u64,
    pub files_received: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub drains_started: u64,
    pub drains_completed: u64,
}

#[derive(Default)]
struct StatsCounters {
    files_sent: AtomicU64,
    files_received: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    drains_started: AtomicU64,
    drains_completed: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            files_sent: self.files_sent.load(Ordering::Relaxed),
            files_received: self.files_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            drains_started: self.drains_started.load(Ordering::Relaxed),
            drains_completed: self.drains_completed.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    session: Arc<dyn Session>,
    bus: SignalBus,
    engine: Arc<dyn RtcEngine>,
    config: MeshConfig,
    transfer_log: Arc<dyn TransferLog>,
    registry: PeerRegistry,
    queue: Mutex<VecDeque<FileMessage>>,
    draining: AtomicBool,
    handlers: Arc<HandlerSet<FileMessage>>,
    stats: Arc<StatsCounters>,
}

/// Clears the drain flag when a drain ends, whatever way it ends
struct DrainGuard<'a> {
    inner: &'a Inner,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .stats
            .drains_completed
            .fetch_add(1, Ordering::Relaxed);
        self.inner.draining.store(false, Ordering::Release);
    }
}

/// Chunked file transfer to every other participant
pub struct DataChannelTransport {
    inner: Arc<Inner>,
}

impl DataChannelTransport {
    /// Wire the transport into the session and bus. Requires a tokio runtime.
    pub fn new(
        session: Arc<dyn Session>,
        bus: SignalBus,
        engine: Arc<dyn RtcEngine>,
        config: MeshConfig,
        transfer_log: Arc<dyn TransferLog>,
    ) -> Result<Self> {
        config.validate()?;

        let events = session.subscribe();
        let inner = Arc::new(Inner {
            session,
            bus,
            engine,
            config,
            transfer_log,
            registry: PeerRegistry::new(),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            handlers: Arc::new(HandlerSet::new()),
            stats: Arc::new(StatsCounters::default()),
        });

        Inner::register_answerer(&inner);
        tokio::spawn(run_lifecycle(Arc::downgrade(&inner), events));

        Ok(Self { inner })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.session.connection_id()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.counts().await.0
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.registry.counts().await.1
    }

    /// Whether every visible remote has a peer and an open channel
    pub async fn all_channels_negotiated(&self) -> bool {
        self.inner.all_channels_negotiated().await
    }

    /// Negotiation towards `remote`, if any
    pub async fn negotiation(&self, remote: &ConnectionId) -> Option<Arc<PeerNegotiation>> {
        self.inner.registry.peer(remote).await
    }

    /// Files waiting to be sent
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    /// Try to send queued files now
    pub async fn process_queue(&self) -> Result<()> {
        self.inner.process_queue().await
    }

    /// Close every peer and channel. Also runs when the session disconnects.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

#[async_trait]
impl Transport<FileMessage> for DataChannelTransport {
    /// Enqueue the file and drain if possible
    ///
    /// Resolves once the file is queued when the drain cannot start (peers
    /// still negotiating or another drain running), or once the drain it
    /// started has finished.
    async fn send(&self, message: FileMessage) -> Result<()> {
        debug!(
            "Queueing {} ({} bytes)",
            message.file.name,
            message.file.size()
        );
        self.inner.queue.lock().push_back(message);
        self.inner.process_queue().await
    }

    fn on_received(&self, handler: ReceiveHandler<FileMessage>) {
        self.inner.handlers.push(handler);
    }
}

impl Inner {
    fn own_id(&self) -> &ConnectionId {
        self.session.connection_id()
    }

    fn register_answerer(inner: &Arc<Self>) {
        let answerer = Answerer::new(inner.bus.clone());

        let weak = Arc::downgrade(inner);
        answerer.on_failure(move |failure: AnswerFailure| {
            let Some(negotiation) = failure.negotiation else {
                return;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!(
                "Dropping peer {} after failed answer: {}",
                failure.remote, failure.error
            );
            tokio::spawn(async move {
                inner.registry.remove_peer(&negotiation).await;
            });
        });

        let weak = Arc::downgrade(inner);
        answerer.on_offer(Arc::clone(&inner.engine), move |negotiation, remote| {
            let weak = weak.clone();
            async move {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| Error::SessionError("transport dropped".to_string()))?;
                inner.registry.insert_peer(Arc::clone(&negotiation)).await?;

                // A departure before the insert found nothing to close
                if !inner.session.is_present(&remote) {
                    inner.registry.remove_peer(&negotiation).await;
                    return Err(Error::PeerNotFound(format!(
                        "{} left before the answer",
                        remote
                    )));
                }

                let weak = Arc::downgrade(&inner);
                let owner = Arc::downgrade(&negotiation);
                let label = inner.config.channel_label.clone();
                let hook = move |channel: Arc<dyn RtcChannel>| {
                    if channel.label() != label {
                        debug!("Ignoring data channel '{}' from {}", channel.label(), remote);
                        return;
                    }
                    if let (Some(inner), Some(negotiation)) = (weak.upgrade(), owner.upgrade()) {
                        Inner::init_data_channel(&inner, channel, &negotiation);
                    }
                };
                negotiation.peer().on_data_channel(Box::new(hook));
                Ok(())
            }
        });
    }

    async fn handle_stream_created(self: &Arc<Self>, remote: ConnectionId) -> Result<()> {
        if &remote == self.own_id() {
            return Ok(());
        }
        if !should_initiate(self.own_id(), &remote) {
            debug!("Waiting for offer from {}", remote);
            return Ok(());
        }

        let offerer = Offerer::new(self.bus.clone(), remote.clone());
        let negotiation = offerer.create_offerer(self.engine.as_ref()).await?;
        if let Err(e) = self.registry.insert_peer(Arc::clone(&negotiation)).await {
            let _ = negotiation.close().await;
            return Err(e);
        }

        let result = async {
            let channel = negotiation
                .peer()
                .create_data_channel(&self.config.channel_label)
                .await?;
            Inner::init_data_channel(self, channel, &negotiation);
            offerer.send_offer(&negotiation).await
        }
        .await;

        if result.is_err() {
            self.registry.remove_peer(&negotiation).await;
        }
        result
    }

    /// Hook up reassembly and the open handler of a fresh channel
    fn init_data_channel(
        inner: &Arc<Self>,
        channel: Arc<dyn RtcChannel>,
        negotiation: &Arc<PeerNegotiation>,
    ) {
        let remote = negotiation.remote().clone();
        let assembler = Mutex::new(FileAssembler::new());
        let handlers = Arc::clone(&inner.handlers);
        let stats = Arc::clone(&inner.stats);
        let from = remote.clone();
        channel.on_message(Box::new(move |frame: Bytes| {
            let frame = match WireFrame::decode(&frame) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping frame from {}: {}", from, e);
                    return;
                }
            };
            let Some(file) = assembler.lock().push(frame) else {
                return;
            };

            info!("File received from {}: {}", from, file.metadata.name);
            stats.files_received.fetch_add(1, Ordering::Relaxed);
            let metadata = file.metadata;
            handlers.dispatch(ReceivedMessage {
                custom: FileMessage {
                    file: FilePayload {
                        name: metadata.name,
                        mime_type: metadata.mime_type,
                        data: file.data,
                    },
                    time: metadata.time,
                },
                system: metadata.system,
            });
        }));

        let weak_inner = Arc::downgrade(inner);
        let weak_channel: Weak<dyn RtcChannel> = Arc::downgrade(&channel);
        let weak_negotiation = Arc::downgrade(negotiation);
        channel.on_open(Box::new(move || {
            let (Some(inner), Some(channel)) = (weak_inner.upgrade(), weak_channel.upgrade())
            else {
                return;
            };
            let negotiation = weak_negotiation.upgrade();
            let remote = remote.clone();
            tokio::spawn(async move {
                match negotiation {
                    Some(negotiation) => inner.install_channel(negotiation, channel).await,
                    None => {
                        debug!("Closing channel to {} opened after its peer was dropped", remote);
                        let _ = channel.close().await;
                    }
                }
            });
        }));
    }

    async fn install_channel(
        &self,
        negotiation: Arc<PeerNegotiation>,
        channel: Arc<dyn RtcChannel>,
    ) {
        let remote = negotiation.remote();
        if !self
            .registry
            .install_channel(&negotiation, Arc::clone(&channel))
            .await
        {
            debug!("Closing channel to departed or replaced peer {}", remote);
            let _ = channel.close().await;
            return;
        }

        info!("Data channel to {} open", remote);
        if let Err(e) = self.process_queue().await {
            warn!("Queued file transfer failed: {}", e);
        }
    }

    async fn all_channels_negotiated(&self) -> bool {
        let expected = self.session.stream_count().saturating_sub(1);
        let (peers, channels) = self.registry.counts().await;
        expected > 0 && peers == expected && channels == expected
    }

    async fn process_queue(&self) -> Result<()> {
        loop {
            let empty = self.queue.lock().is_empty();
            if empty || !self.all_channels_negotiated().await {
                return Ok(());
            }
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Drain already in progress");
                return Ok(());
            }

            self.stats.drains_started.fetch_add(1, Ordering::Relaxed);
            let _guard = DrainGuard { inner: self };
            info!("Processing file queue...");

            loop {
                let next = self.queue.lock().pop_front();
                let Some(message) = next else {
                    break;
                };
                if let Err(e) = self.send_file(message).await {
                    error!("File transfer failed: {}", e);
                    return Err(e);
                }
            }
            // Guard dropped here; re-check for files queued during the last pop
        }
    }

    async fn send_file(&self, message: FileMessage) -> Result<()> {
        let channels = self.registry.channels().await;
        let file = message.file;
        let metadata = FileMetadata {
            transfer_id: Uuid::new_v4(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size(),
            time: message.time,
            system: MessageSystem {
                from: self.own_id().clone(),
                stream_role: StreamRole::Subscriber,
            },
        };

        let mut frames = vec![WireFrame::Metadata(metadata.clone()).encode()?];
        for (seq, data) in split_chunks(&file.data, self.config.chunk_size).enumerate() {
            frames.push(
                WireFrame::Chunk {
                    transfer_id: metadata.transfer_id,
                    seq: seq as u32,
                    data,
                }
                .encode()?,
            );
        }
        let frame_bytes: u64 = frames.iter().map(|f| f.len() as u64).sum();

        for (remote, channel) in &channels {
            for frame in &frames {
                channel.send(frame.clone()).await?;
            }
            self.stats
                .frames_sent
                .fetch_add(frames.len() as u64, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(frame_bytes, Ordering::Relaxed);
            debug!("{} sent to {} in {} frames", file.name, remote, frames.len());

            spawn_record(
                &self.transfer_log,
                TransferRecord::file(&metadata, self.own_id().clone()),
            );
        }

        self.stats.files_sent.fetch_add(1, Ordering::Relaxed);
        info!("File sent: {} to {} peers", file.name, channels.len());
        Ok(())
    }

    async fn close_peer(&self, remote: &ConnectionId) {
        if self.registry.remove(remote).await {
            info!("Peer {} removed", remote);
        }
    }

    async fn shutdown(&self) {
        self.registry.shutdown().await;

        let (peers, channels) = self.registry.counts().await;
        if peers != 0 || channels != 0 {
            error!(
                "Peers left after shutdown: {} peers, {} channels",
                peers, channels
            );
            debug_assert!(false, "registry not empty after shutdown");
        }
    }
}

async fn run_lifecycle(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        match event {
            SessionEvent::StreamCreated(remote) => {
                if let Err(e) = inner.handle_stream_created(remote.clone()).await {
                    warn!("Negotiation with {} failed: {}", remote, e);
                }
            }
            SessionEvent::StreamDestroyed(remote) => {
                inner.close_peer(&remote).await;
                // The gate may hold now that the departed stream is gone
                if let Err(e) = inner.process_queue().await {
                    warn!("Queued file transfer failed: {}", e);
                }
            }
            SessionEvent::Disconnected => {
                inner.shutdown().await;
                break;
            }
            SessionEvent::Signal(_) => {}
        }
    }
    debug!("File transport lifecycle finished");
}
