//! Call Mesh Test Harness
//!
//! Runs several participants in one process:
//! - `LocalHub` sessions for signaling and stream announcements
//! - An in-memory `RtcEngine` whose data channels open once the offer/answer
//!   exchange completes and deliver frames in order
//! - Recording and failing transfer logs
//!
//! Basic usage pattern:
//!
//! 1. Create a `Mesh`
//! 2. `mesh.join("con_a")` for each participant
//! 3. `wait_all_negotiated(&participants)` before asserting on delivery
//! 4. Read received messages with `next_file()` / `next_text()`

#![allow(dead_code)]

pub mod engine;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callmesh::{
    CallTransports, ConnectionId, Error, FileMessage, LocalHub, LocalSession, MeshConfig,
    ReceivedMessage, Result, Session, TextMessage, TransferLog, TransferRecord, Transport,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub use engine::{MemoryEngine, MemoryNetwork};

/// Default wait for anything asynchronous in tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (safe to call more than once)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("callmesh=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it returns true; panics after [`WAIT`]
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {}", what);
}

/// Wait until every participant has an open channel to every other one
pub async fn wait_all_negotiated(participants: &[&Participant]) {
    wait_until("all channels negotiated", move || async move {
        for participant in participants {
            if !participant.negotiated().await {
                return false;
            }
        }
        true
    })
    .await;
}

// =============================================================================
// Transfer logs
// =============================================================================

/// Keeps every record it is given
#[derive(Default)]
pub struct RecordingLog {
    records: Mutex<Vec<TransferRecord>>,
}

impl RecordingLog {
    pub fn records(&self) -> Vec<TransferRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl TransferLog for RecordingLog {
    async fn record(&self, record: TransferRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Rejects every record
#[derive(Default)]
pub struct FailingLog {
    calls: AtomicUsize,
}

impl FailingLog {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferLog for FailingLog {
    async fn record(&self, _record: TransferRecord) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::BackendError("backend unavailable".to_string()))
    }
}

// =============================================================================
// Participants
// =============================================================================

/// One participant with its transports and receive queues
pub struct Participant {
    pub id: ConnectionId,
    pub session: Arc<LocalSession>,
    pub transports: CallTransports,
    pub engine: Arc<MemoryEngine>,
    files: mpsc::UnboundedReceiver<ReceivedMessage<FileMessage>>,
    texts: mpsc::UnboundedReceiver<ReceivedMessage<TextMessage>>,
}

impl Participant {
    pub fn connect(&self) {
        self.session.connect().expect("session connects");
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Gate of the file transport is open
    pub async fn negotiated(&self) -> bool {
        self.transports.files().all_channels_negotiated().await
    }

    pub async fn counts(&self) -> (usize, usize) {
        let files = self.transports.files();
        (files.peer_count().await, files.channel_count().await)
    }

    pub async fn send_file(&self, message: FileMessage) -> Result<()> {
        self.transports.file().send(message).await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.transports.text().send(TextMessage::new(text)).await
    }

    /// Next received file (own echoes included); panics after [`WAIT`]
    pub async fn next_file(&mut self) -> ReceivedMessage<FileMessage> {
        tokio::time::timeout(WAIT, self.files.recv())
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for a file", self.id))
            .expect("file handler alive")
    }

    /// Next received text (own echoes included); panics after [`WAIT`]
    pub async fn next_text(&mut self) -> ReceivedMessage<TextMessage> {
        tokio::time::timeout(WAIT, self.texts.recv())
            .await
            .unwrap_or_else(|_| panic!("{} timed out waiting for a text", self.id))
            .expect("text handler alive")
    }

    /// Next file sent by someone else, skipping our own echoes
    pub async fn next_remote_file(&mut self) -> ReceivedMessage<FileMessage> {
        loop {
            let message = self.next_file().await;
            if message.system.from != self.id {
                return message;
            }
        }
    }

    /// Files received so far, without waiting
    pub fn drain_files(&mut self) -> Vec<ReceivedMessage<FileMessage>> {
        let mut received = Vec::new();
        while let Ok(message) = self.files.try_recv() {
            received.push(message);
        }
        received
    }

    pub fn drain_texts(&mut self) -> Vec<ReceivedMessage<TextMessage>> {
        let mut received = Vec::new();
        while let Ok(message) = self.texts.try_recv() {
            received.push(message);
        }
        received
    }
}

/// Builds participants that share one hub and one in-memory network
#[derive(Clone)]
pub struct Mesh {
    pub hub: LocalHub,
    pub network: MemoryNetwork,
    config: MeshConfig,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    pub fn with_config(config: MeshConfig) -> Self {
        init_test_tracing();
        Self {
            hub: LocalHub::new(),
            network: MemoryNetwork::new(),
            config,
        }
    }

    /// Bind a participant without connecting it
    pub fn participant(&self, id: &str, log: Arc<dyn TransferLog>) -> Participant {
        let session = self.hub.session(id);
        let engine = Arc::new(MemoryEngine::new(&self.network, id));
        let transports = CallTransports::bind(
            session.clone(),
            engine.clone(),
            self.config.clone(),
            log,
        )
        .expect("transports bind");

        let (file_tx, files) = mpsc::unbounded_channel();
        transports
            .file()
            .on_received(Arc::new(move |message: ReceivedMessage<FileMessage>| {
                let _ = file_tx.send(message);
            }));

        let (text_tx, texts) = mpsc::unbounded_channel();
        transports
            .text()
            .on_received(Arc::new(move |message: ReceivedMessage<TextMessage>| {
                let _ = text_tx.send(message);
            }));

        Participant {
            id: session.connection_id().clone(),
            session,
            transports,
            engine,
            files,
            texts,
        }
    }

    /// Bind and connect a participant with a no-op transfer log
    pub fn join(&self, id: &str) -> Participant {
        let participant = self.participant(id, Arc::new(callmesh::NoopTransferLog));
        participant.connect();
        participant
    }

    /// Bind and connect a participant that records its transfers
    pub fn join_recording(&self, id: &str) -> (Participant, Arc<RecordingLog>) {
        let log = Arc::new(RecordingLog::default());
        let participant = self.participant(id, log.clone());
        participant.connect();
        (participant, log)
    }
}
