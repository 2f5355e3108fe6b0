//! Per-call wiring of the text and file transports

use crate::backend::TransferLog;
use crate::config::MeshConfig;
use crate::rtc::RtcEngine;
use crate::session::Session;
use crate::signal::SignalBus;
use crate::transport::composite::{CompositeTransport, OwnMessageRepeater};
use crate::transport::file::{DataChannelTransport, FileMessage};
use crate::transport::text::{SignalTextTransport, TextMessage};
use crate::transport::Transport;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Text and file transports of one participant
///
/// Both are composites that also echo the participant's own messages back
/// to local handlers, tagged as `Publisher`.
pub struct CallTransports {
    bus: SignalBus,
    text: CompositeTransport<TextMessage>,
    file: CompositeTransport<FileMessage>,
    files: Arc<DataChannelTransport>,
}

impl CallTransports {
    /// Bind transports to `session`. Call before connecting the session so
    /// no signal is missed.
    pub fn bind(
        session: Arc<dyn Session>,
        engine: Arc<dyn RtcEngine>,
        config: MeshConfig,
        transfer_log: Arc<dyn TransferLog>,
    ) -> Result<Self> {
        let connection_id = session.connection_id().clone();
        let bus = SignalBus::new(Arc::clone(&session));

        let text_transports: Vec<Arc<dyn Transport<TextMessage>>> = vec![
            Arc::new(SignalTextTransport::new(
                bus.clone(),
                Arc::clone(&transfer_log),
            )),
            Arc::new(OwnMessageRepeater::<TextMessage>::new(connection_id.clone())),
        ];

        let files = Arc::new(DataChannelTransport::new(
            session,
            bus.clone(),
            engine,
            config,
            transfer_log,
        )?);
        let file_transports: Vec<Arc<dyn Transport<FileMessage>>> = vec![
            files.clone(),
            Arc::new(OwnMessageRepeater::<FileMessage>::new(connection_id.clone())),
        ];

        info!("Call transports bound for {}", connection_id);

        Ok(Self {
            bus,
            text: CompositeTransport::new(text_transports),
            file: CompositeTransport::new(file_transports),
            files,
        })
    }

    pub fn text(&self) -> &CompositeTransport<TextMessage> {
        &self.text
    }

    pub fn file(&self) -> &CompositeTransport<FileMessage> {
        &self.file
    }

    /// The data-channel transport behind [`file`](Self::file)
    pub fn files(&self) -> &Arc<DataChannelTransport> {
        &self.files
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub async fn shutdown(&self) {
        self.files.shutdown().await;
    }
}
