//! Text messages over plain broadcast signals

use super::{MessageSystem, ReceiveHandler, ReceivedMessage, Transport};
use crate::backend::{spawn_record, TransferLog, TransferRecord};
use crate::session::StreamRole;
use crate::signal::{SignalBus, SignalFilter};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Signal type carrying a text message
pub const TEXT_SIGNAL: &str = "text";

/// A chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
    pub time: DateTime<Utc>,
}

impl TextMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            time: Utc::now(),
        }
    }
}

/// Broadcasts text as `text` signals; never reports our own messages back
pub struct SignalTextTransport {
    bus: SignalBus,
    transfer_log: Arc<dyn TransferLog>,
}

impl SignalTextTransport {
    pub fn new(bus: SignalBus, transfer_log: Arc<dyn TransferLog>) -> Self {
        Self { bus, transfer_log }
    }
}

#[async_trait]
impl Transport<TextMessage> for SignalTextTransport {
    async fn send(&self, message: TextMessage) -> Result<()> {
        let from = self.bus.connection_id().clone();
        let envelope = ReceivedMessage {
            custom: message,
            system: MessageSystem {
                from: from.clone(),
                stream_role: StreamRole::Subscriber,
            },
        };

        self.bus.send(TEXT_SIGNAL, &envelope, &[]).await?;
        debug!("Text message broadcast by {}", from);

        spawn_record(
            &self.transfer_log,
            TransferRecord::text(&envelope.custom, from),
        );
        Ok(())
    }

    fn on_received(&self, handler: ReceiveHandler<TextMessage>) {
        self.bus
            .on_signal(Some(TEXT_SIGNAL), SignalFilter::NotOwn, move |message| {
                let handler = Arc::clone(&handler);
                async move {
                    match message.decode::<ReceivedMessage<TextMessage>>() {
                        Ok(received) => handler(received),
                        Err(e) => warn!("Dropping text message: {}", e),
                    }
                }
            });
    }
}
