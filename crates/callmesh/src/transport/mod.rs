//! Message transports
//!
//! A transport sends one kind of message to every other participant and
//! invokes receive handlers with the message plus who produced it.

pub mod composite;
pub mod file;
pub mod frame;
pub mod text;

use crate::session::{ConnectionId, StreamRole};
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Producer of a received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSystem {
    pub from: ConnectionId,
    pub stream_role: StreamRole,
}

/// A message as handed to receive handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedMessage<M> {
    pub custom: M,
    pub system: MessageSystem,
}

/// Callback type for received messages
pub type ReceiveHandler<M> = Arc<dyn Fn(ReceivedMessage<M>) + Send + Sync>;

/// Sends messages of type `M` and reports received ones
#[async_trait]
pub trait Transport<M: Send + 'static>: Send + Sync {
    async fn send(&self, message: M) -> Result<()>;

    fn on_received(&self, handler: ReceiveHandler<M>);
}

/// Registered receive handlers, called in registration order
pub(crate) struct HandlerSet<M> {
    handlers: RwLock<Vec<ReceiveHandler<M>>>,
}

impl<M: Clone> HandlerSet<M> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, handler: ReceiveHandler<M>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn dispatch(&self, message: ReceivedMessage<M>) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_message_system_wire_shape() {
        let system = MessageSystem {
            from: "con_a".into(),
            stream_role: StreamRole::Subscriber,
        };
        assert_eq!(
            serde_json::to_value(&system).unwrap(),
            serde_json::json!({"from": "con_a", "streamRole": "subscriber"})
        );
    }

    #[test]
    fn test_handler_set_calls_every_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handlers = HandlerSet::<String>::new();
        for _ in 0..3 {
            let calls = calls.clone();
            handlers.push(Arc::new(move |_: ReceivedMessage<String>| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        handlers.dispatch(ReceivedMessage {
            custom: "hi".to_string(),
            system: MessageSystem {
                from: "con_a".into(),
                stream_role: StreamRole::Publisher,
            },
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
