//! Fan-out over several transports, and local echo of our own messages

use super::{HandlerSet, MessageSystem, ReceiveHandler, ReceivedMessage, Transport};
use crate::session::{ConnectionId, StreamRole};
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;

/// Sends through every constituent and subscribes to all of them
pub struct CompositeTransport<M> {
    transports: Vec<Arc<dyn Transport<M>>>,
}

impl<M> CompositeTransport<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(transports: Vec<Arc<dyn Transport<M>>>) -> Self {
        Self { transports }
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[async_trait]
impl<M> Transport<M> for CompositeTransport<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Completes after every constituent finished; the first error wins
    async fn send(&self, message: M) -> Result<()> {
        let results = join_all(
            self.transports
                .iter()
                .map(|transport| transport.send(message.clone())),
        )
        .await;
        results.into_iter().collect()
    }

    fn on_received(&self, handler: ReceiveHandler<M>) {
        for transport in &self.transports {
            transport.on_received(Arc::clone(&handler));
        }
    }
}

/// Hands our own sends straight to local handlers, tagged as `Publisher`
pub struct OwnMessageRepeater<M> {
    connection_id: ConnectionId,
    handlers: HandlerSet<M>,
}

impl<M: Clone> OwnMessageRepeater<M> {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            handlers: HandlerSet::new(),
        }
    }

    /// Deliver `message` to local handlers before returning
    pub fn repeat(&self, message: M) {
        self.handlers.dispatch(ReceivedMessage {
            custom: message,
            system: MessageSystem {
                from: self.connection_id.clone(),
                stream_role: StreamRole::Publisher,
            },
        });
    }
}

#[async_trait]
impl<M> Transport<M> for OwnMessageRepeater<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn send(&self, message: M) -> Result<()> {
        self.repeat(message);
        Ok(())
    }

    fn on_received(&self, handler: ReceiveHandler<M>) {
        self.handlers.push(handler);
    }
}
