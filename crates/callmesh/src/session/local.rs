//! In-process session hub
//!
//! Every `LocalSession` created from the same `LocalHub` behaves like one
//! participant of a shared call: signals are routed through the hub and stream
//! announcements are produced on connect and disconnect.

use super::{ConnectionId, RawSignal, Session, SessionEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

type Subscribers = Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>;

/// Shared room that routes signals between local sessions
#[derive(Clone, Default)]
pub struct LocalHub {
    members: Arc<Mutex<BTreeMap<ConnectionId, Arc<Subscribers>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `id`. It joins the room on `connect()`.
    pub fn session(&self, id: impl Into<ConnectionId>) -> Arc<LocalSession> {
        Arc::new(LocalSession {
            id: id.into(),
            hub: self.clone(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(false),
        })
    }

    /// Number of connected sessions
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    fn deliver(subscribers: &Subscribers, event: &SessionEvent) {
        subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// One participant's view of a `LocalHub`
pub struct LocalSession {
    id: ConnectionId,
    hub: LocalHub,
    subscribers: Arc<Subscribers>,
    connected: AtomicBool,
}

impl LocalSession {
    /// Join the room, announcing streams in both directions
    pub fn connect(&self) -> Result<()> {
        let mut members = self.hub.members.lock();
        if members.contains_key(&self.id) {
            return Err(Error::SessionError(format!(
                "{} is already connected",
                self.id
            )));
        }

        let joined = SessionEvent::StreamCreated(self.id.clone());
        for (other, subscribers) in members.iter() {
            LocalHub::deliver(subscribers, &joined);
            LocalHub::deliver(
                &self.subscribers,
                &SessionEvent::StreamCreated(other.clone()),
            );
        }
        members.insert(self.id.clone(), Arc::clone(&self.subscribers));
        self.connected.store(true, Ordering::SeqCst);

        info!("{} joined session ({} streams)", self.id, members.len());
        Ok(())
    }

    /// Leave the room. Remaining members see the stream destroyed.
    pub fn disconnect(&self) {
        let mut members = self.hub.members.lock();
        if members.remove(&self.id).is_none() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);

        let left = SessionEvent::StreamDestroyed(self.id.clone());
        for subscribers in members.values() {
            LocalHub::deliver(subscribers, &left);
        }
        LocalHub::deliver(&self.subscribers, &SessionEvent::Disconnected);

        info!("{} left session ({} streams)", self.id, members.len());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for LocalSession {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn stream_count(&self) -> usize {
        if self.is_connected() {
            self.hub.member_count()
        } else {
            0
        }
    }

    fn is_present(&self, id: &ConnectionId) -> bool {
        self.is_connected() && self.hub.members.lock().contains_key(id)
    }

    async fn signal(&self, signal_type: &str, data: String, to: &[ConnectionId]) -> Result<()> {
        let members = self.hub.members.lock();
        if !members.contains_key(&self.id) {
            return Err(Error::SessionError(format!(
                "{} is not connected",
                self.id
            )));
        }

        let event = SessionEvent::Signal(RawSignal {
            signal_type: signal_type.to_string(),
            data,
            from: self.id.clone(),
        });

        if to.is_empty() {
            for subscribers in members.values() {
                LocalHub::deliver(subscribers, &event);
            }
        } else {
            for recipient in to {
                match members.get(recipient) {
                    Some(subscribers) => LocalHub::deliver(subscribers, &event),
                    None => debug!("Dropping '{}' signal for absent {}", signal_type, recipient),
                }
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Late subscribers still learn about streams already present
        let members = self.hub.members.lock();
        if members.contains_key(&self.id) {
            for other in members.keys().filter(|id| **id != self.id) {
                let _ = tx.send(SessionEvent::StreamCreated(other.clone()));
            }
        }
        self.subscribers.lock().push(tx);

        rx
    }
}
