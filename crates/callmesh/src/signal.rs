//! Typed publish/subscribe over the session's signal channel
//!
//! Many logical channels share one session: every signal carries a type string
//! and a JSON payload. Handlers register for a type (or any type) with a sender
//! filter. A single dispatch task awaits matching handlers in registration order,
//! so handlers observe signals one at a time, in arrival order.

use crate::session::{ConnectionId, RawSignal, Session, SessionEvent};
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Decoded signal handed to handlers
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub signal_type: String,
    pub data: serde_json::Value,
    pub from: ConnectionId,
}

impl SignalMessage {
    /// Decode the payload into a typed structure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::SignalingError(format!(
                "Malformed '{}' payload from {}: {}",
                self.signal_type, self.from, e
            ))
        })
    }
}

/// Which senders a handler accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalFilter {
    /// Every sender, ourselves included
    Any,
    /// Only this sender
    From(ConnectionId),
    /// Every sender except ourselves
    NotOwn,
}

impl SignalFilter {
    fn accepts(&self, from: &ConnectionId, own: &ConnectionId) -> bool {
        match self {
            SignalFilter::Any => true,
            SignalFilter::From(id) => id == from,
            SignalFilter::NotOwn => from != own,
        }
    }
}

/// Callback type for incoming signals
pub type SignalHandler = Arc<dyn Fn(SignalMessage) -> BoxFuture<'static, ()> + Send + Sync>;

type Liveness = Box<dyn Fn() -> bool + Send + Sync>;

struct Subscription {
    signal_type: Option<String>,
    filter: SignalFilter,
    handler: SignalHandler,
    /// Reports whether the owner is still alive; `None` lives forever
    live: Option<Liveness>,
}

impl Subscription {
    fn matches(&self, signal: &RawSignal, own: &ConnectionId) -> bool {
        self.signal_type
            .as_deref()
            .map_or(true, |t| t == signal.signal_type)
            && self.filter.accepts(&signal.from, own)
    }

    fn is_live(&self) -> bool {
        self.live.as_ref().map_or(true, |live| live())
    }
}

/// Signal multiplexer bound to one session
#[derive(Clone)]
pub struct SignalBus {
    session: Arc<dyn Session>,
    subscriptions: Arc<RwLock<Vec<Arc<Subscription>>>>,
}

impl SignalBus {
    /// Subscribe to the session and start dispatching. Requires a tokio runtime.
    pub fn new(session: Arc<dyn Session>) -> Self {
        let subscriptions = Arc::new(RwLock::new(Vec::new()));
        let events = session.subscribe();
        let own = session.connection_id().clone();

        tokio::spawn(dispatch(events, Arc::clone(&subscriptions), own));

        Self {
            session,
            subscriptions,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.session.connection_id()
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Serialize `payload` and send it. Empty `to` broadcasts.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        signal_type: &str,
        payload: &T,
        to: &[ConnectionId],
    ) -> Result<()> {
        let data = serde_json::to_string(payload)?;
        trace!(
            "Sending '{}' signal ({} bytes) to {:?}",
            signal_type,
            data.len(),
            to
        );
        self.session.signal(signal_type, data, to).await
    }

    /// Register a handler. `None` matches every type. Registrations are permanent.
    pub fn on_signal<F, Fut>(&self, signal_type: Option<&str>, filter: SignalFilter, handler: F)
    where
        F: Fn(SignalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: SignalHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.subscriptions.write().push(Arc::new(Subscription {
            signal_type: signal_type.map(str::to_string),
            filter,
            handler,
            live: None,
        }));
    }

    /// Register a handler that lives as long as `owner`
    ///
    /// The bus only keeps a weak reference. The handler is called with the
    /// owner while it is alive, and the registration is pruned once it is dropped.
    pub fn on_signal_while<O, F, Fut>(
        &self,
        signal_type: Option<&str>,
        filter: SignalFilter,
        owner: &Arc<O>,
        handler: F,
    ) where
        O: Send + Sync + 'static,
        F: Fn(Arc<O>, SignalMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(owner);
        let alive = weak.clone();
        let handler: SignalHandler =
            Arc::new(move |message: SignalMessage| -> BoxFuture<'static, ()> {
                match weak.upgrade() {
                    Some(owner) => Box::pin(handler(owner, message)),
                    None => Box::pin(async {}),
                }
            });
        self.subscriptions.write().push(Arc::new(Subscription {
            signal_type: signal_type.map(str::to_string),
            filter,
            handler,
            live: Some(Box::new(move || alive.strong_count() > 0)),
        }));
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    subscriptions: Arc<RwLock<Vec<Arc<Subscription>>>>,
    own: ConnectionId,
) {
    while let Some(event) = events.recv().await {
        let SessionEvent::Signal(signal) = event else {
            continue;
        };

        let data: serde_json::Value = match serde_json::from_str(&signal.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Dropping '{}' signal from {} with malformed payload: {}",
                    signal.signal_type, signal.from, e
                );
                continue;
            }
        };

        prune(&subscriptions);

        // Snapshot so handlers may register more handlers
        let matching: Vec<Arc<Subscription>> = subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(&signal, &own))
            .cloned()
            .collect();

        for subscription in matching {
            (subscription.handler)(SignalMessage {
                signal_type: signal.signal_type.clone(),
                data: data.clone(),
                from: signal.from.clone(),
            })
            .await;
        }
    }

    debug!("Signal dispatch for {} finished", own);
}

/// Drop registrations whose owner is gone
fn prune(subscriptions: &RwLock<Vec<Arc<Subscription>>>) {
    if subscriptions.read().iter().all(|s| s.is_live()) {
        return;
    }
    let mut subscriptions = subscriptions.write();
    let before = subscriptions.len();
    subscriptions.retain(|s| s.is_live());
    trace!("Pruned {} stale signal handlers", before - subscriptions.len());
}
