//! Offer/answer negotiation over the signal bus
//!
//! Each remote participant gets one peer connection. The end with the lower
//! connection id offers and the other answers, so both ends never offer at once.
//!
//! Offerer: `Created → OfferSent → AnswerReceived → Connected`
//!
//! Answerer: `Created → OfferReceived → AnswerSent → Connected`
//!
//! Candidates are buffered in both directions: remote candidates until the
//! remote description is applied, local candidates until our description has
//! been signalled.

use crate::rtc::{IceCandidate, RtcEngine, RtcPeer, SdpKind, SessionDescription};
use crate::session::ConnectionId;
use crate::signal::{SignalBus, SignalFilter, SignalMessage};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signal type carrying an offer
pub const OFFER_SIGNAL: &str = "offer";

/// Signal type carrying an answer
pub const ANSWER_SIGNAL: &str = "answer";

/// Signal type carrying one ICE candidate
pub const CANDIDATE_SIGNAL: &str = "candidate";

/// Whether `local` initiates negotiation towards `remote`
///
/// Both ends see each other's stream appear; only the lower id offers.
pub fn should_initiate(local: &ConnectionId, remote: &ConnectionId) -> bool {
    local < remote
}

/// Which side of the offer/answer exchange we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Negotiation state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Created,
    OfferSent,
    AnswerReceived,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

impl NegotiationState {
    /// Remote candidates can be applied
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationState::AnswerReceived
                | NegotiationState::OfferReceived
                | NegotiationState::AnswerSent
                | NegotiationState::Connected
        )
    }

    /// Our own description already reached the remote
    pub fn has_signalled_local(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent
                | NegotiationState::AnswerReceived
                | NegotiationState::AnswerSent
                | NegotiationState::Connected
        )
    }
}

struct NegotiationInner {
    state: NegotiationState,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
}

/// One peer connection and its offer/answer progress
pub struct PeerNegotiation {
    remote: ConnectionId,
    role: Role,
    peer: Arc<dyn RtcPeer>,
    bus: SignalBus,
    inner: Mutex<NegotiationInner>,
}

impl PeerNegotiation {
    /// Wrap a fresh peer and start routing its local candidates
    pub fn new(
        remote: ConnectionId,
        role: Role,
        peer: Arc<dyn RtcPeer>,
        bus: SignalBus,
    ) -> Arc<Self> {
        let negotiation = Arc::new(Self {
            remote,
            role,
            peer,
            bus,
            inner: Mutex::new(NegotiationInner {
                state: NegotiationState::Created,
                pending_remote: Vec::new(),
                pending_local: Vec::new(),
            }),
        });

        let weak = Arc::downgrade(&negotiation);
        negotiation
            .peer
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(negotiation) = weak.upgrade() {
                    negotiation.on_local_candidate(candidate);
                }
            }));

        negotiation
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    pub fn peer(&self) -> &Arc<dyn RtcPeer> {
        &self.peer
    }

    /// Mark the data path as usable
    pub fn mark_connected(&self) {
        let mut inner = self.inner.lock();
        if inner.state != NegotiationState::Closed {
            inner.state = NegotiationState::Connected;
        }
    }

    /// Close the underlying peer connection
    pub async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == NegotiationState::Closed {
                return Ok(());
            }
            inner.state = NegotiationState::Closed;
            inner.pending_local.clear();
            inner.pending_remote.clear();
        }
        self.peer.close().await
    }

    /// Apply the remote offer or answer, then any candidates that raced ahead of it
    pub async fn apply_remote(&self, description: SessionDescription) -> Result<()> {
        let expected = match self.role {
            Role::Offerer => SdpKind::Answer,
            Role::Answerer => SdpKind::Offer,
        };
        if description.kind != expected {
            return Err(Error::SdpError(format!(
                "{:?} received an unexpected {:?} from {}",
                self.role, description.kind, self.remote
            )));
        }

        self.peer.apply_remote_description(description).await?;

        let pending = {
            let mut inner = self.inner.lock();
            if inner.state == NegotiationState::Closed {
                return Ok(());
            }
            inner.state = match self.role {
                Role::Offerer => NegotiationState::AnswerReceived,
                Role::Answerer => NegotiationState::OfferReceived,
            };
            std::mem::take(&mut inner.pending_remote)
        };

        for candidate in pending {
            if let Err(e) = self.peer.apply_candidate(candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", self.remote, e);
            }
        }

        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is in place
    pub async fn apply_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == NegotiationState::Closed {
                return Ok(());
            }
            if !inner.state.has_remote_description() {
                debug!("Buffering early candidate from {}", self.remote);
                inner.pending_remote.push(candidate);
                return Ok(());
            }
        }
        self.peer.apply_candidate(candidate).await
    }

    /// Generate our offer or answer and signal it to the remote
    pub async fn signal_local(&self, kind: SdpKind) -> Result<()> {
        let description = self.peer.generate_local_description(kind).await?;
        let signal_type = match kind {
            SdpKind::Offer => OFFER_SIGNAL,
            SdpKind::Answer => ANSWER_SIGNAL,
        };
        self.bus
            .send(signal_type, &description, std::slice::from_ref(&self.remote))
            .await?;

        let pending = {
            let mut inner = self.inner.lock();
            // The answer may already have been applied by the time the send returns
            inner.state = match (inner.state, kind) {
                (NegotiationState::Created, SdpKind::Offer) => NegotiationState::OfferSent,
                (NegotiationState::OfferReceived, SdpKind::Answer) => NegotiationState::AnswerSent,
                (state, _) => state,
            };
            std::mem::take(&mut inner.pending_local)
        };

        debug!("Sent {} to {}", signal_type, self.remote);
        for candidate in pending {
            self.send_candidate(candidate).await;
        }

        Ok(())
    }

    fn on_local_candidate(self: Arc<Self>, candidate: IceCandidate) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                NegotiationState::Closed => return,
                state if !state.has_signalled_local() => {
                    inner.pending_local.push(candidate);
                    return;
                }
                _ => {}
            }
        }

        tokio::spawn(async move {
            self.send_candidate(candidate).await;
        });
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self
            .bus
            .send(CANDIDATE_SIGNAL, &candidate, std::slice::from_ref(&self.remote))
            .await
        {
            warn!("Failed to send candidate to {}: {}", self.remote, e);
        }
    }
}

/// Route `candidate` signals from the negotiation's remote into it
fn route_candidates(bus: &SignalBus, negotiation: &Arc<PeerNegotiation>) {
    bus.on_signal_while(
        Some(CANDIDATE_SIGNAL),
        SignalFilter::From(negotiation.remote().clone()),
        negotiation,
        |negotiation: Arc<PeerNegotiation>, message: SignalMessage| async move {
            let result = match message.decode::<IceCandidate>() {
                Ok(candidate) => negotiation.apply_remote_candidate(candidate).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Dropping candidate from {}: {}", message.from, e);
            }
        },
    );
}

/// Initiating side towards one remote participant
pub struct Offerer {
    bus: SignalBus,
    remote: ConnectionId,
}

impl Offerer {
    pub fn new(bus: SignalBus, remote: ConnectionId) -> Self {
        Self { bus, remote }
    }

    /// Create the peer and wire the answer and candidate routes for it
    pub async fn create_offerer(&self, engine: &dyn RtcEngine) -> Result<Arc<PeerNegotiation>> {
        let peer = engine.create_peer(&self.remote).await?;
        let negotiation =
            PeerNegotiation::new(self.remote.clone(), Role::Offerer, peer, self.bus.clone());

        self.bus.on_signal_while(
            Some(ANSWER_SIGNAL),
            SignalFilter::From(self.remote.clone()),
            &negotiation,
            |negotiation: Arc<PeerNegotiation>, message: SignalMessage| async move {
                let state = negotiation.state();
                if state.has_remote_description() || state == NegotiationState::Closed {
                    debug!(
                        "Ignoring answer from {} in state {:?}",
                        message.from, state
                    );
                    return;
                }
                let result = match message.decode::<SessionDescription>() {
                    Ok(answer) => negotiation.apply_remote(answer).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to apply answer from {}: {}", message.from, e);
                }
            },
        );
        route_candidates(&self.bus, &negotiation);

        Ok(negotiation)
    }

    /// Generate and signal the offer
    pub async fn send_offer(&self, negotiation: &PeerNegotiation) -> Result<()> {
        negotiation.signal_local(SdpKind::Offer).await?;
        info!("Offer sent to {}", self.remote);
        Ok(())
    }
}

/// An offer that could not be answered
pub struct AnswerFailure {
    pub remote: ConnectionId,
    /// The closed negotiation, if the peer had been created
    pub negotiation: Option<Arc<PeerNegotiation>>,
    pub error: Error,
}

/// Called when answering an offer fails
pub type FailureHandler = Arc<dyn Fn(AnswerFailure) + Send + Sync>;

/// Responding side for every remote that offers to us
#[derive(Clone)]
pub struct Answerer {
    bus: SignalBus,
    failure_handler: Arc<RwLock<Option<FailureHandler>>>,
}

impl Answerer {
    pub fn new(bus: SignalBus) -> Self {
        Self {
            bus,
            failure_handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Observe offers that could not be answered
    pub fn on_failure<F>(&self, handler: F)
    where
        F: Fn(AnswerFailure) + Send + Sync + 'static,
    {
        *self.failure_handler.write() = Some(Arc::new(handler));
    }

    /// Answer every incoming offer
    ///
    /// `before_answer` runs after the peer exists and before the answer is
    /// produced, so the caller can attach channel hooks that must not miss events.
    /// When it fails the negotiation is closed and reported to `on_failure`.
    pub fn on_offer<F, Fut>(&self, engine: Arc<dyn RtcEngine>, before_answer: F)
    where
        F: Fn(Arc<PeerNegotiation>, ConnectionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let answerer = self.clone();
        let before_answer = Arc::new(before_answer);
        self.bus.on_signal(
            Some(OFFER_SIGNAL),
            SignalFilter::Any,
            move |message: SignalMessage| {
                let answerer = answerer.clone();
                let engine = Arc::clone(&engine);
                let before_answer = Arc::clone(&before_answer);
                async move {
                    if let Err(failure) = answerer.answer(engine, before_answer, message).await {
                        warn!(
                            "Failed to answer offer from {}: {}",
                            failure.remote, failure.error
                        );
                        let handler = answerer.failure_handler.read().clone();
                        if let Some(handler) = handler {
                            handler(failure);
                        }
                    }
                }
            },
        );
    }

    async fn answer<F, Fut>(
        &self,
        engine: Arc<dyn RtcEngine>,
        before_answer: Arc<F>,
        message: SignalMessage,
    ) -> std::result::Result<(), AnswerFailure>
    where
        F: Fn(Arc<PeerNegotiation>, ConnectionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let remote = message.from.clone();
        let early = |error: Error| AnswerFailure {
            remote: remote.clone(),
            negotiation: None,
            error,
        };
        let offer: SessionDescription = message.decode().map_err(early)?;
        let peer = engine.create_peer(&remote).await.map_err(early)?;

        let negotiation =
            PeerNegotiation::new(remote.clone(), Role::Answerer, peer, self.bus.clone());
        route_candidates(&self.bus, &negotiation);

        let result = async {
            before_answer(Arc::clone(&negotiation), remote.clone()).await?;
            negotiation.apply_remote(offer).await?;
            negotiation.signal_local(SdpKind::Answer).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Answer sent to {}", remote);
                Ok(())
            }
            Err(error) => {
                if let Err(close_err) = negotiation.close().await {
                    debug!("Closing failed peer {}: {}", remote, close_err);
                }
                Err(AnswerFailure {
                    remote,
                    negotiation: Some(negotiation),
                    error,
                })
            }
        }
    }
}
