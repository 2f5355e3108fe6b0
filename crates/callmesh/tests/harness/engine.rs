//! In-memory peer connections
//!
//! A `MemoryNetwork` is shared by every participant of a test. The answering
//! peer registers itself when it generates its answer; the offering peer looks
//! it up when the answer is applied, pairs each of its data channels with a
//! twin on the answering side, hands the twin to the answerer's
//! `on_data_channel` handler, and opens both ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use callmesh::rtc::{CandidateHandler, ChannelHandler, MessageHandler, OpenHandler};
use callmesh::{
    ConnectionId, Error, IceCandidate, Result, RtcChannel, RtcEngine, RtcPeer, SdpKind,
    SessionDescription,
};
use parking_lot::Mutex;
use tracing::debug;

/// Answering peers, keyed by (answerer, offerer)
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    answerers: Arc<Mutex<HashMap<(ConnectionId, ConnectionId), Weak<MemoryPeer>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, peer: &Arc<MemoryPeer>) {
        self.answerers.lock().insert(
            (peer.local.clone(), peer.remote.clone()),
            Arc::downgrade(peer),
        );
    }

    fn answerer(&self, local: &ConnectionId, remote: &ConnectionId) -> Option<Arc<MemoryPeer>> {
        self.answerers
            .lock()
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade)
    }
}

/// Shared per-frame send latency of one engine's channels
type SendDelay = Arc<Mutex<Duration>>;

/// `RtcEngine` for one participant
pub struct MemoryEngine {
    network: MemoryNetwork,
    local: ConnectionId,
    peers: Mutex<Vec<Arc<MemoryPeer>>>,
    fail_create: AtomicBool,
    create_delay: Mutex<Duration>,
    creations: AtomicUsize,
    send_delay: SendDelay,
}

impl MemoryEngine {
    pub fn new(network: &MemoryNetwork, local: &str) -> Self {
        Self {
            network: network.clone(),
            local: local.into(),
            peers: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            creations: AtomicUsize::new(0),
            send_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Make every following `create_peer` fail
    pub fn fail_peer_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every following `create_peer` take `delay`
    pub fn delay_peer_creation(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// Calls to `create_peer` so far, including ones still in progress
    pub fn creations_started(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Make every frame sent on this engine's channels take `delay`
    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    /// Every peer this engine has created
    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.peers.lock().clone()
    }

    /// Peers created towards `remote`
    pub fn peers_to(&self, remote: &str) -> Vec<Arc<MemoryPeer>> {
        let remote = ConnectionId::from(remote);
        self.peers
            .lock()
            .iter()
            .filter(|peer| peer.remote == remote)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RtcEngine for MemoryEngine {
    async fn create_peer(&self, remote: &ConnectionId) -> Result<Arc<dyn RtcPeer>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::PeerConnectionError(
                "peer creation disabled".to_string(),
            ));
        }

        let peer = MemoryPeer::new(
            self.network.clone(),
            self.local.clone(),
            remote.clone(),
            Arc::clone(&self.send_delay),
        );
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerState {
    remote_set: bool,
    closed: bool,
    /// Channels we created; paired when the answer arrives
    channels: Vec<Arc<MemoryChannel>>,
    /// Twins waiting for an `on_data_channel` handler
    inbound: Vec<Arc<MemoryChannel>>,
}

pub struct MemoryPeer {
    me: Weak<MemoryPeer>,
    network: MemoryNetwork,
    pub local: ConnectionId,
    pub remote: ConnectionId,
    state: Mutex<PeerState>,
    candidate_handler: Mutex<Option<CandidateHandler>>,
    channel_handler: Mutex<Option<ChannelHandler>>,
    candidates_applied: AtomicUsize,
    send_delay: SendDelay,
}

impl MemoryPeer {
    fn new(
        network: MemoryNetwork,
        local: ConnectionId,
        remote: ConnectionId,
        send_delay: SendDelay,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            local,
            remote,
            send_delay,
            state: Mutex::new(PeerState::default()),
            candidate_handler: Mutex::new(None),
            channel_handler: Mutex::new(None),
            candidates_applied: AtomicUsize::new(0),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn candidates_applied(&self) -> usize {
        self.candidates_applied.load(Ordering::SeqCst)
    }

    /// Emit one local candidate from a separate task, like a real ICE agent
    fn gather_candidate(&self) {
        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(peer) = me.upgrade() else {
                return;
            };
            let candidate = IceCandidate {
                candidate: format!("candidate:1 1 udp 1 {} 9 typ host", peer.local),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            let handler = peer.candidate_handler.lock();
            if let Some(handler) = handler.as_ref() {
                handler(candidate);
            };
        });
    }

    /// Give `channel` to the `on_data_channel` handler, or park it
    fn deliver_channel(&self, channel: Arc<MemoryChannel>) {
        let handler = self.channel_handler.lock();
        match handler.as_ref() {
            Some(handler) => handler(channel as Arc<dyn RtcChannel>),
            None => self.state.lock().inbound.push(channel),
        }
    }

    /// Pair our channels with twins on `answerer` and open both ends
    fn connect_to(&self, answerer: &MemoryPeer) {
        let channels = self.state.lock().channels.clone();
        for channel in channels {
            let twin = MemoryChannel::new(channel.label(), Arc::clone(&answerer.send_delay));
            channel.link(&twin);
            twin.link(&channel);

            answerer.deliver_channel(twin.clone());
            channel.open();
            twin.open();
        }
        debug!("Memory link {} <-> {} up", self.local, self.remote);
    }
}

#[async_trait]
impl RtcPeer for MemoryPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcChannel>> {
        let channel = MemoryChannel::new(label, Arc::clone(&self.send_delay));
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PeerConnectionError("peer closed".to_string()));
        }
        state.channels.push(channel.clone());
        Ok(channel)
    }

    fn on_data_channel(&self, handler: ChannelHandler) {
        let mut slot = self.channel_handler.lock();
        let parked = std::mem::take(&mut self.state.lock().inbound);
        for channel in parked {
            handler(channel as Arc<dyn RtcChannel>);
        }
        *slot = Some(handler);
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        *self.candidate_handler.lock() = Some(handler);
    }

    async fn generate_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        if self.state.lock().closed {
            return Err(Error::SdpError("peer closed".to_string()));
        }
        if kind == SdpKind::Answer {
            if let Some(me) = self.me.upgrade() {
                self.network.register(&me);
            }
        }
        self.gather_candidate();

        Ok(SessionDescription {
            kind,
            sdp: format!("v=0 memory {} -> {}", self.local, self.remote),
        })
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::SdpError("peer closed".to_string()));
            }
            state.remote_set = true;
        }

        if description.kind == SdpKind::Answer {
            match self.network.answerer(&self.remote, &self.local) {
                Some(answerer) if !answerer.is_closed() => self.connect_to(&answerer),
                _ => debug!("No answering peer for {} -> {}", self.local, self.remote),
            }
        }
        Ok(())
    }

    async fn apply_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        if !self.state.lock().remote_set {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        self.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.shut();
        }
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    on_open: Option<OpenHandler>,
}

#[derive(Default)]
struct Inbox {
    handler: Option<MessageHandler>,
    backlog: Vec<Bytes>,
}

/// One end of an in-memory data channel; frames arrive in send order
pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
    inbox: Mutex<Inbox>,
    twin: Mutex<Weak<MemoryChannel>>,
    sent: AtomicUsize,
    send_delay: SendDelay,
}

impl MemoryChannel {
    fn new(label: &str, send_delay: SendDelay) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::default()),
            inbox: Mutex::new(Inbox::default()),
            twin: Mutex::new(Weak::new()),
            sent: AtomicUsize::new(0),
            send_delay,
        })
    }

    fn link(&self, twin: &Arc<MemoryChannel>) {
        *self.twin.lock() = Arc::downgrade(twin);
    }

    fn open(&self) {
        let handler = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.open = true;
            state.on_open.take()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    fn shut(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.closed = true;
    }

    fn receive(&self, frame: Bytes) {
        let mut inbox = self.inbox.lock();
        match inbox.handler.as_ref() {
            Some(handler) => handler(frame),
            None => inbox.backlog.push(frame),
        }
    }

    /// Frames sent from this end
    pub fn sent_frames(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtcChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "channel '{}' is not open",
                self.label
            )));
        }
        let twin = self.twin.lock().upgrade();
        let Some(twin) = twin else {
            return Err(Error::DataChannelError("remote end gone".to_string()));
        };
        if twin.state.lock().closed {
            return Err(Error::DataChannelError("remote end closed".to_string()));
        }

        self.sent.fetch_add(1, Ordering::SeqCst);
        twin.receive(frame);
        Ok(())
    }

    fn on_open(&self, handler: OpenHandler) {
        {
            let mut state = self.state.lock();
            if !state.open {
                state.on_open = Some(handler);
                return;
            }
        }
        handler();
    }

    fn on_message(&self, handler: MessageHandler) {
        let mut inbox = self.inbox.lock();
        for frame in std::mem::take(&mut inbox.backlog) {
            handler(frame);
        }
        inbox.handler = Some(handler);
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        let twin = self.twin.lock().upgrade();
        if let Some(twin) = twin {
            twin.shut();
        }
        Ok(())
    }
}
