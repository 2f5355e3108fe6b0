//! Per-connection peers and data channels
//!
//! Both maps are keyed by the remote connection id and only change together
//! with the session's stream announcements. Once shut down the registry
//! rejects new peers, so a late offer cannot bring a peer back.

use crate::negotiation::PeerNegotiation;
use crate::rtc::RtcChannel;
use crate::session::ConnectionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    peers: HashMap<ConnectionId, Arc<PeerNegotiation>>,
    channels: HashMap<ConnectionId, Arc<dyn RtcChannel>>,
    shut_down: bool,
}

/// Peer and channel arena of one participant
#[derive(Default)]
pub struct PeerRegistry {
    state: RwLock<RegistryState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a negotiation, replacing (and closing) any previous one for that remote
    pub async fn insert_peer(&self, negotiation: Arc<PeerNegotiation>) -> Result<()> {
        let remote = negotiation.remote().clone();
        let (old_peer, old_channel) = {
            let mut state = self.state.write().await;
            if state.shut_down {
                return Err(Error::SessionError(format!(
                    "Registry is shut down, rejecting peer {}",
                    remote
                )));
            }
            let old_channel = state.channels.remove(&remote);
            let old_peer = state.peers.insert(remote.clone(), negotiation);
            (old_peer, old_channel)
        };

        if old_peer.is_some() {
            warn!("Replacing existing peer for {}", remote);
        }
        close_pair(&remote, old_peer, old_channel).await;

        debug!("Peer {} registered", remote);
        Ok(())
    }

    /// Install the open channel of `negotiation`
    ///
    /// Returns false when that negotiation is no longer the registered one
    /// (the remote left or rejoined) or the registry is shut down; the caller
    /// then closes the channel.
    pub async fn install_channel(
        &self,
        negotiation: &Arc<PeerNegotiation>,
        channel: Arc<dyn RtcChannel>,
    ) -> bool {
        let remote = negotiation.remote();
        let mut state = self.state.write().await;
        if state.shut_down {
            return false;
        }
        match state.peers.get(remote) {
            Some(peer) if Arc::ptr_eq(peer, negotiation) => peer.mark_connected(),
            _ => return false,
        }
        state.channels.insert(remote.clone(), channel);
        true
    }

    /// Remove and close the peer and channel of `remote`
    pub async fn remove(&self, remote: &ConnectionId) -> bool {
        let (peer, channel) = {
            let mut state = self.state.write().await;
            (state.peers.remove(remote), state.channels.remove(remote))
        };
        let removed = peer.is_some() || channel.is_some();
        close_pair(remote, peer, channel).await;
        removed
    }

    /// Like [`remove`](Self::remove), but only while `negotiation` is the registered peer
    pub async fn remove_peer(&self, negotiation: &Arc<PeerNegotiation>) -> bool {
        let remote = negotiation.remote();
        let (peer, channel) = {
            let mut state = self.state.write().await;
            let current = matches!(
                state.peers.get(remote),
                Some(peer) if Arc::ptr_eq(peer, negotiation)
            );
            if !current {
                debug!("Peer {} already replaced or removed", remote);
                return false;
            }
            (state.peers.remove(remote), state.channels.remove(remote))
        };
        close_pair(remote, peer, channel).await;
        true
    }

    /// Close every peer and channel and refuse new peers from now on
    ///
    /// Returns the number of peers that were closed.
    pub async fn shutdown(&self) -> usize {
        let (peers, mut channels) = {
            let mut state = self.state.write().await;
            state.shut_down = true;
            (
                std::mem::take(&mut state.peers),
                std::mem::take(&mut state.channels),
            )
        };

        let count = peers.len();
        for (remote, peer) in peers {
            let channel = channels.remove(&remote);
            close_pair(&remote, Some(peer), channel).await;
        }
        // Channels without a peer should not exist; close them anyway
        for (remote, channel) in channels {
            close_pair(&remote, None, Some(channel)).await;
        }

        info!("Registry shut down, {} peers closed", count);
        count
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.read().await.shut_down
    }

    /// (peers, channels)
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.peers.len(), state.channels.len())
    }

    pub async fn peer(&self, remote: &ConnectionId) -> Option<Arc<PeerNegotiation>> {
        self.state.read().await.peers.get(remote).cloned()
    }

    /// Snapshot of the installed channels
    pub async fn channels(&self) -> Vec<(ConnectionId, Arc<dyn RtcChannel>)> {
        self.state
            .read()
            .await
            .channels
            .iter()
            .map(|(id, channel)| (id.clone(), Arc::clone(channel)))
            .collect()
    }
}

async fn close_pair(
    remote: &ConnectionId,
    peer: Option<Arc<PeerNegotiation>>,
    channel: Option<Arc<dyn RtcChannel>>,
) {
    if let Some(channel) = channel {
        if let Err(e) = channel.close().await {
            warn!("Failed to close data channel to {}: {}", remote, e);
        }
        debug!("Data channel to {} deleted", remote);
    }
    if let Some(peer) = peer {
        if let Err(e) = peer.close().await {
            warn!("Failed to close peer {}: {}", remote, e);
        }
        debug!("Peer {} deleted", remote);
    }
}
