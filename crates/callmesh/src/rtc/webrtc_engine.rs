//! Negotiation capabilities backed by the `webrtc` crate

use super::{
    CandidateHandler, ChannelHandler, IceCandidate, MessageHandler, OpenHandler, RtcChannel,
    RtcEngine, RtcPeer, SdpKind, SessionDescription,
};
use crate::config::MeshConfig;
use crate::session::ConnectionId;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates `webrtc` peer connections with the configured ICE servers
pub struct WebRtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(config: &MeshConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Self { ice_servers }
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    #[instrument(skip(self), fields(remote = %remote))]
    async fn create_peer(&self, remote: &ConnectionId) -> Result<Arc<dyn RtcPeer>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let remote_id = remote.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let remote_id = remote_id.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            info!("Peer connection to {} established", remote_id)
                        }
                        RTCPeerConnectionState::Failed => {
                            warn!("Peer connection to {} failed", remote_id)
                        }
                        other => debug!("Peer connection to {} is {}", remote_id, other),
                    }
                })
            },
        ));

        Ok(Arc::new(WebRtcPeer {
            remote: remote.clone(),
            peer_connection,
        }))
    }
}

/// `RTCPeerConnection` seen through the negotiation capability set
pub struct WebRtcPeer {
    remote: ConnectionId,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };

        let rtc_channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        debug!("Created data channel '{}' towards {}", label, self.remote);
        Ok(Arc::new(WebRtcChannel::new(rtc_channel)))
    }

    fn on_data_channel(&self, handler: ChannelHandler) {
        let handler = Arc::new(handler);
        self.peer_connection
            .on_data_channel(Box::new(move |rtc_channel: Arc<RTCDataChannel>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    handler(Arc::new(WebRtcChannel::new(rtc_channel)));
                })
            }));
    }

    fn on_ice_candidate(&self, handler: CandidateHandler) {
        let handler = Arc::new(handler);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => handler(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    }
                })
            }));
    }

    async fn generate_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        let description = match kind {
            SdpKind::Offer => self.peer_connection.create_offer(None).await,
            SdpKind::Answer => self.peer_connection.create_answer(None).await,
        }
        .map_err(|e| Error::SdpError(format!("Failed to create {:?}: {}", kind, e)))?;

        let sdp = description.sdp.clone();
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription { kind, sdp })
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let rtc_description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse SDP: {}", e)))?;

        self.peer_connection
            .set_remote_description(rtc_description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close peer: {}", e)))
    }
}

/// `RTCDataChannel` seen through the negotiation capability set
pub struct WebRtcChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    fn new(rtc_channel: Arc<RTCDataChannel>) -> Self {
        Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
        }
    }
}

#[async_trait]
impl RtcChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Channel '{}' is not open",
                self.label
            )));
        }

        self.rtc_channel
            .send(&frame)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send frame: {}", e)))?;
        Ok(())
    }

    fn on_open(&self, handler: OpenHandler) {
        // Fires right away when the channel is already open
        self.rtc_channel.on_open(Box::new(move || {
            Box::pin(async move {
                handler();
            })
        }));
    }

    fn on_message(&self, handler: MessageHandler) {
        let label = self.label.clone();
        self.rtc_channel
            .on_message(Box::new(move |message: DataChannelMessage| {
                if message.is_string {
                    warn!("Ignoring text frame on channel '{}'", label);
                } else {
                    handler(message.data);
                }
                Box::pin(async {})
            }));
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}
