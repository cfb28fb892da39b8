//! Peer connection seam.
//!
//! The media stack (codecs, DTLS/SRTP, congestion control) lives behind
//! [`PeerConnection`]. Its callbacks fire on whatever thread the
//! implementation likes, so implementations push them into the
//! [`PeerEvent`] channel handed out at construction; the owning
//! `CallSession` drains that channel on its own task.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::codec::IceCandidateRecord;
use super::pip::VideoRenderer;

/// SDP role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged over the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Number of `a=candidate:` lines already folded into the SDP.
    pub fn candidate_count(&self) -> usize {
        self.sdp
            .lines()
            .filter(|l| l.trim_start().starts_with("a=candidate:"))
            .count()
    }
}

/// Whether a signaling payload looks like an SDP blob at all.
pub fn is_plausible_sdp(payload: &str) -> bool {
    payload.trim_start().starts_with("v=0")
}

/// ICE gathering state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Aggregate peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote video track that can be bound to a renderer.
pub trait RemoteVideoTrack: Send + Sync {
    fn track_id(&self) -> &str;
    fn attach(&self, renderer: Arc<dyn VideoRenderer>);
    fn detach(&self, renderer: &Arc<dyn VideoRenderer>);
}

/// Callbacks of the peer connection, marshaled into a channel.
pub enum PeerEvent {
    /// A local candidate was gathered.
    LocalCandidate(IceCandidateRecord),
    GatheringStateChanged(GatheringState),
    ConnectionStateChanged(ConnectionState),
    /// The negotiated trickle data channel reached the open state.
    SignalingChannelOpen,
    /// A message arrived on the trickle data channel.
    SignalingMessage(Vec<u8>),
    /// A remote video track started receiving.
    VideoTrackStarted(Arc<dyn RemoteVideoTrack>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::GatheringStateChanged(s) => {
                f.debug_tuple("GatheringStateChanged").field(s).finish()
            }
            PeerEvent::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            PeerEvent::SignalingChannelOpen => f.write_str("SignalingChannelOpen"),
            PeerEvent::SignalingMessage(m) => {
                f.debug_tuple("SignalingMessage").field(&m.len()).finish()
            }
            PeerEvent::VideoTrackStarted(t) => {
                f.debug_tuple("VideoTrackStarted").field(&t.track_id()).finish()
            }
        }
    }
}

/// One peer connection with a pre-negotiated trickle data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// The current local description, including candidates gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<()>;
    /// Send one message on the trickle data channel.
    async fn send_signaling(&self, data: Vec<u8>) -> Result<()>;
    /// Release the connection, its data channel and local capture.
    async fn close(&self);
}

/// Creates peer connections for new calls.
pub trait PeerConnectionFactory: Send + Sync {
    /// `ice_servers` are STUN/TURN URLs for the new connection.
    fn create(
        &self,
        ice_servers: &[String],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_count() {
        let desc = SessionDescription::offer(
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=candidate:1 1 udp 1 10.0.0.1 5000 typ host\r\na=candidate:2 1 udp 1 1.2.3.4 5000 typ srflx\r\n",
        );
        assert_eq!(desc.candidate_count(), 2);
        assert_eq!(SessionDescription::answer("v=0\r\n").candidate_count(), 0);
    }

    #[test]
    fn test_plausible_sdp() {
        assert!(is_plausible_sdp("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n"));
        assert!(is_plausible_sdp("  v=0\n"));
        assert!(!is_plausible_sdp(""));
        assert!(!is_plausible_sdp("hello"));
    }
}
