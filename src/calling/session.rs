//! Call session: one peer connection, SDP offer/answer and ICE trickling
//! over the negotiated signaling data channel.
//!
//! Outgoing: create offer, set local, wait for enough ICE, send the current
//! local SDP through the messaging transport. Incoming: set remote offer,
//! create answer, set local, wait for enough ICE, hand the answer back to
//! the call manager. Candidates gathered after the SDP went out are
//! trickled; the ones gathered before the data channel opened are buffered
//! and flushed in order once it does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::codec::IceCandidateRecord;
use super::ice::{self, GatheringProgress, PendingCandidates};
use super::peer::{
    is_plausible_sdp, ConnectionState, GatheringState, PeerConnection, PeerEvent,
    RemoteVideoTrack, SessionDescription,
};
use super::pip::VideoRenderer;
use super::signaling::MessagingTransport;

/// Connection milestones reported to the call manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for something better than a srflx candidate.
    pub srflx_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            srflx_grace: ice::DEFAULT_SRFLX_GRACE,
        }
    }
}

/// Trickle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrickleStats {
    pub local_gathered: u64,
    pub local_sent: u64,
    pub remote_added: u64,
    pub remote_rejected: u64,
}

type CurrentTrack = Arc<Mutex<Option<Arc<dyn RemoteVideoTrack>>>>;

pub struct CallSession {
    peer: Arc<dyn PeerConnection>,
    progress: watch::Receiver<GatheringProgress>,
    config: SessionConfig,
    renderer: Option<Arc<dyn VideoRenderer>>,
    track: CurrentTrack,
    stats: Arc<Mutex<TrickleStats>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CallSession {
    /// Wrap `peer` and start draining its events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        peer: Arc<dyn PeerConnection>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        config: SessionConfig,
        renderer: Option<Arc<dyn VideoRenderer>>,
        session_events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (progress_tx, progress) = watch::channel(GatheringProgress::default());
        let track: CurrentTrack = Arc::new(Mutex::new(None));
        let stats = Arc::new(Mutex::new(TrickleStats::default()));

        let driver = EventDriver {
            peer: peer.clone(),
            progress: progress_tx,
            pending: PendingCandidates::new(),
            renderer: renderer.clone(),
            track: track.clone(),
            stats: stats.clone(),
            session_events,
        };
        let handle = tokio::spawn(driver.run(events));

        Self {
            peer,
            progress,
            config,
            renderer,
            track,
            stats,
            driver: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("call session already closed");
        }
        Ok(())
    }

    /// Wait for the gathering heuristic, then read the local description.
    async fn gathered_local_description(&self) -> Result<SessionDescription> {
        let started = Instant::now();
        ice::wait_for_enough_ice(self.progress.clone(), self.config.srflx_grace).await;
        self.ensure_open()?;

        let desc = self
            .peer
            .local_description()
            .context("peer connection has no local description")?;
        tracing::debug!(
            "Local {:?} ready after {:?} with {} candidates",
            desc.kind,
            started.elapsed(),
            desc.candidate_count()
        );
        Ok(desc)
    }

    /// Create the offer and return it once enough ICE has been gathered.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offer = self.peer.create_offer().await.context("Failed to create offer")?;
        self.peer
            .set_local_description(offer)
            .await
            .context("Failed to set local offer")?;
        self.gathered_local_description().await
    }

    /// Create the offer and send it into `chat_id`; returns the call message id.
    pub async fn place_call(
        &self,
        transport: &dyn MessagingTransport,
        account_id: u32,
        chat_id: u32,
    ) -> Result<u32> {
        let offer = self.create_offer().await?;
        self.ensure_open()?;
        let message_id = transport
            .place_call(account_id, chat_id, &offer.sdp)
            .await
            .context("Failed to send call offer")?;
        tracing::info!("Call offer sent to chat {} as message {}", chat_id, message_id);
        Ok(message_id)
    }

    /// Apply a remote offer and return our answer once enough ICE has been
    /// gathered.
    pub async fn accept_offer(&self, offer_sdp: &str) -> Result<SessionDescription> {
        self.ensure_open()?;
        if !is_plausible_sdp(offer_sdp) {
            bail!("remote offer is not an SDP payload");
        }
        self.peer
            .set_remote_description(SessionDescription::offer(offer_sdp))
            .await
            .context("Failed to set remote offer")?;
        let answer = self
            .peer
            .create_answer()
            .await
            .context("Failed to create answer")?;
        self.peer
            .set_local_description(answer)
            .await
            .context("Failed to set local answer")?;
        self.gathered_local_description().await
    }

    /// Apply the callee's answer to our offer.
    pub async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
        self.ensure_open()?;
        if !is_plausible_sdp(answer_sdp) {
            bail!("remote answer is not an SDP payload");
        }
        self.peer
            .set_remote_description(SessionDescription::answer(answer_sdp))
            .await
            .context("Failed to set remote answer")
    }

    pub fn trickle_stats(&self) -> TrickleStats {
        *self.stats.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the peer connection. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        if let (Some(track), Some(renderer)) = (self.track.lock().take(), &self.renderer) {
            track.detach(renderer);
        }
        self.peer.close().await;
        tracing::debug!("Call session closed");
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

/// Owns everything the peer callbacks touch; runs on its own task.
struct EventDriver {
    peer: Arc<dyn PeerConnection>,
    progress: watch::Sender<GatheringProgress>,
    pending: PendingCandidates,
    renderer: Option<Arc<dyn VideoRenderer>>,
    track: CurrentTrack,
    stats: Arc<Mutex<TrickleStats>>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
}

impl EventDriver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            tracing::trace!("Peer event: {:?}", event);
            match event {
                PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
                PeerEvent::GatheringStateChanged(state) => {
                    if state == GatheringState::Complete {
                        self.progress.send_modify(|p| p.note_complete());
                    }
                }
                PeerEvent::SignalingChannelOpen => self.on_signaling_open().await,
                PeerEvent::SignalingMessage(data) => self.on_signaling_message(&data).await,
                PeerEvent::VideoTrackStarted(track) => self.on_video_track(track),
                PeerEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            }
        }
        tracing::debug!("Peer event stream ended");
    }

    async fn on_local_candidate(&mut self, candidate: IceCandidateRecord) {
        match ice::parse_candidate(&candidate.candidate) {
            Ok(line) => {
                let now = Instant::now();
                self.progress
                    .send_modify(|p| p.note_candidate(line.candidate_type, now));
            }
            Err(e) => tracing::debug!("Unclassified local candidate: {:#}", e),
        }
        self.stats.lock().local_gathered += 1;

        if let Some(candidate) = self.pending.push(candidate) {
            self.send_candidate(&candidate).await;
        }
    }

    async fn on_signaling_open(&mut self) {
        let flushed = self.pending.open();
        tracing::debug!("Signaling channel open, flushing {} candidates", flushed.len());
        for candidate in &flushed {
            self.send_candidate(candidate).await;
        }
    }

    async fn send_candidate(&self, candidate: &IceCandidateRecord) {
        let data = match candidate.to_json() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to encode ICE candidate: {}", e);
                return;
            }
        };
        match self.peer.send_signaling(data).await {
            Ok(()) => self.stats.lock().local_sent += 1,
            Err(e) => tracing::warn!("Failed to trickle ICE candidate: {:#}", e),
        }
    }

    async fn on_signaling_message(&self, data: &[u8]) {
        let candidate = match IceCandidateRecord::from_json(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Dropping signaling message: {}", e);
                self.stats.lock().remote_rejected += 1;
                return;
            }
        };
        match self.peer.add_ice_candidate(candidate).await {
            Ok(()) => self.stats.lock().remote_added += 1,
            Err(e) => {
                tracing::warn!("Failed to add remote ICE candidate: {:#}", e);
                self.stats.lock().remote_rejected += 1;
            }
        }
    }

    fn on_video_track(&self, track: Arc<dyn RemoteVideoTrack>) {
        let Some(renderer) = &self.renderer else {
            tracing::debug!("No renderer for remote video track {}", track.track_id());
            return;
        };
        let mut current = self.track.lock();
        if let Some(old) = current.as_ref() {
            if old.track_id() == track.track_id() {
                return;
            }
            tracing::info!(
                "Remote video track {} replaces {}",
                track.track_id(),
                old.track_id()
            );
            old.detach(renderer);
        }
        track.attach(renderer.clone());
        *current = Some(track);
    }

    fn on_connection_state(&self, state: ConnectionState) {
        let event = match state {
            ConnectionState::Connected => SessionEvent::Connected,
            ConnectionState::Disconnected => SessionEvent::Disconnected,
            ConnectionState::Failed => SessionEvent::Failed,
            ConnectionState::Closed => SessionEvent::Closed,
            ConnectionState::New | ConnectionState::Connecting => return,
        };
        tracing::info!("Peer connection {:?}", state);
        let _ = self.session_events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::loopback::{GatheringScript, LoopbackPeer, LoopbackVideoTrack};
    use crate::calling::ice::CandidateType;

    fn candidate(n: u32, typ: &str) -> IceCandidateRecord {
        IceCandidateRecord::new(
            format!("candidate:{} 1 udp 100 10.0.0.{} 5000 typ {}", n, n, typ),
            0,
            Some("0".into()),
        )
    }

    fn session_with(
        script: GatheringScript,
    ) -> (
        Arc<LoopbackPeer>,
        CallSession,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (peer, events) = LoopbackPeer::new(script);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = CallSession::start(peer.clone(), events, SessionConfig::default(), None, tx);
        (peer, session, rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_waits_for_srflx_grace() {
        let script = GatheringScript::new()
            .candidate(Duration::from_millis(5), CandidateType::Host)
            .candidate(Duration::from_millis(30), CandidateType::ServerReflexive)
            .complete_after(Duration::from_secs(10));
        let (_peer, session, _rx) = session_with(script);

        let started = Instant::now();
        let offer = session.create_offer().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(180), "elapsed: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "elapsed: {:?}", elapsed);
        assert_eq!(offer.candidate_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_sent_on_first_relay() {
        let script = GatheringScript::new()
            .candidate(Duration::from_millis(5), CandidateType::Host)
            .candidate(Duration::from_millis(60), CandidateType::Relay)
            .complete_after(Duration::from_secs(10));
        let (_peer, session, _rx) = session_with(script);

        let started = Instant::now();
        session.create_offer().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(100), "elapsed: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_waits_for_complete_with_host_only() {
        let script = GatheringScript::new()
            .candidate(Duration::from_millis(5), CandidateType::Host)
            .complete_after(Duration::from_secs(3));
        let (_peer, session, _rx) = session_with(script);

        let started = Instant::now();
        session.create_offer().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_open_then_flushed_in_order() {
        let (peer, _session, _rx) = session_with(GatheringScript::new());

        for n in 1..=3 {
            peer.inject(PeerEvent::LocalCandidate(candidate(n, "host")));
        }
        settle().await;
        assert!(peer.sent_signaling().is_empty());

        peer.inject(PeerEvent::SignalingChannelOpen);
        peer.inject(PeerEvent::LocalCandidate(candidate(4, "srflx")));
        peer.inject(PeerEvent::SignalingChannelOpen);
        settle().await;

        let sent: Vec<IceCandidateRecord> = peer
            .sent_signaling()
            .iter()
            .map(|d| IceCandidateRecord::from_json(d).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                candidate(1, "host"),
                candidate(2, "host"),
                candidate(3, "host"),
                candidate(4, "srflx")
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_candidates_added_immediately() {
        let (peer, session, _rx) = session_with(GatheringScript::new());

        let rec = candidate(7, "relay");
        peer.inject(PeerEvent::SignalingMessage(rec.to_json().unwrap()));
        peer.inject(PeerEvent::SignalingMessage(b"{oops".to_vec()));
        settle().await;

        assert_eq!(peer.remote_candidates(), vec![rec]);
        let stats = session.trickle_stats();
        assert_eq!(stats.remote_added, 1);
        assert_eq!(stats.remote_rejected, 1);
    }

    #[tokio::test]
    async fn test_connection_state_forwarded() {
        let (peer, _session, mut rx) = session_with(GatheringScript::new());
        peer.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Connecting));
        peer.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected));
    }

    #[tokio::test]
    async fn test_new_video_track_replaces_old() {
        let (peer, events) = LoopbackPeer::new(GatheringScript::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let renderer = crate::calling::loopback::CountingRenderer::new();
        let session = CallSession::start(
            peer.clone(),
            events,
            SessionConfig::default(),
            Some(renderer.clone()),
            tx,
        );

        let first = LoopbackVideoTrack::new("video-1", 0);
        let second = LoopbackVideoTrack::new("video-2", 0);
        peer.inject(PeerEvent::VideoTrackStarted(first.clone()));
        peer.inject(PeerEvent::VideoTrackStarted(first.clone()));
        settle().await;
        assert!(first.is_attached());

        peer.inject(PeerEvent::VideoTrackStarted(second.clone()));
        settle().await;
        assert!(!first.is_attached());
        assert!(second.is_attached());
        assert_eq!(first.attach_count(), 1);

        session.close().await;
        assert!(!second.is_attached());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (peer, session, _rx) = session_with(GatheringScript::new());
        session.close().await;
        session.close().await;
        assert_eq!(peer.close_count(), 1);
        assert!(session.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_accept_rejects_non_sdp_offer() {
        let (_peer, session, _rx) = session_with(GatheringScript::new());
        assert!(session.accept_offer("not an sdp").await.is_err());
    }
}
