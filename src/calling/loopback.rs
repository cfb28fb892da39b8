//! In-process collaborators: a loopback peer connection pair, a chat hub
//! standing in for the messaging transport, and recording doubles for the
//! platform seams (system call service, notifications, call UI, video).
//!
//! Used by the `simulate` command and throughout the tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::codec::IceCandidateRecord;
use super::frame::{DisplayBuffer, DisplaySurface, FrameBuffer, I420Planes, Rotation, VideoFrame};
use super::ice::CandidateType;
use super::integration::{CallNotification, IntegrationEvent, NotificationKind, Notifier, SystemCallService};
use super::manager::CallUi;
use super::peer::{
    ConnectionState, GatheringState, PeerConnection, PeerConnectionFactory, PeerEvent,
    RemoteVideoTrack, SdpKind, SessionDescription,
};
use super::pip::{PipHost, VideoRenderer};
use super::signaling::{ChatInfo, MessagingTransport, TransportEvent};
use super::Call;

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    posted: Mutex<Vec<CallNotification>>,
    cleared: Mutex<Vec<(u32, u32)>>,
}

impl RecordingNotifier {
    pub fn posted(&self) -> Vec<CallNotification> {
        self.posted.lock().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.posted.lock().iter().filter(|n| n.kind == kind).count()
    }

    pub fn cleared(&self) -> Vec<(u32, u32)> {
        self.cleared.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn post(&self, notification: CallNotification) -> Result<()> {
        tracing::info!(
            "Notification: {:?} \"{}\" - {}",
            notification.kind,
            notification.title,
            notification.body
        );
        self.posted.lock().push(notification);
        Ok(())
    }

    fn clear_incoming(&self, account_id: u32, message_id: u32) {
        self.cleared.lock().push((account_id, message_id));
    }
}

// ---------------------------------------------------------------------------
// System call service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCall {
    ReportIncoming(Uuid),
    RequestStart(Uuid),
    RequestEnd(Uuid),
    ReportEnded(Uuid),
}

/// System call service double. With an event sender it answers
/// `request_end` the way the OS does, with an [`IntegrationEvent::End`].
#[derive(Default)]
pub struct RecordingCallService {
    calls: Mutex<Vec<ServiceCall>>,
    active: Mutex<HashSet<Uuid>>,
    failing: AtomicBool,
    events: Option<mpsc::UnboundedSender<IntegrationEvent>>,
}

impl RecordingCallService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: mpsc::UnboundedSender<IntegrationEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&ServiceCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn admit(&self, session_id: Uuid, call: ServiceCall) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("call service unavailable");
        }
        self.calls.lock().push(call);
        self.active.lock().insert(session_id);
        Ok(())
    }
}

impl SystemCallService for RecordingCallService {
    fn report_incoming(&self, session_id: Uuid, display_name: &str, _has_video: bool) -> Result<()> {
        tracing::info!("System UI: incoming call from {}", display_name);
        self.admit(session_id, ServiceCall::ReportIncoming(session_id))
    }

    fn request_start(&self, session_id: Uuid, display_name: &str, _has_video: bool) -> Result<()> {
        tracing::info!("System UI: calling {}", display_name);
        self.admit(session_id, ServiceCall::RequestStart(session_id))
    }

    fn request_end(&self, session_id: Uuid) {
        self.calls.lock().push(ServiceCall::RequestEnd(session_id));
        let was_active = self.active.lock().remove(&session_id);
        if let (true, Some(events)) = (was_active, &self.events) {
            let _ = events.send(IntegrationEvent::End(session_id));
        }
    }

    fn report_ended(&self, session_id: Uuid) {
        self.calls.lock().push(ServiceCall::ReportEnded(session_id));
        self.active.lock().remove(&session_id);
    }

    fn has_active_call(&self) -> bool {
        !self.active.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Call UI and video
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingUi {
    shown: Mutex<Vec<Uuid>>,
    hidden: Mutex<Vec<Uuid>>,
    connected: Mutex<Vec<Uuid>>,
    renderer: Option<Arc<dyn VideoRenderer>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renderer(renderer: Arc<dyn VideoRenderer>) -> Self {
        Self {
            renderer: Some(renderer),
            ..Self::default()
        }
    }

    pub fn shown(&self) -> Vec<Uuid> {
        self.shown.lock().clone()
    }

    pub fn hidden(&self) -> Vec<Uuid> {
        self.hidden.lock().clone()
    }

    pub fn connected(&self) -> Vec<Uuid> {
        self.connected.lock().clone()
    }
}

impl CallUi for RecordingUi {
    fn show_call(&self, call: &Call) {
        self.shown.lock().push(call.session_id);
    }

    fn hide_call(&self, session_id: Uuid) {
        self.hidden.lock().push(session_id);
    }

    fn call_connected(&self, session_id: Uuid) {
        self.connected.lock().push(session_id);
    }

    fn video_renderer(&self) -> Option<Arc<dyn VideoRenderer>> {
        self.renderer.clone()
    }
}

#[derive(Default)]
pub struct CountingRenderer {
    frames: AtomicU64,
    sizes: Mutex<Vec<(u32, u32)>>,
}

impl CountingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }
}

impl VideoRenderer for CountingRenderer {
    fn render_frame(&self, _frame: VideoFrame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn set_size(&self, width: u32, height: u32) {
        self.sizes.lock().push((width, height));
    }
}

/// Display surface that only counts what it is shown.
#[derive(Default)]
pub struct CountingSurface {
    enqueued: AtomicU64,
    flushes: AtomicUsize,
    last_size: Mutex<Option<(u32, u32)>>,
}

impl CountingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn last_size(&self) -> Option<(u32, u32)> {
        *self.last_size.lock()
    }
}

impl DisplaySurface for CountingSurface {
    fn enqueue(&self, buffer: DisplayBuffer) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        *self.last_size.lock() = Some((buffer.image.width, buffer.image.height));
    }

    fn set_rotation(&self, rotation: Rotation) {
        tracing::debug!("Surface rotation {}deg", rotation.degrees());
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// PiP host that remembers the layout it was asked for.
#[derive(Default)]
pub struct RecordingPipHost {
    content_size: Mutex<Option<(u32, u32)>>,
    source_height: Mutex<Option<f64>>,
}

impl RecordingPipHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn content_size(&self) -> Option<(u32, u32)> {
        *self.content_size.lock()
    }

    pub fn source_height(&self) -> Option<f64> {
        *self.source_height.lock()
    }
}

impl PipHost for RecordingPipHost {
    fn set_preferred_content_size(&self, width: u32, height: u32) {
        tracing::debug!("PiP content size {}x{}", width, height);
        *self.content_size.lock() = Some((width, height));
    }

    fn set_source_height(&self, height: f64) {
        *self.source_height.lock() = Some(height);
    }
}

/// Remote video track that paints solid frames into its renderer.
pub struct LoopbackVideoTrack {
    id: String,
    frames: u32,
    attached: Mutex<Option<(Arc<dyn VideoRenderer>, Arc<AtomicBool>)>>,
    attach_count: AtomicUsize,
}

/// Frame size produced by [`LoopbackVideoTrack`].
pub const LOOPBACK_VIDEO_SIZE: (u32, u32) = (64, 48);

impl LoopbackVideoTrack {
    pub fn new(id: impl Into<String>, frames: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            frames,
            attached: Mutex::new(None),
            attach_count: AtomicUsize::new(0),
        })
    }

    pub fn is_attached(&self) -> bool {
        self.attached.lock().is_some()
    }

    pub fn attach_count(&self) -> usize {
        self.attach_count.load(Ordering::SeqCst)
    }
}

impl RemoteVideoTrack for LoopbackVideoTrack {
    fn track_id(&self) -> &str {
        &self.id
    }

    fn attach(&self, renderer: Arc<dyn VideoRenderer>) {
        let running = Arc::new(AtomicBool::new(true));
        *self.attached.lock() = Some((renderer.clone(), running.clone()));
        self.attach_count.fetch_add(1, Ordering::SeqCst);
        if self.frames == 0 {
            return;
        }

        let frames = self.frames;
        std::thread::spawn(move || {
            let (w, h) = LOOPBACK_VIDEO_SIZE;
            renderer.set_size(w, h);
            for n in 0..frames {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                // Sweep luma so consecutive frames differ.
                let luma = 16 + (n % 220) as u8;
                renderer.render_frame(VideoFrame {
                    buffer: FrameBuffer::I420(I420Planes::solid(w, h, luma, 128, 128)),
                    rotation: Rotation::Deg0,
                    timestamp_us: i64::from(n) * 40_000,
                });
                std::thread::sleep(Duration::from_millis(5));
            }
        });
    }

    fn detach(&self, renderer: &Arc<dyn VideoRenderer>) {
        let mut attached = self.attached.lock();
        if let Some((current, running)) = attached.as_ref() {
            if Arc::ptr_eq(current, renderer) {
                running.store(false, Ordering::SeqCst);
                *attached = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

/// When a loopback peer "gathers" which candidates, relative to
/// `set_local_description`.
#[derive(Debug, Clone, Default)]
pub struct GatheringScript {
    steps: Vec<(Duration, CandidateType)>,
    complete_after: Option<Duration>,
}

impl GatheringScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host first, then srflx and relay, then completion.
    pub fn typical() -> Self {
        Self::new()
            .candidate(Duration::from_millis(5), CandidateType::Host)
            .candidate(Duration::from_millis(40), CandidateType::ServerReflexive)
            .candidate(Duration::from_millis(300), CandidateType::Relay)
            .complete_after(Duration::from_millis(600))
    }

    pub fn candidate(mut self, at: Duration, candidate_type: CandidateType) -> Self {
        self.steps.push((at, candidate_type));
        self.steps.sort_by_key(|(at, _)| *at);
        self
    }

    pub fn complete_after(mut self, at: Duration) -> Self {
        self.complete_after = Some(at);
        self
    }
}

fn candidate_line(peer_id: u64, n: usize, candidate_type: CandidateType) -> String {
    let host = peer_id % 200 + 10;
    let (typ, addr, priority) = match candidate_type {
        CandidateType::Host => ("host", format!("192.168.1.{}", host), 2_130_706_431u32),
        CandidateType::ServerReflexive => ("srflx", format!("203.0.113.{}", host), 1_694_498_815),
        CandidateType::PeerReflexive => ("prflx", format!("198.18.0.{}", host), 1_862_270_975),
        CandidateType::Relay => ("relay", format!("198.51.100.{}", host), 16_777_215),
    };
    format!(
        "candidate:{} 1 udp {} {} {} typ {}",
        n + 1,
        priority,
        addr,
        50_000 + n,
        typ
    )
}

fn origin_id(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|l| l.trim().strip_prefix("o="))
        .and_then(|o| o.split_whitespace().nth(1))
        .and_then(|id| id.parse().ok())
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidateRecord>,
    sent: Vec<Vec<u8>>,
    linked: Option<Weak<LoopbackPeer>>,
    connected: bool,
    closed: bool,
}

/// Pairs loopback peers by the session id in the offer's `o=` line.
#[derive(Default)]
pub struct PeerHub {
    peers: Mutex<HashMap<u64, Weak<LoopbackPeer>>>,
    next_id: AtomicU64,
}

impl PeerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn find(&self, id: u64) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(&id).and_then(Weak::upgrade)
    }
}

pub struct LoopbackPeer {
    id: u64,
    me: Weak<LoopbackPeer>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Arc<Mutex<PeerState>>,
    script: GatheringScript,
    hub: Option<Arc<PeerHub>>,
    video_frames: u32,
    gathering: Mutex<Option<JoinHandle<()>>>,
    closes: AtomicUsize,
}

impl LoopbackPeer {
    /// A standalone peer whose events tests can inject by hand.
    pub fn new(script: GatheringScript) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        Self::build(0, script, None, 0)
    }

    fn build(
        id: u64,
        script: GatheringScript,
        hub: Option<Arc<PeerHub>>,
        video_frames: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            events: tx,
            state: Arc::new(Mutex::new(PeerState::default())),
            script,
            hub,
            video_frames,
            gathering: Mutex::new(None),
            closes: AtomicUsize::new(0),
        });
        (peer, rx)
    }

    pub fn inject(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent_signaling(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidateRecord> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn sdp(&self, kind: SdpKind) -> String {
        let setup = match kind {
            SdpKind::Offer => "actpass",
            SdpKind::Answer => "active",
        };
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0 1 2\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=setup:{}\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:2\r\n",
            self.id, setup
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            bail!("peer connection closed");
        }
        Ok(())
    }

    fn start_gathering(&self) {
        let script = self.script.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let peer_id = self.id;

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let _ = events.send(PeerEvent::GatheringStateChanged(GatheringState::Gathering));
            for (n, (at, candidate_type)) in script.steps.iter().enumerate() {
                tokio::time::sleep_until(started + *at).await;
                let line = candidate_line(peer_id, n, *candidate_type);
                if let Some(local) = state.lock().local.as_mut() {
                    local.sdp.push_str(&format!("a={}\r\n", line));
                }
                let record = IceCandidateRecord::new(line, 0, Some("0".to_string()));
                let _ = events.send(PeerEvent::LocalCandidate(record));
            }
            if let Some(at) = script.complete_after {
                tokio::time::sleep_until(started + at).await;
                let _ = events.send(PeerEvent::GatheringStateChanged(GatheringState::Complete));
            }
        });
        if let Some(old) = self.gathering.lock().replace(handle) {
            old.abort();
        }
    }

    fn linked(&self) -> Option<Arc<LoopbackPeer>> {
        self.state.lock().linked.as_ref().and_then(Weak::upgrade)
    }

    /// Open the data channel and media once both descriptions are in place.
    fn try_connect(&self) {
        let remote_id = {
            let mut state = self.state.lock();
            if state.connected || state.closed || state.local.is_none() || state.remote.is_none() {
                return;
            }
            let Some(remote) = state.linked.as_ref().and_then(Weak::upgrade) else {
                return;
            };
            state.connected = true;
            remote.id
        };

        self.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Connecting));
        self.inject(PeerEvent::SignalingChannelOpen);
        self.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        if self.video_frames > 0 {
            let track = LoopbackVideoTrack::new(format!("video-{}", remote_id), self.video_frames);
            self.inject(PeerEvent::VideoTrackStarted(track));
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.sdp(SdpKind::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.state.lock().remote.as_ref().map(|d| d.kind),
            Some(SdpKind::Offer)
        );
        if !has_offer {
            bail!("cannot answer without a remote offer");
        }
        Ok(SessionDescription::answer(self.sdp(SdpKind::Answer)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().local = Some(desc);
        self.start_gathering();
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if desc.kind == SdpKind::Offer {
            if let Some(hub) = &self.hub {
                let offerer = origin_id(&desc.sdp)
                    .and_then(|id| hub.find(id))
                    .context("offer does not belong to a known loopback peer")?;
                offerer.state.lock().linked = Some(self.me.clone());
                self.state.lock().linked = Some(Arc::downgrade(&offerer));
            }
        }
        self.state.lock().remote = Some(desc);
        self.try_connect();
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateRecord) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn send_signaling(&self, data: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().sent.push(data.clone());
        if let Some(remote) = self.linked() {
            remote.inject(PeerEvent::SignalingMessage(data));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if let Some(handle) = self.gathering.lock().take() {
            handle.abort();
        }
        if let Some(remote) = self.linked() {
            remote.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
        self.inject(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
    }
}

/// Creates hub-registered loopback peers.
pub struct LoopbackPeerFactory {
    hub: Arc<PeerHub>,
    script: GatheringScript,
    video_frames: u32,
    created: Mutex<Vec<Weak<LoopbackPeer>>>,
    ice_servers: Mutex<Vec<Vec<String>>>,
}

impl LoopbackPeerFactory {
    pub fn new(hub: Arc<PeerHub>, script: GatheringScript, video_frames: u32) -> Self {
        Self {
            hub,
            script,
            video_frames,
            created: Mutex::new(Vec::new()),
            ice_servers: Mutex::new(Vec::new()),
        }
    }

    /// Peers created so far that are still alive.
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.created.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// ICE server lists passed to each `create` call, in order.
    pub fn ice_servers(&self) -> Vec<Vec<String>> {
        self.ice_servers.lock().clone()
    }
}

impl PeerConnectionFactory for LoopbackPeerFactory {
    fn create(
        &self,
        ice_servers: &[String],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        self.ice_servers.lock().push(ice_servers.to_vec());
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (peer, events) =
            LoopbackPeer::build(id, self.script.clone(), Some(self.hub.clone()), self.video_frames);
        self.hub.peers.lock().insert(id, Arc::downgrade(&peer));
        self.created.lock().push(Arc::downgrade(&peer));
        Ok((peer, events))
    }
}

// ---------------------------------------------------------------------------
// Messaging transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Place { chat_id: u32, message_id: u32 },
    Accept { message_id: u32 },
    End { message_id: u32 },
}

struct Endpoint {
    id: usize,
    account_id: u32,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct CallMessage {
    from_account: u32,
}

#[derive(Default)]
struct ChatState {
    next_message_id: u32,
    endpoints: Vec<Endpoint>,
    names: HashMap<u32, String>,
    messages: HashMap<u32, CallMessage>,
}

/// One chat shared by every connected account; several endpoints with the
/// same account id act as devices of one identity.
pub struct LoopbackChat {
    chat_id: u32,
    state: Mutex<ChatState>,
}

impl LoopbackChat {
    pub fn new(chat_id: u32) -> Arc<Self> {
        Arc::new(Self {
            chat_id,
            state: Mutex::new(ChatState {
                next_message_id: 100,
                ..ChatState::default()
            }),
        })
    }

    pub fn chat_id(&self) -> u32 {
        self.chat_id
    }

    /// Connect a device of `account_id`, shown to others as `display_name`.
    pub fn connect(
        self: &Arc<Self>,
        account_id: u32,
        display_name: &str,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.endpoints.len();
        state.endpoints.push(Endpoint {
            id,
            account_id,
            events: tx,
        });
        state.names.insert(account_id, display_name.to_string());
        let transport = Arc::new(LoopbackTransport {
            chat: self.clone(),
            endpoint: id,
            account_id,
            fail_place: AtomicBool::new(false),
            ops: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    fn deliver(&self, state: &ChatState, filter: impl Fn(&Endpoint) -> bool, event: impl Fn(&Endpoint) -> TransportEvent) {
        for endpoint in state.endpoints.iter().filter(|e| filter(e)) {
            let _ = endpoint.events.send(event(endpoint));
        }
    }
}

pub struct LoopbackTransport {
    chat: Arc<LoopbackChat>,
    endpoint: usize,
    account_id: u32,
    fail_place: AtomicBool,
    ops: Mutex<Vec<TransportOp>>,
}

impl LoopbackTransport {
    pub fn set_fail_place(&self, fail: bool) {
        self.fail_place.store(fail, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<TransportOp> {
        self.ops.lock().clone()
    }

    pub fn account_id(&self) -> u32 {
        self.account_id
    }
}

#[async_trait]
impl MessagingTransport for LoopbackTransport {
    async fn place_call(&self, account_id: u32, chat_id: u32, offer_sdp: &str) -> Result<u32> {
        if self.fail_place.load(Ordering::SeqCst) {
            bail!("message could not be sent");
        }
        if chat_id != self.chat.chat_id {
            bail!("unknown chat {}", chat_id);
        }
        let mut state = self.chat.state.lock();
        state.next_message_id += 1;
        let message_id = state.next_message_id;
        state.messages.insert(
            message_id,
            CallMessage {
                from_account: account_id,
            },
        );
        self.chat.deliver(
            &state,
            |e| e.account_id != account_id,
            |e| TransportEvent::IncomingCall {
                account_id: e.account_id,
                message_id,
                offer: Some(offer_sdp.to_string()),
            },
        );
        self.ops.lock().push(TransportOp::Place {
            chat_id,
            message_id,
        });
        Ok(message_id)
    }

    async fn accept_call(&self, account_id: u32, message_id: u32, answer_sdp: &str) -> Result<()> {
        let state = self.chat.state.lock();
        let caller = state
            .messages
            .get(&message_id)
            .map(|m| m.from_account)
            .with_context(|| format!("unknown call message {}", message_id))?;
        self.chat.deliver(
            &state,
            |e| e.account_id == caller,
            |e| TransportEvent::OutgoingCallAccepted {
                account_id: e.account_id,
                message_id,
                answer: answer_sdp.to_string(),
            },
        );
        let me = self.endpoint;
        self.chat.deliver(
            &state,
            |e| e.account_id == account_id && e.id != me,
            |e| TransportEvent::IncomingCallAccepted {
                account_id: e.account_id,
                message_id,
            },
        );
        self.ops.lock().push(TransportOp::Accept { message_id });
        Ok(())
    }

    async fn end_call(&self, _account_id: u32, message_id: u32) -> Result<()> {
        let state = self.chat.state.lock();
        if !state.messages.contains_key(&message_id) {
            bail!("unknown call message {}", message_id);
        }
        let me = self.endpoint;
        self.chat.deliver(
            &state,
            |e| e.id != me,
            |e| TransportEvent::CallEnded {
                account_id: e.account_id,
                message_id,
            },
        );
        self.ops.lock().push(TransportOp::End { message_id });
        Ok(())
    }

    fn lookup_call(&self, _account_id: u32, message_id: u32) -> Option<ChatInfo> {
        let state = self.chat.state.lock();
        let message = state.messages.get(&message_id)?;
        Some(ChatInfo {
            chat_id: self.chat.chat_id,
            display_name: state
                .names
                .get(&message.from_account)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn chat_name(&self, account_id: u32, chat_id: u32) -> Option<String> {
        if chat_id != self.chat.chat_id {
            return None;
        }
        let state = self.chat.state.lock();
        let mut others: Vec<_> = state
            .names
            .iter()
            .filter(|(id, _)| **id != account_id)
            .collect();
        others.sort();
        others.first().map(|(_, name)| (*name).clone())
    }
}
