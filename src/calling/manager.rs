//! Call manager: the single owner of call lifecycle state.
//!
//! Holds at most one [`Call`] and its [`CallSession`], takes requests from
//! the UI, the system call integration, the messaging transport and push
//! delivery, and makes sure every teardown runs exactly once. The state
//! lock is never held across an `.await` or while calling out to a
//! collaborator; async continuations re-check the call's session id before
//! touching state.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::integration::{CallIntegration, IntegrationEvent};
use super::peer::{is_plausible_sdp, PeerConnectionFactory};
use super::pip::VideoRenderer;
use super::push::PushPayload;
use super::session::{CallSession, SessionEvent};
use super::signaling::{MessagingTransport, TransportEvent};
use super::{Call, CallError, CallKey, CallState};
use crate::config::CallSettings;

/// In-app call screen.
pub trait CallUi: Send + Sync {
    fn show_call(&self, call: &Call);
    fn hide_call(&self, session_id: Uuid);
    fn call_connected(&self, _session_id: Uuid) {}
    /// Where remote video goes, if the UI shows any.
    fn video_renderer(&self) -> Option<Arc<dyn VideoRenderer>> {
        None
    }
}

struct Slot {
    state: CallState,
    call: Option<Call>,
    session: Option<Arc<CallSession>>,
}

impl Slot {
    fn current_mut(&mut self, session_id: Uuid) -> Option<&mut Call> {
        self.call.as_mut().filter(|c| c.session_id == session_id)
    }

    fn is_current(&self, session_id: Uuid) -> bool {
        self.call.as_ref().map(|c| c.session_id) == Some(session_id)
    }
}

/// A call taken out of the manager, ready to be torn down.
struct Ended {
    call: Call,
    session: Option<Arc<CallSession>>,
}

pub struct CallManager {
    slot: Mutex<Slot>,
    settings: CallSettings,
    integration: Arc<dyn CallIntegration>,
    transport: Arc<dyn MessagingTransport>,
    peers: Arc<dyn PeerConnectionFactory>,
    ui: Arc<dyn CallUi>,
    runtime: Handle,
}

impl CallManager {
    /// Must be called from within a Tokio runtime; the manager spawns its
    /// background work there, so the other methods may be called from any
    /// thread.
    pub fn new(
        settings: CallSettings,
        integration: Arc<dyn CallIntegration>,
        transport: Arc<dyn MessagingTransport>,
        peers: Arc<dyn PeerConnectionFactory>,
        ui: Arc<dyn CallUi>,
    ) -> Result<Arc<Self>, CallError> {
        let runtime = Handle::try_current().map_err(|_| CallError::NoRuntime)?;
        Ok(Arc::new(Self {
            slot: Mutex::new(Slot {
                state: CallState::Idle,
                call: None,
                session: None,
            }),
            settings,
            integration,
            transport,
            peers,
            ui,
            runtime,
        }))
    }

    pub fn state(&self) -> CallState {
        self.slot.lock().state
    }

    pub fn current_call(&self) -> Option<Call> {
        self.slot.lock().call.clone()
    }

    /// Whether a call is in progress here or in the system call service.
    pub fn is_calling(&self) -> bool {
        self.slot.lock().call.is_some() || self.integration.has_active_call()
    }

    /// Claim the slot for `call`, unless something else is already going on.
    fn claim(&self, call: &Call, state: CallState) -> Result<(), CallError> {
        let busy_elsewhere = self.integration.has_active_call();
        let mut slot = self.slot.lock();
        if slot.call.is_some() || slot.state != CallState::Idle || busy_elsewhere {
            return Err(CallError::AlreadyActive);
        }
        slot.state = state;
        slot.call = Some(call.clone());
        Ok(())
    }

    /// Forget a call that never got far enough to need teardown.
    fn discard(&self, session_id: Uuid) {
        let mut slot = self.slot.lock();
        if slot.is_current(session_id) {
            slot.call = None;
            slot.session = None;
            slot.state = CallState::Idle;
        }
    }

    fn take_if(&self, pred: impl FnOnce(&Call) -> bool) -> Option<Ended> {
        let mut slot = self.slot.lock();
        if !slot.call.as_ref().is_some_and(pred) {
            return None;
        }
        slot.state = CallState::Ending;
        let call = slot.call.take()?;
        Some(Ended {
            call,
            session: slot.session.take(),
        })
    }

    fn settle_idle(&self) {
        let mut slot = self.slot.lock();
        if slot.call.is_none() && slot.state == CallState::Ending {
            slot.state = CallState::Idle;
        }
    }

    fn set_state(&self, session_id: Uuid, from: &[CallState], to: CallState) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_current(session_id) && from.contains(&slot.state) {
            slot.state = to;
            return true;
        }
        false
    }

    fn release_session(&self, session: Option<Arc<CallSession>>) {
        if let Some(session) = session {
            self.runtime.spawn(async move { session.close().await });
        }
    }

    /// Tear down a call this side decided to end, telling the peer.
    fn end_locally(&self, ended: Ended, request_integration_end: bool) {
        if let Some(message_id) = ended.call.signaling_message_id {
            let transport = self.transport.clone();
            let account_id = ended.call.account_id;
            self.runtime.spawn(async move {
                if let Err(e) = transport.end_call(account_id, message_id).await {
                    tracing::warn!("Failed to signal end of call: {:#}", e);
                }
            });
        }
        self.tear_down(ended, request_integration_end);
    }

    /// Local teardown only; nothing goes out over the transport.
    fn tear_down(&self, ended: Ended, request_integration_end: bool) {
        let Ended { call, session } = ended;
        if request_integration_end {
            self.integration.request_end(&call);
        }
        self.integration.clear_incoming(&call);
        self.ui.hide_call(call.session_id);
        self.release_session(session);
        self.settle_idle();
    }

    /// End the current call for whatever reason, telling everyone involved.
    fn abort(&self, session_id: Uuid, reason: &str) {
        match self.take_if(|c| c.session_id == session_id) {
            Some(ended) => {
                tracing::warn!("Aborting call {}: {}", session_id, reason);
                self.end_locally(ended, true);
            }
            None => tracing::debug!("Call {} already gone ({})", session_id, reason),
        }
    }

    /// Create the peer connection and session for the current call.
    fn open_session(self: &Arc<Self>, session_id: Uuid) -> Result<Arc<CallSession>, CallError> {
        let _runtime = self.runtime.enter();
        let (peer, events) = self
            .peers
            .create(&self.settings.ice_servers)
            .map_err(CallError::Peer)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(CallSession::start(
            peer,
            events,
            self.settings.session_config(),
            self.ui.video_renderer(),
            tx,
        ));

        let installed = {
            let mut slot = self.slot.lock();
            let current = slot.is_current(session_id);
            if current {
                slot.session = Some(session.clone());
            }
            current
        };
        if !installed {
            self.release_session(Some(session));
            return Err(CallError::NoMatchingCall);
        }

        self.runtime
            .spawn(watch_session(Arc::downgrade(self), session_id, rx));
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------------

    /// Start a call into `chat_id`. Returns the new call's session id.
    pub fn place_outgoing_call(
        self: &Arc<Self>,
        account_id: u32,
        chat_id: u32,
    ) -> Result<Uuid, CallError> {
        let display_name = self
            .transport
            .chat_name(account_id, chat_id)
            .unwrap_or_else(|| self.settings.fallback_display_name.clone());
        let mut call = Call::outgoing(account_id, chat_id, display_name);
        call.has_video = self.settings.video;
        let session_id = call.session_id;

        if let Err(e) = self.claim(&call, CallState::PlacingOutgoing) {
            tracing::warn!("Already in a call, not calling chat {}", chat_id);
            return Err(e);
        }

        if let Err(e) = self.integration.request_start(&call) {
            tracing::error!("Failed to start call: {:#}", e);
            self.discard(session_id);
            return Err(CallError::Integration(e));
        }
        tracing::info!("Calling {} (chat {})", call.display_name, chat_id);
        self.ui.show_call(&call);

        let session = match self.open_session(session_id) {
            Ok(session) => session,
            Err(e) => {
                self.abort(session_id, "peer connection setup failed");
                return Err(e);
            }
        };
        self.runtime
            .spawn(self.clone().run_outgoing(call, session));
        Ok(session_id)
    }

    async fn run_outgoing(self: Arc<Self>, call: Call, session: Arc<CallSession>) {
        let message_id = match session
            .place_call(self.transport.as_ref(), call.account_id, call.chat_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to place call: {:#}", e);
                self.abort(call.session_id, "offer could not be sent");
                return;
            }
        };

        let current = {
            let mut guard = self.slot.lock();
            let slot = &mut *guard;
            match slot.current_mut(call.session_id) {
                Some(c) => {
                    c.signaling_message_id = Some(message_id);
                    if slot.state == CallState::PlacingOutgoing {
                        slot.state = CallState::RingingOutgoing;
                    }
                    true
                }
                None => false,
            }
        };

        if current {
            tracing::info!("Ringing {}", call.display_name);
        } else {
            // Ended while the offer was on its way.
            tracing::debug!("Call {} ended before its offer was sent", call.session_id);
            if let Err(e) = self.transport.end_call(call.account_id, message_id).await {
                tracing::warn!("Failed to signal end of call: {:#}", e);
            }
            session.close().await;
        }
    }

    fn on_outgoing_accepted(self: &Arc<Self>, account_id: u32, message_id: u32, answer: String) {
        let found = {
            let slot = self.slot.lock();
            match (&slot.call, &slot.session) {
                (Some(c), Some(s)) if !c.is_incoming() && c.is_message(account_id, message_id) => {
                    Some((c.session_id, s.clone()))
                }
                _ => None,
            }
        };
        let Some((session_id, session)) = found else {
            tracing::debug!("Ignoring answer for message {}: no matching call", message_id);
            return;
        };

        let manager = self.clone();
        self.runtime.spawn(async move {
            match session.apply_answer(&answer).await {
                Ok(()) => {
                    let from = [CallState::PlacingOutgoing, CallState::RingingOutgoing];
                    if manager.set_state(session_id, &from, CallState::Connected) {
                        tracing::info!("Call {} answered", session_id);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to apply answer: {:#}", e);
                    manager.abort(session_id, "remote answer rejected");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Incoming
    // -----------------------------------------------------------------------

    /// Report an incoming call to the integration.
    ///
    /// Runs synchronously up to and including the report, so it is safe to
    /// call from a push handler that must report before returning.
    pub fn report_incoming_call(
        &self,
        account_id: u32,
        message_id: u32,
        offer: Option<String>,
    ) -> Result<Uuid, CallError> {
        let (chat_id, display_name) = match self.transport.lookup_call(account_id, message_id) {
            Some(chat) => (chat.chat_id, chat.display_name),
            None => {
                tracing::warn!("No chat for call message {}", message_id);
                (0, self.settings.fallback_display_name.clone())
            }
        };
        let offer = offer.filter(|o| is_plausible_sdp(o));
        let mut call = Call::incoming(account_id, chat_id, message_id, display_name, String::new());
        call.has_video = self.settings.video
            && offer.as_deref().is_some_and(|o| o.contains("m=video"));
        call.pending_offer = offer;
        let session_id = call.session_id;

        if let Err(e) = self.claim(&call, CallState::ReportingIncoming) {
            tracing::warn!("Already in a call, ignoring call message {}", message_id);
            return Err(e);
        }

        if let Err(e) = self.integration.report_incoming(&call) {
            tracing::error!("Failed to report incoming call: {:#}", e);
            self.discard(session_id);
            return Err(CallError::Integration(e));
        }

        if call.pending_offer.is_none() {
            if let Some(Ended { call, session }) = self.take_if(|c| c.session_id == session_id) {
                tracing::warn!("Incoming call {} has no offer", message_id);
                self.integration.report_ended(&call);
                self.ui.hide_call(call.session_id);
                self.release_session(session);
                self.settle_idle();
            }
            return Err(CallError::MissingOffer);
        }

        self.set_state(
            session_id,
            &[CallState::ReportingIncoming],
            CallState::RingingIncoming,
        );
        tracing::info!("Incoming call from {}", call.display_name);
        Ok(session_id)
    }

    /// Answer the ringing incoming call identified by `key`.
    ///
    /// Returns `Ok(false)` when `key` does not name the current call.
    pub fn answer_incoming_call(self: &Arc<Self>, key: CallKey) -> Result<bool, CallError> {
        let call = {
            let mut slot = self.slot.lock();
            match slot.call.as_mut() {
                Some(c) if c.is_incoming() && c.matches(&key) && !c.accepted_locally => {
                    c.accepted_locally = true;
                    Some(c.clone())
                }
                _ => None,
            }
        };
        let Some(call) = call else {
            tracing::debug!("Ignoring answer for {:?}: no matching call", key);
            return Ok(false);
        };

        let Some(offer) = call.pending_offer.clone() else {
            self.abort(call.session_id, "nothing to answer");
            return Err(CallError::MissingOffer);
        };
        let Some(message_id) = call.signaling_message_id else {
            self.abort(call.session_id, "no call message to answer");
            return Err(CallError::MissingSignalingMessage);
        };

        tracing::info!("Answering call from {}", call.display_name);
        self.ui.show_call(&call);

        let session = match self.open_session(call.session_id) {
            Ok(session) => session,
            Err(e) => {
                self.abort(call.session_id, "peer connection setup failed");
                return Err(e);
            }
        };
        self.runtime
            .spawn(self.clone().run_incoming(call, session, offer, message_id));
        Ok(true)
    }

    async fn run_incoming(
        self: Arc<Self>,
        call: Call,
        session: Arc<CallSession>,
        offer: String,
        message_id: u32,
    ) {
        let answer = match session.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("Failed to answer call: {:#}", e);
                self.abort(call.session_id, "answer could not be created");
                return;
            }
        };
        if !self.slot.lock().is_current(call.session_id) {
            tracing::debug!("Call {} ended while answering", call.session_id);
            session.close().await;
            return;
        }

        if let Err(e) = self
            .transport
            .accept_call(call.account_id, message_id, &answer.sdp)
            .await
        {
            tracing::error!("Failed to send answer: {:#}", e);
            self.abort(call.session_id, "answer could not be sent");
            return;
        }
        if self.set_state(
            call.session_id,
            &[CallState::RingingIncoming],
            CallState::Connected,
        ) {
            tracing::info!("Call with {} accepted", call.display_name);
        }
    }

    fn on_accepted_elsewhere(&self, account_id: u32, message_id: u32) {
        let ended = self.take_if(|c| {
            c.is_incoming() && c.is_message(account_id, message_id) && !c.accepted_locally
        });
        let Some(Ended { call, session }) = ended else {
            tracing::debug!("Ignoring remote accept of message {}", message_id);
            return;
        };
        tracing::info!("Call {} accepted on another device", call.session_id);
        self.integration.report_ended(&call);
        self.ui.hide_call(call.session_id);
        self.release_session(session);
        self.settle_idle();
    }

    fn on_call_ended(&self, account_id: u32, message_id: u32) {
        let Some(Ended { call, session }) = self.take_if(|c| c.is_message(account_id, message_id))
        else {
            tracing::debug!("Ignoring end of message {}: no matching call", message_id);
            return;
        };
        tracing::info!("Call with {} ended by remote", call.display_name);
        self.integration.request_end(&call);
        if call.is_incoming() && !call.accepted_locally && !self.integration.handles_missed_calls() {
            self.integration.missed_call(&call);
        }
        self.integration.clear_incoming(&call);
        self.ui.hide_call(call.session_id);
        self.release_session(session);
        self.settle_idle();
    }

    // -----------------------------------------------------------------------
    // Local end and external events
    // -----------------------------------------------------------------------

    /// End or decline the current call. Returns false if there was none.
    pub fn hangup(&self) -> bool {
        match self.take_if(|_| true) {
            Some(ended) => {
                tracing::info!("Hanging up call {}", ended.call.session_id);
                self.end_locally(ended, true);
                true
            }
            None => false,
        }
    }

    pub fn handle_integration_event(self: &Arc<Self>, event: IntegrationEvent) {
        match event {
            IntegrationEvent::Answer(session_id) => {
                if let Err(e) = self.answer_incoming_call(CallKey::Session(session_id)) {
                    tracing::warn!("Failed to answer call: {}", e);
                }
            }
            IntegrationEvent::End(session_id) => {
                match self.take_if(|c| c.session_id == session_id) {
                    Some(ended) => self.end_locally(ended, false),
                    None => tracing::debug!("End for stale call {}", session_id),
                }
            }
            IntegrationEvent::Reset => {
                if let Some(ended) = self.take_if(|_| true) {
                    tracing::warn!("Call integration reset, dropping call {}", ended.call.session_id);
                    self.tear_down(ended, false);
                }
            }
        }
    }

    pub fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall {
                account_id,
                message_id,
                offer,
            } => {
                // Failures are logged where they happen.
                let _ = self.report_incoming_call(account_id, message_id, offer);
            }
            TransportEvent::IncomingCallAccepted {
                account_id,
                message_id,
            } => self.on_accepted_elsewhere(account_id, message_id),
            TransportEvent::OutgoingCallAccepted {
                account_id,
                message_id,
                answer,
            } => self.on_outgoing_accepted(account_id, message_id, answer),
            TransportEvent::CallEnded {
                account_id,
                message_id,
            } => self.on_call_ended(account_id, message_id),
        }
    }

    pub fn handle_push(self: &Arc<Self>, payload: &PushPayload) {
        tracing::debug!(
            "Push {:?} for message {}",
            payload.event_id,
            payload.message_id
        );
        self.handle_transport_event(payload.clone().into_event());
    }

    /// Feed transport events into the manager until the channel closes.
    pub async fn run_transport(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event);
        }
    }

    /// Feed integration callbacks into the manager until the channel closes.
    pub async fn run_integration(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<IntegrationEvent>,
    ) {
        while let Some(event) = events.recv().await {
            self.handle_integration_event(event);
        }
    }

    fn on_session_event(&self, session_id: Uuid, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                if self.slot.lock().is_current(session_id) {
                    self.ui.call_connected(session_id);
                }
            }
            SessionEvent::Failed => self.abort(session_id, "peer connection failed"),
            SessionEvent::Disconnected | SessionEvent::Closed => {
                tracing::debug!("Call {} peer {:?}", session_id, event);
            }
        }
    }
}

async fn watch_session(
    manager: Weak<CallManager>,
    session_id: Uuid,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.on_session_event(session_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::calling::integration::{select_integration, NotificationKind, SystemCallService};
    use crate::calling::loopback::{
        GatheringScript, LoopbackChat, LoopbackPeerFactory, LoopbackTransport, PeerHub,
        RecordingCallService, RecordingNotifier, RecordingUi, ServiceCall, TransportOp,
    };
    use crate::calling::peer::PeerConnection;
    use crate::calling::ice::CandidateType;

    const CHAT: u32 = 10;

    struct Fixture {
        manager: Arc<CallManager>,
        service: Arc<RecordingCallService>,
        integration_events: mpsc::UnboundedReceiver<IntegrationEvent>,
        notifier: Arc<RecordingNotifier>,
        ui: Arc<RecordingUi>,
        transport: Arc<LoopbackTransport>,
        remote: Arc<LoopbackTransport>,
        remote_events: mpsc::UnboundedReceiver<TransportEvent>,
        peers: Arc<LoopbackPeerFactory>,
    }

    fn quick_script() -> GatheringScript {
        GatheringScript::new()
            .candidate(Duration::from_millis(2), CandidateType::Host)
            .candidate(Duration::from_millis(5), CandidateType::Relay)
            .complete_after(Duration::from_millis(50))
    }

    /// Manager for account 2 ("Bob"); the test drives account 1 ("Alice").
    fn fixture(native: bool) -> Fixture {
        let chat = LoopbackChat::new(CHAT);
        let (remote, remote_events) = chat.connect(1, "Alice");
        let (transport, _events) = chat.connect(2, "Bob");
        let (tx, integration_events) = mpsc::unbounded_channel();
        let service = Arc::new(RecordingCallService::with_events(tx));
        let notifier = Arc::new(RecordingNotifier::default());
        let ui = Arc::new(RecordingUi::new());
        let peers = Arc::new(LoopbackPeerFactory::new(PeerHub::new(), quick_script(), 0));

        let native_service: Option<Arc<dyn SystemCallService>> = if native {
            Some(service.clone())
        } else {
            None
        };
        let manager = CallManager::new(
            CallSettings::default(),
            select_integration(native_service, notifier.clone()),
            transport.clone(),
            peers.clone(),
            ui.clone(),
        )
        .unwrap();
        Fixture {
            manager,
            service,
            integration_events,
            notifier,
            ui,
            transport,
            remote,
            remote_events,
            peers,
        }
    }

    impl Fixture {
        /// Have Alice send a real offer; returns the call message id.
        async fn incoming_offer(&self) -> (u32, String, Arc<dyn PeerConnection>) {
            let (peer, _events) = self.peers.create(&[]).unwrap();
            let offer = peer.create_offer().await.unwrap();
            let message_id = self.remote.place_call(1, CHAT, &offer.sdp).await.unwrap();
            (message_id, offer.sdp, peer)
        }

        async fn ring(&self) -> (u32, Uuid, Arc<dyn PeerConnection>) {
            let (message_id, offer, peer) = self.incoming_offer().await;
            let session_id = self
                .manager
                .report_incoming_call(2, message_id, Some(offer))
                .unwrap();
            (message_id, session_id, peer)
        }

        fn forward_integration_events(&mut self) {
            while let Ok(event) = self.integration_events.try_recv() {
                self.manager.handle_integration_event(event);
            }
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_call_rings_after_offer_sent() {
        let mut f = fixture(true);
        let session_id = f.manager.place_outgoing_call(2, CHAT).unwrap();
        assert_eq!(f.manager.state(), CallState::PlacingOutgoing);
        assert_eq!(f.ui.shown(), vec![session_id]);
        assert_eq!(f.service.calls(), vec![ServiceCall::RequestStart(session_id)]);

        settle().await;
        assert_eq!(f.manager.state(), CallState::RingingOutgoing);
        let call = f.manager.current_call().unwrap();
        assert_eq!(call.display_name, "Alice");
        let message_id = call.signaling_message_id.unwrap();

        match f.remote_events.try_recv().unwrap() {
            TransportEvent::IncomingCall {
                message_id: m,
                offer: Some(offer),
                ..
            } => {
                assert_eq!(m, message_id);
                assert!(offer.starts_with("v=0"));
                assert!(offer.contains("a=candidate:"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_rejected_while_active() {
        let f = fixture(true);
        let first = f.manager.place_outgoing_call(2, CHAT).unwrap();

        assert!(matches!(
            f.manager.place_outgoing_call(2, CHAT),
            Err(CallError::AlreadyActive)
        ));
        let (message_id, offer, _peer) = f.incoming_offer().await;
        assert!(matches!(
            f.manager.report_incoming_call(2, message_id, Some(offer)),
            Err(CallError::AlreadyActive)
        ));

        assert_eq!(f.manager.current_call().unwrap().session_id, first);
        assert_eq!(f.service.count(|c| matches!(c, ServiceCall::RequestStart(_))), 1);
        assert_eq!(f.service.count(|c| matches!(c, ServiceCall::ReportIncoming(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_integration_failure_returns_to_idle() {
        let f = fixture(true);
        f.service.set_failing(true);

        assert!(matches!(
            f.manager.place_outgoing_call(2, CHAT),
            Err(CallError::Integration(_))
        ));
        assert_eq!(f.manager.state(), CallState::Idle);
        assert!(f.manager.current_call().is_none());
        assert!(f.ui.shown().is_empty());

        let (message_id, offer, _peer) = f.incoming_offer().await;
        assert!(matches!(
            f.manager.report_incoming_call(2, message_id, Some(offer)),
            Err(CallError::Integration(_))
        ));
        assert_eq!(f.manager.state(), CallState::Idle);
        assert!(!f.manager.is_calling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_aborts_outgoing_call() {
        let f = fixture(true);
        f.transport.set_fail_place(true);
        let session_id = f.manager.place_outgoing_call(2, CHAT).unwrap();

        settle().await;
        assert_eq!(f.manager.state(), CallState::Idle);
        assert_eq!(f.ui.hidden(), vec![session_id]);
        assert!(f.service.calls().contains(&ServiceCall::RequestEnd(session_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_without_offer_is_reported_then_aborted() {
        let f = fixture(false);
        let (message_id, _offer, _peer) = f.incoming_offer().await;

        let result = f.manager.report_incoming_call(2, message_id, None);
        assert!(matches!(result, Err(CallError::MissingOffer)));

        assert_eq!(f.notifier.count(NotificationKind::IncomingCall), 1);
        assert_eq!(f.notifier.cleared(), vec![(2, message_id)]);
        assert_eq!(f.ui.hidden().len(), 1);
        assert_eq!(f.manager.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_without_known_chat_uses_fallback_name() {
        let f = fixture(true);
        let (_message_id, offer, _peer) = f.incoming_offer().await;

        f.manager.report_incoming_call(2, 4242, Some(offer)).unwrap();
        let call = f.manager.current_call().unwrap();
        assert_eq!(call.display_name, "Unknown");
        assert_eq!(call.chat_id, 0);
        assert_eq!(f.manager.state(), CallState::RingingIncoming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_answer_is_ignored() {
        let f = fixture(true);
        let (_message_id, _session_id, _peer) = f.ring().await;

        let answered = f
            .manager
            .answer_incoming_call(CallKey::Session(Uuid::new_v4()))
            .unwrap();
        assert!(!answered);
        assert_eq!(f.manager.state(), CallState::RingingIncoming);
        assert!(!f.manager.current_call().unwrap().accepted_locally);
        assert!(f.ui.shown().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_from_notification_action() {
        let mut f = fixture(false);
        let (message_id, session_id, _peer) = f.ring().await;

        let key = f.notifier.posted()[0].answer_key().unwrap();
        assert!(f.manager.answer_incoming_call(key).unwrap());
        assert!(!f.manager.answer_incoming_call(key).unwrap());
        assert_eq!(f.ui.shown(), vec![session_id]);

        settle().await;
        assert_eq!(f.manager.state(), CallState::Connected);
        assert_eq!(f.transport.ops(), vec![TransportOp::Accept { message_id }]);
        assert!(matches!(
            f.remote_events.try_recv(),
            Ok(TransportEvent::OutgoingCallAccepted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_elsewhere_tears_down_once() {
        let f = fixture(true);
        let (message_id, session_id, _peer) = f.ring().await;

        f.manager.handle_transport_event(TransportEvent::IncomingCallAccepted {
            account_id: 2,
            message_id,
        });
        assert_eq!(f.manager.state(), CallState::Idle);
        assert_eq!(f.service.count(|c| *c == ServiceCall::ReportEnded(session_id)), 1);
        assert_eq!(f.service.count(|c| matches!(c, ServiceCall::RequestEnd(_))), 0);

        // The caller hanging up afterwards must not ring up a missed call.
        f.manager.handle_transport_event(TransportEvent::CallEnded {
            account_id: 2,
            message_id,
        });
        assert_eq!(f.ui.hidden(), vec![session_id]);
        assert_eq!(f.notifier.count(NotificationKind::MissedCall), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_locally_ignores_remote_accept() {
        let f = fixture(true);
        let (message_id, session_id, _peer) = f.ring().await;
        f.manager
            .answer_incoming_call(CallKey::Session(session_id))
            .unwrap();

        f.manager.handle_transport_event(TransportEvent::IncomingCallAccepted {
            account_id: 2,
            message_id,
        });
        assert_eq!(f.manager.current_call().unwrap().session_id, session_id);
        assert_eq!(f.service.count(|c| matches!(c, ServiceCall::ReportEnded(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_ended_posts_missed_call() {
        let f = fixture(false);
        let (message_id, _session_id, _peer) = f.ring().await;

        f.manager.handle_transport_event(TransportEvent::CallEnded {
            account_id: 2,
            message_id,
        });
        assert_eq!(f.manager.state(), CallState::Idle);
        assert_eq!(f.notifier.count(NotificationKind::MissedCall), 1);
        assert!(f.notifier.cleared().contains(&(2, message_id)));

        f.manager.handle_transport_event(TransportEvent::CallEnded {
            account_id: 2,
            message_id,
        });
        assert_eq!(f.notifier.count(NotificationKind::MissedCall), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_integration_owns_missed_calls() {
        let f = fixture(true);
        let (message_id, session_id, _peer) = f.ring().await;

        f.manager.handle_transport_event(TransportEvent::CallEnded {
            account_id: 2,
            message_id,
        });
        assert!(f.notifier.posted().is_empty());
        assert!(f.service.calls().contains(&ServiceCall::RequestEnd(session_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_is_idempotent() {
        let mut f = fixture(true);
        let session_id = f.manager.place_outgoing_call(2, CHAT).unwrap();
        settle().await;
        let message_id = f.manager.current_call().unwrap().signaling_message_id.unwrap();

        assert!(f.manager.hangup());
        assert!(!f.manager.hangup());
        // The system service answers request_end with End for the same call.
        f.forward_integration_events();
        settle().await;

        assert_eq!(f.manager.state(), CallState::Idle);
        assert_eq!(f.ui.hidden(), vec![session_id]);
        let ends = f
            .transport
            .ops()
            .into_iter()
            .filter(|op| *op == TransportOp::End { message_id })
            .count();
        assert_eq!(ends, 1);
        assert!(f.peers.peers().iter().all(|p| p.close_count() <= 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_and_local_end_race() {
        let mut f = fixture(true);
        let session_id = f.manager.place_outgoing_call(2, CHAT).unwrap();
        settle().await;
        let message_id = f.manager.current_call().unwrap().signaling_message_id.unwrap();

        f.manager.handle_transport_event(TransportEvent::CallEnded {
            account_id: 2,
            message_id,
        });
        f.manager
            .handle_integration_event(IntegrationEvent::End(session_id));
        f.forward_integration_events();
        assert!(!f.manager.hangup());

        assert_eq!(f.ui.hidden(), vec![session_id]);
        assert_eq!(f.manager.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_integration_reset_drops_call() {
        let mut f = fixture(true);
        let (_message_id, session_id, _peer) = f.ring().await;

        f.manager.handle_integration_event(IntegrationEvent::Reset);
        assert_eq!(f.manager.state(), CallState::Idle);
        assert_eq!(f.ui.hidden(), vec![session_id]);

        settle().await;
        assert!(f.transport.ops().is_empty());
        while let Ok(event) = f.remote_events.try_recv() {
            assert!(!matches!(event, TransportEvent::CallEnded { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_connection_gets_configured_ice_servers() {
        let f = fixture(true);
        f.manager.place_outgoing_call(2, CHAT).unwrap();

        assert_eq!(
            f.peers.ice_servers(),
            vec![CallSettings::default().ice_servers]
        );
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let chat = LoopbackChat::new(CHAT);
        let (transport, _events) = chat.connect(2, "Bob");
        let result = CallManager::new(
            CallSettings::default(),
            select_integration(None, Arc::new(RecordingNotifier::default())),
            transport,
            Arc::new(LoopbackPeerFactory::new(PeerHub::new(), quick_script(), 0)),
            Arc::new(RecordingUi::new()),
        );
        assert!(matches!(result, Err(CallError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_reports_incoming_call() {
        let f = fixture(false);
        let (message_id, offer, _peer) = f.incoming_offer().await;
        let json = serde_json::json!({
            "event_id": 2550,
            "account_id": 2,
            "message_id": message_id,
            "place_call_info": offer,
        })
        .to_string();

        let payload = PushPayload::parse(&json).unwrap();
        f.manager.handle_push(&payload);
        assert_eq!(f.manager.state(), CallState::RingingIncoming);
        assert_eq!(f.notifier.count(NotificationKind::IncomingCall), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_between_two_managers() {
        let chat = LoopbackChat::new(CHAT);
        let hub = PeerHub::new();
        let mut sides = Vec::new();
        for (account, name) in [(1, "Alice"), (2, "Bob")] {
            let (transport, events) = chat.connect(account, name);
            let ui = Arc::new(RecordingUi::new());
            let notifier = Arc::new(RecordingNotifier::default());
            let manager = CallManager::new(
                CallSettings::default(),
                select_integration(None, notifier.clone()),
                transport,
                Arc::new(LoopbackPeerFactory::new(hub.clone(), quick_script(), 0)),
                ui.clone(),
            )
            .unwrap();
            tokio::spawn(manager.clone().run_transport(events));
            sides.push((manager, ui, notifier));
        }
        let (alice, alice_ui, _) = &sides[0];
        let (bob, bob_ui, bob_notifier) = &sides[1];

        let outgoing = alice.place_outgoing_call(1, CHAT).unwrap();
        settle().await;
        assert_eq!(alice.state(), CallState::RingingOutgoing);
        assert_eq!(bob.state(), CallState::RingingIncoming);

        let incoming = bob.current_call().unwrap().session_id;
        assert!(bob.answer_incoming_call(CallKey::Session(incoming)).unwrap());
        settle().await;
        assert_eq!(alice.state(), CallState::Connected);
        assert_eq!(bob.state(), CallState::Connected);
        assert_eq!(alice_ui.connected(), vec![outgoing]);
        assert_eq!(bob_ui.connected(), vec![incoming]);

        assert!(alice.hangup());
        settle().await;
        assert_eq!(bob.state(), CallState::Idle);
        assert_eq!(bob_ui.hidden(), vec![incoming]);
        assert_eq!(bob_notifier.count(NotificationKind::MissedCall), 0);
    }
}
