//! System call integration (the OS facility that rings, shows native call
//! UI and owns missed-call semantics) and the local-notification fallback
//! used where that facility is unavailable.
//!
//! [`select_integration`] picks one [`CallIntegration`] at startup; the
//! call flow never branches on which one it got.

use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use super::{Call, CallKey};

/// Notification action that answers the call.
pub const ANSWER_ACTION: &str = "answer-call";

/// Callbacks from the system call integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationEvent {
    /// The user answered from the native UI.
    Answer(Uuid),
    /// The user ended the call from the native UI.
    End(Uuid),
    /// The integration dropped all its calls.
    Reset,
}

/// The OS call service.
pub trait SystemCallService: Send + Sync {
    fn report_incoming(&self, session_id: Uuid, display_name: &str, has_video: bool) -> Result<()>;
    fn request_start(&self, session_id: Uuid, display_name: &str, has_video: bool) -> Result<()>;
    /// Ask the service to end the call; it answers with [`IntegrationEvent::End`].
    fn request_end(&self, session_id: Uuid);
    /// Tell the service the call is gone without asking it to end it.
    fn report_ended(&self, session_id: Uuid);
    /// Whether the service tracks a call that has not ended.
    fn has_active_call(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    IncomingCall,
    MissedCall,
}

/// A locally delivered call notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub account_id: u32,
    pub chat_id: u32,
    pub message_id: Option<u32>,
    pub session_id: Uuid,
    pub action: Option<&'static str>,
}

impl CallNotification {
    fn for_call(kind: NotificationKind, call: &Call) -> Self {
        let (title, body, action) = match kind {
            NotificationKind::IncomingCall => (
                call.display_name.clone(),
                if call.has_video {
                    "Incoming video call".to_string()
                } else {
                    "Incoming call".to_string()
                },
                Some(ANSWER_ACTION),
            ),
            NotificationKind::MissedCall => (
                call.display_name.clone(),
                format!("Missed call at {}", call.created_at.format("%H:%M UTC")),
                None,
            ),
        };
        Self {
            kind,
            title,
            body,
            account_id: call.account_id,
            chat_id: call.chat_id,
            message_id: call.signaling_message_id,
            session_id: call.session_id,
            action,
        }
    }

    /// Correlation key used when the user taps the notification's action.
    pub fn answer_key(&self) -> Option<CallKey> {
        match (self.kind, self.message_id) {
            (NotificationKind::IncomingCall, Some(message_id)) => Some(CallKey::Message {
                account_id: self.account_id,
                chat_id: self.chat_id,
                message_id,
            }),
            _ => None,
        }
    }
}

/// Local notification center.
pub trait Notifier: Send + Sync {
    fn post(&self, notification: CallNotification) -> Result<()>;
    /// Remove delivered incoming-call notifications for this call message.
    fn clear_incoming(&self, account_id: u32, message_id: u32);
}

/// What the call manager needs from the platform around a call.
pub trait CallIntegration: Send + Sync {
    fn report_incoming(&self, call: &Call) -> Result<()>;
    fn request_start(&self, call: &Call) -> Result<()>;
    /// Tear the call down through the integration's own end pathway.
    fn request_end(&self, call: &Call);
    /// Drop the integration's call object directly.
    fn report_ended(&self, call: &Call);
    fn has_active_call(&self) -> bool;
    /// True if the platform reports missed calls on its own.
    fn handles_missed_calls(&self) -> bool;
    fn missed_call(&self, call: &Call);
    fn clear_incoming(&self, call: &Call);
}

/// Integration backed by the OS call service.
pub struct NativeCallIntegration {
    service: Arc<dyn SystemCallService>,
}

impl NativeCallIntegration {
    pub fn new(service: Arc<dyn SystemCallService>) -> Self {
        Self { service }
    }
}

impl CallIntegration for NativeCallIntegration {
    fn report_incoming(&self, call: &Call) -> Result<()> {
        self.service
            .report_incoming(call.session_id, &call.display_name, call.has_video)
    }

    fn request_start(&self, call: &Call) -> Result<()> {
        self.service
            .request_start(call.session_id, &call.display_name, call.has_video)
    }

    fn request_end(&self, call: &Call) {
        self.service.request_end(call.session_id);
    }

    fn report_ended(&self, call: &Call) {
        self.service.report_ended(call.session_id);
    }

    fn has_active_call(&self) -> bool {
        self.service.has_active_call()
    }

    fn handles_missed_calls(&self) -> bool {
        true
    }

    fn missed_call(&self, call: &Call) {
        tracing::debug!("Missed call {} left to the system call service", call.session_id);
    }

    fn clear_incoming(&self, _call: &Call) {}
}

/// Integration that rings through local notifications.
pub struct NotificationCallIntegration {
    notifier: Arc<dyn Notifier>,
}

impl NotificationCallIntegration {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    fn clear(&self, call: &Call) {
        if let Some(message_id) = call.signaling_message_id {
            self.notifier.clear_incoming(call.account_id, message_id);
        }
    }
}

impl CallIntegration for NotificationCallIntegration {
    fn report_incoming(&self, call: &Call) -> Result<()> {
        self.notifier.post(CallNotification::for_call(
            NotificationKind::IncomingCall,
            call,
        ))
    }

    fn request_start(&self, call: &Call) -> Result<()> {
        tracing::debug!("Outgoing call {} started without system integration", call.session_id);
        Ok(())
    }

    fn request_end(&self, call: &Call) {
        self.clear(call);
    }

    fn report_ended(&self, call: &Call) {
        self.clear(call);
    }

    fn has_active_call(&self) -> bool {
        false
    }

    fn handles_missed_calls(&self) -> bool {
        false
    }

    fn missed_call(&self, call: &Call) {
        let notification = CallNotification::for_call(NotificationKind::MissedCall, call);
        if let Err(e) = self.notifier.post(notification) {
            tracing::warn!("Failed to post missed call notification: {:#}", e);
        }
    }

    fn clear_incoming(&self, call: &Call) {
        self.clear(call);
    }
}

/// Pick the integration once, at startup.
pub fn select_integration(
    service: Option<Arc<dyn SystemCallService>>,
    notifier: Arc<dyn Notifier>,
) -> Arc<dyn CallIntegration> {
    match service {
        Some(service) => {
            tracing::info!("Using system call integration");
            Arc::new(NativeCallIntegration::new(service))
        }
        None => {
            tracing::info!("System call integration unavailable, using notifications");
            Arc::new(NotificationCallIntegration::new(notifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::loopback::RecordingNotifier;

    fn incoming_call() -> Call {
        Call::incoming(1, 10, 99, "Alice".into(), "v=0\r\n".into())
    }

    #[test]
    fn test_incoming_notification_carries_correlation_keys() {
        let notifier = Arc::new(RecordingNotifier::default());
        let integration = NotificationCallIntegration::new(notifier.clone());
        let call = incoming_call();

        integration.report_incoming(&call).unwrap();

        let posted = notifier.posted();
        assert_eq!(posted.len(), 1);
        let n = &posted[0];
        assert_eq!(n.kind, NotificationKind::IncomingCall);
        assert_eq!(n.action, Some(ANSWER_ACTION));
        assert_eq!(
            n.answer_key(),
            Some(CallKey::Message {
                account_id: 1,
                chat_id: 10,
                message_id: 99
            })
        );
        assert!(call.matches(&n.answer_key().unwrap()));
    }

    #[test]
    fn test_missed_call_has_no_answer_action() {
        let notifier = Arc::new(RecordingNotifier::default());
        let integration = NotificationCallIntegration::new(notifier.clone());
        integration.missed_call(&incoming_call());

        let posted = notifier.posted();
        assert_eq!(posted[0].kind, NotificationKind::MissedCall);
        assert!(posted[0].answer_key().is_none());
        assert!(posted[0].body.starts_with("Missed call at "));
        assert!(!integration.handles_missed_calls());
    }

    #[test]
    fn test_missed_call_shows_when_it_rang() {
        use chrono::TimeZone;

        let notifier = Arc::new(RecordingNotifier::default());
        let integration = NotificationCallIntegration::new(notifier.clone());
        let mut call = incoming_call();
        call.created_at = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 30).unwrap();
        integration.missed_call(&call);

        let posted = notifier.posted();
        assert_eq!(posted[0].title, "Alice");
        assert_eq!(posted[0].body, "Missed call at 14:05 UTC");
    }

    #[test]
    fn test_fallback_end_clears_notifications() {
        let notifier = Arc::new(RecordingNotifier::default());
        let integration = NotificationCallIntegration::new(notifier.clone());
        integration.report_ended(&incoming_call());
        assert_eq!(notifier.cleared(), vec![(1, 99)]);
    }

    #[test]
    fn test_select_without_service_uses_notifications() {
        let notifier = Arc::new(RecordingNotifier::default());
        let integration = select_integration(None, notifier);
        assert!(!integration.handles_missed_calls());
        assert!(!integration.has_active_call());
    }
}
