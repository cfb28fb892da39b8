//! Out-of-band push payloads that wake the app for call events.

use anyhow::{bail, Context, Result};
use serde::de;
use serde::Deserialize;

use super::signaling::TransportEvent;

/// Event code for an incoming call.
pub const EVENT_INCOMING_CALL: u32 = 2550;
/// Event code for "incoming call accepted on another device".
pub const EVENT_INCOMING_CALL_ACCEPTED: u32 = 2560;
/// Event code for a call that ended.
pub const EVENT_CALL_ENDED: u32 = 2580;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEventKind {
    IncomingCall,
    IncomingCallAccepted,
    CallEnded,
}

impl PushEventKind {
    fn from_code(code: u64) -> Option<Self> {
        match u32::try_from(code).ok()? {
            EVENT_INCOMING_CALL => Some(Self::IncomingCall),
            EVENT_INCOMING_CALL_ACCEPTED => Some(Self::IncomingCallAccepted),
            EVENT_CALL_ENDED => Some(Self::CallEnded),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "incoming_call" => Some(Self::IncomingCall),
            "incoming_call_accepted" => Some(Self::IncomingCallAccepted),
            "call_ended" => Some(Self::CallEnded),
            _ => None,
        }
    }
}

fn event_kind<'de, D: de::Deserializer<'de>>(d: D) -> std::result::Result<PushEventKind, D::Error> {
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = PushEventKind;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a call event code or name")
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<PushEventKind, E> {
            PushEventKind::from_code(v)
                .ok_or_else(|| E::custom(format!("unsupported event_id {}", v)))
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<PushEventKind, E> {
            u64::try_from(v)
                .map_err(E::custom)
                .and_then(|v| self.visit_u64(v))
        }
        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<PushEventKind, E> {
            if let Ok(code) = v.parse::<u64>() {
                return self.visit_u64(code);
            }
            PushEventKind::from_name(v)
                .ok_or_else(|| E::custom(format!("unsupported event_id {:?}", v)))
        }
    }
    d.deserialize_any(Visitor)
}

/// `{ event_id, account_id, message_id, place_call_info? }`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    #[serde(deserialize_with = "event_kind")]
    pub event_id: PushEventKind,
    pub account_id: u32,
    pub message_id: u32,
    #[serde(default)]
    pub place_call_info: Option<String>,
}

impl PushPayload {
    /// Parse a push payload.
    ///
    /// Accepts the bare object or an envelope whose `payload` field holds
    /// it, either inline or as a JSON string.
    pub fn parse(json_str: &str) -> Result<Self> {
        let v: serde_json::Value =
            serde_json::from_str(json_str).context("push payload is not JSON")?;

        if v.get("event_id").is_some() {
            return serde_json::from_value(v).context("invalid call push payload");
        }

        match v.get("payload") {
            Some(serde_json::Value::String(inner)) => Self::parse(inner),
            Some(inner) if inner.get("event_id").is_some() => {
                serde_json::from_value(inner.clone()).context("invalid call push payload")
            }
            _ => bail!("push payload has no event_id"),
        }
    }

    /// The transport event this push stands in for.
    pub fn into_event(self) -> TransportEvent {
        match self.event_id {
            PushEventKind::IncomingCall => TransportEvent::IncomingCall {
                account_id: self.account_id,
                message_id: self.message_id,
                offer: self.place_call_info,
            },
            PushEventKind::IncomingCallAccepted => TransportEvent::IncomingCallAccepted {
                account_id: self.account_id,
                message_id: self.message_id,
            },
            PushEventKind::CallEnded => TransportEvent::CallEnded {
                account_id: self.account_id,
                message_id: self.message_id,
            },
        }
    }
}
