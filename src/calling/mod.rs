//! Calls over chat messages: lifecycle, signaling and the remote video
//! pipeline.

pub mod codec;
#[cfg(feature = "sdl-display")]
pub mod display;
pub mod frame;
pub mod ice;
pub mod integration;
pub mod loopback;
pub mod manager;
pub mod peer;
pub mod pip;
pub mod push;
pub mod session;
pub mod signaling;
pub mod simulate;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    PlacingOutgoing,
    RingingOutgoing,
    ReportingIncoming,
    RingingIncoming,
    Connected,
    Ending,
}

/// One logical call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub account_id: u32,
    pub chat_id: u32,
    /// Correlates with the system call integration and the UI.
    pub session_id: Uuid,
    pub direction: CallDirection,
    /// Message carrying the SDP offer, once known.
    pub signaling_message_id: Option<u32>,
    /// Remote offer held until the user answers.
    pub pending_offer: Option<String>,
    /// Accepted on this device (as opposed to another device of the same
    /// identity).
    pub accepted_locally: bool,
    pub display_name: String,
    pub has_video: bool,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn outgoing(account_id: u32, chat_id: u32, display_name: String) -> Self {
        Self {
            account_id,
            chat_id,
            session_id: Uuid::new_v4(),
            direction: CallDirection::Outgoing,
            signaling_message_id: None,
            pending_offer: None,
            accepted_locally: false,
            display_name,
            has_video: true,
            created_at: Utc::now(),
        }
    }

    pub fn incoming(
        account_id: u32,
        chat_id: u32,
        message_id: u32,
        display_name: String,
        offer: String,
    ) -> Self {
        Self {
            account_id,
            chat_id,
            session_id: Uuid::new_v4(),
            direction: CallDirection::Incoming,
            signaling_message_id: Some(message_id),
            pending_offer: Some(offer),
            accepted_locally: false,
            display_name,
            has_video: true,
            created_at: Utc::now(),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == CallDirection::Incoming
    }

    /// Whether this call is the one carried by `message_id` of `account_id`.
    pub fn is_message(&self, account_id: u32, message_id: u32) -> bool {
        self.account_id == account_id && self.signaling_message_id == Some(message_id)
    }

    pub fn matches(&self, key: &CallKey) -> bool {
        match *key {
            CallKey::Session(id) => self.session_id == id,
            CallKey::Message {
                account_id,
                chat_id,
                message_id,
            } => self.chat_id == chat_id && self.is_message(account_id, message_id),
        }
    }
}

/// How an answer request identifies the call it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKey {
    /// From the system call integration.
    Session(Uuid),
    /// From a notification tap.
    Message {
        account_id: u32,
        chat_id: u32,
        message_id: u32,
    },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already active")]
    AlreadyActive,
    #[error("incoming call has no usable offer")]
    MissingOffer,
    #[error("call has no signaling message")]
    MissingSignalingMessage,
    #[error("no call matches the request")]
    NoMatchingCall,
    #[error("call integration failed: {0:#}")]
    Integration(anyhow::Error),
    #[error("peer connection setup failed: {0:#}")]
    Peer(anyhow::Error),
    #[error("no Tokio runtime to run calls on")]
    NoRuntime,
}
