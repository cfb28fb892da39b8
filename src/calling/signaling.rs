//! Messaging-transport signaling. Calls are placed, accepted and ended by
//! attaching SDP payloads to chat messages.
//!
//! The transport owns delivery, ordering and encryption. This module only
//! fixes the operations the call core needs and the events it consumes.

use anyhow::Result;
use async_trait::async_trait;

/// Chat a call message belongs to, resolved from the local message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub chat_id: u32,
    pub display_name: String,
}

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Send the SDP offer into `chat_id`; returns the id of the call message.
    async fn place_call(&self, account_id: u32, chat_id: u32, offer_sdp: &str) -> Result<u32>;

    /// Answer the call carried by `message_id`.
    async fn accept_call(&self, account_id: u32, message_id: u32, answer_sdp: &str) -> Result<()>;

    /// Tell the other side the call carried by `message_id` is over.
    async fn end_call(&self, account_id: u32, message_id: u32) -> Result<()>;

    /// Look up the chat of a call message. Must not block on the network.
    fn lookup_call(&self, account_id: u32, message_id: u32) -> Option<ChatInfo>;

    /// Display name of a chat, if the local store knows it.
    fn chat_name(&self, account_id: u32, chat_id: u32) -> Option<String>;
}

/// Call-related events emitted by the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    IncomingCall {
        account_id: u32,
        message_id: u32,
        offer: Option<String>,
    },
    /// Another device of the same identity accepted the incoming call.
    IncomingCallAccepted { account_id: u32, message_id: u32 },
    /// The callee answered our outgoing call.
    OutgoingCallAccepted {
        account_id: u32,
        message_id: u32,
        answer: String,
    },
    CallEnded { account_id: u32, message_id: u32 },
}
