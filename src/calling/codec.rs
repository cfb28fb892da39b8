//! ICE trickle wire codec.
//!
//! Each locally gathered candidate travels over the private signaling data
//! channel as one compact JSON object:
//!
//! ```json
//! {"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 21730 typ host","sdpMLineIndex":0,"sdpMid":"0"}
//! ```
//!
//! `candidate` carries the SDP attribute value (without the `a=` prefix), so
//! it can be handed to the peer connection verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed ICE candidate record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("ICE candidate record has an empty candidate line")]
    EmptyCandidate,
}

/// One trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: i32,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidateRecord {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: i32, sdp_mid: Option<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid,
        }
    }

    /// Encode as the JSON bytes sent over the data channel.
    pub fn to_json(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode one data channel message.
    pub fn from_json(data: &[u8]) -> Result<Self, CodecError> {
        let record: IceCandidateRecord = serde_json::from_slice(data)?;
        if record.candidate.trim().is_empty() {
            return Err(CodecError::EmptyCandidate);
        }
        Ok(record)
    }
}
