//! ICE gathering support: candidate classification, the "enough ICE"
//! heuristic and the pending-candidate buffer used for trickling.
//!
//! The initial SDP is sent as soon as gathering is good enough rather than
//! complete:
//! 1. gathering reported complete, or
//! 2. a relay candidate was produced, or
//! 3. a server-reflexive candidate was produced and the grace period passed
//!    without anything better.
//!
//! Everything gathered later reaches the remote side over the trickle
//! data channel.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::time::Instant;

use super::codec::IceCandidateRecord;

/// Default wait after the first server-reflexive candidate.
pub const DEFAULT_SRFLX_GRACE: Duration = Duration::from_millis(150);

// ---------------------------------------------------------------------------
// Candidate lines
// ---------------------------------------------------------------------------

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

/// ICE transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// The fields of a candidate line this crate cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateLine {
    pub foundation: String,
    pub component: u16,
    pub transport: Transport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
}

/// Parse a `candidate:` attribute value (an `a=` prefix is tolerated).
pub fn parse_candidate(line: &str) -> Result<CandidateLine> {
    let line = line.trim();
    let content = line.strip_prefix("a=").unwrap_or(line);
    let Some(content) = content.strip_prefix("candidate:") else {
        bail!("not a candidate line: {}", line);
    };

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u16 = parts[1].parse().context("bad component")?;
    let transport = match parts[2].to_ascii_lowercase().as_str() {
        "udp" => Transport::Udp,
        "tcp" => Transport::Tcp,
        other => bail!("unsupported transport: {}", other),
    };
    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    let port: u16 = parts[5].parse().context("bad port")?;

    if parts[6] != "typ" {
        bail!("expected 'typ' keyword at position 6, got: {}", parts[6]);
    }
    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    Ok(CandidateLine {
        foundation,
        component,
        transport,
        priority,
        address,
        port,
        candidate_type,
    })
}

// ---------------------------------------------------------------------------
// Gathering heuristic
// ---------------------------------------------------------------------------

/// What has been gathered so far for the current local description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatheringProgress {
    pub complete: bool,
    pub relay_seen: bool,
    /// When the first server-reflexive candidate showed up.
    pub srflx_seen_at: Option<Instant>,
}

impl GatheringProgress {
    /// Record a locally gathered candidate.
    pub fn note_candidate(&mut self, candidate_type: CandidateType, now: Instant) {
        match candidate_type {
            CandidateType::Relay => self.relay_seen = true,
            CandidateType::ServerReflexive => {
                self.srflx_seen_at.get_or_insert(now);
            }
            CandidateType::Host | CandidateType::PeerReflexive => {}
        }
    }

    pub fn note_complete(&mut self) {
        self.complete = true;
    }

    /// Whether the current local description is good enough to send.
    pub fn is_sufficient(&self, now: Instant, grace: Duration) -> bool {
        if self.complete || self.relay_seen {
            return true;
        }
        self.srflx_seen_at
            .map(|seen| now.saturating_duration_since(seen) >= grace)
            .unwrap_or(false)
    }

    /// The instant the srflx grace period runs out, if it is running.
    fn grace_deadline(&self, grace: Duration) -> Option<Instant> {
        self.srflx_seen_at.map(|seen| seen + grace)
    }
}

/// Wait until `progress` satisfies the heuristic.
///
/// Suspends on the watch channel fed by the peer event driver and, once a
/// server-reflexive candidate exists, races it against the grace timer.
/// Returns early if the sender is dropped (session closed).
pub async fn wait_for_enough_ice(mut progress: watch::Receiver<GatheringProgress>, grace: Duration) {
    loop {
        let deadline = {
            let current = progress.borrow_and_update();
            if current.is_sufficient(Instant::now(), grace) {
                return;
            }
            current.grace_deadline(grace)
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::debug!("ICE grace period elapsed after srflx candidate");
                        return;
                    }
                    changed = progress.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            None => {
                if progress.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pending candidates
// ---------------------------------------------------------------------------

/// Local candidates collected before the trickle channel is open.
///
/// Candidates are released in generation order exactly once; after
/// [`PendingCandidates::open`] the buffer stays empty and new candidates are
/// handed straight back for immediate sending.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    buffered: Vec<IceCandidateRecord>,
    open: bool,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate, or return it if the channel is already open.
    pub fn push(&mut self, candidate: IceCandidateRecord) -> Option<IceCandidateRecord> {
        if self.open {
            Some(candidate)
        } else {
            self.buffered.push(candidate);
            None
        }
    }

    /// Mark the channel open and take everything buffered so far.
    pub fn open(&mut self) -> Vec<IceCandidateRecord> {
        self.open = true;
        std::mem::take(&mut self.buffered)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}
