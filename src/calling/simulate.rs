//! In-process call between two call managers over the loopback chat and
//! peer connections.
//!
//! The caller rings through the system call service, the callee through
//! notifications and shows remote video on a PiP surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::frame::{inline_dispatch, DisplaySurface};
use super::integration::{select_integration, NotificationKind, SystemCallService};
use super::loopback::{
    CountingSurface, GatheringScript, LoopbackChat, LoopbackPeerFactory, PeerHub,
    RecordingCallService, RecordingNotifier, RecordingPipHost, RecordingUi,
};
use super::manager::CallManager;
use super::pip::PipVideoSurface;
use super::CallState;
use crate::config::CallSettings;

const CALLER_ACCOUNT: u32 = 1;
const CALLEE_ACCOUNT: u32 = 2;
const CHAT_ID: u32 = 10;
/// Width of the callee's inline video view.
const CONTAINER_WIDTH: f64 = 320.0;
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Callee declines instead of answering.
    pub decline: bool,
    /// Frames the caller's loopback camera sends once connected.
    pub video_frames: u32,
    /// How long the connected call stays up.
    pub hold: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            decline: false,
            video_frames: 0,
            hold: Duration::from_millis(500),
        }
    }
}

/// Result of a simulated call.
#[derive(Debug)]
pub struct SimulationReport {
    pub call_placed: bool,
    pub call_accepted: bool,
    pub caller_connected: bool,
    pub callee_connected: bool,
    pub frames_submitted: u64,
    pub frames_displayed: u64,
    pub frames_superseded: u64,
    pub pip_size: (u32, u32),
    pub missed_calls: usize,
    pub caller_final: CallState,
    pub callee_final: CallState,
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) -> Result<()> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            bail!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Run one call from "Alice" to "Bob" and report what happened.
///
/// `surface` receives Bob's converted remote video; a counting surface
/// stands in when it is `None`.
pub async fn run_simulation(
    settings: &CallSettings,
    options: &SimulationOptions,
    surface: Option<Arc<dyn DisplaySurface>>,
) -> Result<SimulationReport> {
    let chat = LoopbackChat::new(CHAT_ID);
    let hub = PeerHub::new();

    // Caller: system call service.
    let (caller_transport, caller_events) = chat.connect(CALLER_ACCOUNT, "Alice");
    let (service_tx, service_events) = mpsc::unbounded_channel();
    let service = Arc::new(RecordingCallService::with_events(service_tx));
    let caller_service: Arc<dyn SystemCallService> = service.clone();
    let caller_ui = Arc::new(RecordingUi::new());
    let caller = CallManager::new(
        settings.clone(),
        select_integration(Some(caller_service), Arc::new(RecordingNotifier::default())),
        caller_transport,
        Arc::new(LoopbackPeerFactory::new(
            hub.clone(),
            GatheringScript::typical(),
            options.video_frames,
        )),
        caller_ui.clone(),
    )?;

    // Callee: notifications and a PiP surface.
    let (callee_transport, callee_events) = chat.connect(CALLEE_ACCOUNT, "Bob");
    let notifier = Arc::new(RecordingNotifier::default());
    let surface: Arc<dyn DisplaySurface> = match surface {
        Some(surface) => surface,
        None => CountingSurface::new(),
    };
    let pip_host = RecordingPipHost::new();
    let pip = Arc::new(
        PipVideoSurface::new(
            CONTAINER_WIDTH,
            surface,
            pip_host.clone(),
            settings.max_frame_rate,
            inline_dispatch(),
        )
        .context("Failed to create video surface")?,
    );
    let callee_ui = Arc::new(RecordingUi::with_renderer(pip.clone()));
    let callee = CallManager::new(
        settings.clone(),
        select_integration(None, notifier.clone()),
        callee_transport,
        Arc::new(LoopbackPeerFactory::new(
            hub.clone(),
            GatheringScript::typical(),
            options.video_frames,
        )),
        callee_ui.clone(),
    )?;

    let pumps = [
        tokio::spawn(caller.clone().run_transport(caller_events)),
        tokio::spawn(caller.clone().run_integration(service_events)),
        tokio::spawn(callee.clone().run_transport(callee_events)),
    ];

    println!();
    println!("=== Call Simulation ===");
    println!("Caller:   Alice (account {})", CALLER_ACCOUNT);
    println!("Callee:   Bob (account {})", CALLEE_ACCOUNT);
    println!("ICE grace: {:?}", settings.srflx_grace);
    if options.video_frames > 0 {
        println!("Video:    {} frames @ max {} fps", options.video_frames, settings.max_frame_rate);
    }

    let outgoing = caller
        .place_outgoing_call(CALLER_ACCOUNT, CHAT_ID)
        .context("Failed to place call")?;
    println!("call_placed=true");
    tracing::info!("Outgoing call {}", outgoing);

    wait_until("the callee to ring", || {
        callee.state() == CallState::RingingIncoming
    })
    .await?;
    println!("callee_ringing=true");

    let mut call_accepted = false;
    if options.decline {
        tracing::info!("Callee declines");
        callee.hangup();
        wait_until("the caller to hang up", || caller.state() == CallState::Idle).await?;
    } else {
        let key = notifier
            .posted()
            .iter()
            .rev()
            .find(|n| n.kind == NotificationKind::IncomingCall)
            .and_then(|n| n.answer_key())
            .context("No incoming call notification to answer from")?;
        callee
            .answer_incoming_call(key)
            .context("Failed to answer call")?;
        futures::future::try_join(
            wait_until("the caller to connect", || {
                caller.state() == CallState::Connected && !caller_ui.connected().is_empty()
            }),
            wait_until("the callee to connect", || {
                callee.state() == CallState::Connected
            }),
        )
        .await?;
        call_accepted = true;
        println!("call_accepted=true");

        tracing::info!("Call active, holding for {:?}", options.hold);
        tokio::time::sleep(options.hold).await;
        caller.hangup();
        wait_until("the callee to hang up", || callee.state() == CallState::Idle).await?;
    }

    for pump in pumps {
        pump.abort();
    }

    let stats = pip.stats();
    let report = SimulationReport {
        call_placed: true,
        call_accepted,
        caller_connected: !caller_ui.connected().is_empty(),
        callee_connected: !callee_ui.connected().is_empty(),
        frames_submitted: stats.submitted,
        frames_displayed: stats.delivered,
        frames_superseded: stats.superseded,
        pip_size: pip.current_size(),
        missed_calls: notifier.count(NotificationKind::MissedCall),
        caller_final: caller.state(),
        callee_final: callee.state(),
    };

    if !call_accepted {
        println!("call_accepted=false");
    }
    println!("caller_connected={}", report.caller_connected);
    println!("callee_connected={}", report.callee_connected);
    println!("frames_submitted={}", report.frames_submitted);
    println!("frames_displayed={}", report.frames_displayed);
    println!("frames_superseded={}", report.frames_superseded);
    println!("pip_size={}x{}", report.pip_size.0, report.pip_size.1);
    println!("missed_calls={}", report.missed_calls);
    Ok(report)
}
