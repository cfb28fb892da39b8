//! Picture-in-Picture video surface.
//!
//! Receives remote frames from the peer connection's track, forwards them to
//! the [`FramePipeline`] and keeps the PiP host's layout in step with the
//! incoming video size.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use super::frame::{DisplaySurface, FramePipeline, PipelineStats, UiDispatch, VideoFrame};

/// Receives decoded frames from a remote video track.
pub trait VideoRenderer: Send + Sync {
    fn render_frame(&self, frame: VideoFrame);
    /// The track's frame size changed.
    fn set_size(&self, width: u32, height: u32);
}

/// The window hosting the PiP surface.
pub trait PipHost: Send + Sync {
    fn set_preferred_content_size(&self, width: u32, height: u32);
    /// Height of the inline source view the PiP transition animates from.
    fn set_source_height(&self, height: f64);
}

pub struct PipVideoSurface {
    container_width: f64,
    size: Mutex<(u32, u32)>,
    pipeline: Mutex<FramePipeline>,
    surface: Arc<dyn DisplaySurface>,
    host: Arc<dyn PipHost>,
    dispatch: UiDispatch,
}

impl PipVideoSurface {
    pub fn new(
        container_width: f64,
        surface: Arc<dyn DisplaySurface>,
        host: Arc<dyn PipHost>,
        max_frame_rate: u32,
        dispatch: UiDispatch,
    ) -> Result<Self> {
        let pipeline = FramePipeline::start(surface.clone(), max_frame_rate, dispatch.clone())?;
        let pip = Self {
            container_width,
            size: Mutex::new((0, 0)),
            pipeline: Mutex::new(pipeline),
            surface,
            host,
            dispatch,
        };
        pip.reset_size();
        Ok(pip)
    }

    /// Back to a square until the first frame size arrives.
    pub fn reset_size(&self) {
        let side = self.container_width.round().max(1.0) as u32;
        self.set_size(side, side);
    }

    /// Inline source height for a video of `width` x `height`.
    pub fn source_height_for(&self, width: u32, height: u32) -> f64 {
        self.container_width / f64::from(width) * f64::from(height)
    }

    pub fn current_size(&self) -> (u32, u32) {
        *self.size.lock()
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.lock().stats()
    }
}

impl VideoRenderer for PipVideoSurface {
    fn render_frame(&self, frame: VideoFrame) {
        self.pipeline.lock().submit(frame);
    }

    fn set_size(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            tracing::debug!("Ignoring empty video size {}x{}", width, height);
            return;
        }
        {
            let mut size = self.size.lock();
            if *size == (width, height) {
                return;
            }
            *size = (width, height);
        }
        let host = self.host.clone();
        let source_height = self.source_height_for(width, height);
        (self.dispatch)(Box::new(move || {
            host.set_preferred_content_size(width, height);
            host.set_source_height(source_height);
        }));
    }
}

impl Drop for PipVideoSurface {
    fn drop(&mut self) {
        self.pipeline.lock().stop();
        self.surface.flush();
    }
}
