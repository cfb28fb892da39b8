//! Remote video frame pipeline. Converts decoded frames into BGRA display
//! buffers on a dedicated worker thread.
//!
//! Backpressure is drain-to-latest: a single slot holds the next frame and
//! every new frame overwrites it, so the display never lags by more than one
//! frame no matter how fast the decoder produces. Intermediate frames are
//! dropped on purpose.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Default upper bound on delivered frames per second.
pub const DEFAULT_MAX_FRAME_RATE: u32 = 25;

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

/// Clockwise rotation the receiver must apply to display a frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn radians(self) -> f64 {
        f64::from(self.degrees()).to_radians()
    }
}

/// Planar YUV 4:2:0 buffer with explicit strides.
#[derive(Debug, Clone)]
pub struct I420Planes {
    pub width: u32,
    pub height: u32,
    pub y: Bytes,
    pub stride_y: usize,
    pub u: Bytes,
    pub stride_u: usize,
    pub v: Bytes,
    pub stride_v: usize,
}

impl I420Planes {
    /// Tightly packed planes of a single color, mostly useful for tests and
    /// the loopback peer.
    pub fn solid(width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        Self {
            width,
            height,
            y: Bytes::from(vec![y; w * h]),
            stride_y: w,
            u: Bytes::from(vec![u; cw * ch]),
            stride_u: cw,
            v: Bytes::from(vec![v; cw * ch]),
            stride_v: cw,
        }
    }

    /// Split a tightly packed buffer: Y, then U, then V.
    pub fn from_packed(width: u32, height: u32, data: Bytes) -> Result<Self, ConvertError> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let (y_len, c_len) = (w * h, cw * ch);
        let needed = y_len + 2 * c_len;
        if data.len() < needed {
            return Err(ConvertError::PlaneTooSmall {
                plane: "packed",
                needed,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            y: data.slice(..y_len),
            stride_y: w,
            u: data.slice(y_len..y_len + c_len),
            stride_u: cw,
            v: data.slice(y_len + c_len..needed),
            stride_v: cw,
        })
    }
}

/// Packed 32-bit BGRA image, the layout the display surface consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgraImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: usize,
    pub data: Bytes,
}

impl BgraImage {
    /// `[b, g, r, a]` at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let off = y as usize * self.bytes_per_row + x as usize * 4;
        [
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]
    }
}

#[derive(Debug, Clone)]
pub enum FrameBuffer {
    /// Already display-compatible.
    Bgra(BgraImage),
    I420(I420Planes),
}

/// One decoded remote video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub buffer: FrameBuffer,
    pub rotation: Rotation,
    pub timestamp_us: i64,
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        match &self.buffer {
            FrameBuffer::Bgra(b) => b.width,
            FrameBuffer::I420(p) => p.width,
        }
    }

    pub fn height(&self) -> u32 {
        match &self.buffer {
            FrameBuffer::Bgra(b) => b.height,
            FrameBuffer::I420(p) => p.height,
        }
    }
}

/// What the display surface receives for one frame.
#[derive(Debug, Clone)]
pub struct DisplayBuffer {
    pub image: BgraImage,
    /// Presentation time relative to pipeline start.
    pub presentation: Duration,
    pub duration: Duration,
    pub source_timestamp_us: i64,
}

/// The layer that shows converted frames (inline view or PiP window).
pub trait DisplaySurface: Send + Sync {
    fn enqueue(&self, buffer: DisplayBuffer);
    fn set_rotation(&self, rotation: Rotation);
    /// Drop whatever image is currently shown.
    fn flush(&self);
}

/// Runs a closure on the UI-owning context.
pub type UiDispatch = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Dispatch that runs the closure on the calling thread.
pub fn inline_dispatch() -> UiDispatch {
    Arc::new(|job| job())
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("frame has zero size ({width}x{height})")]
    ZeroSize { width: u32, height: u32 },
    #[error("{plane} plane too small: need {needed} bytes, have {actual}")]
    PlaneTooSmall {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("{plane} stride {stride} shorter than row width {row}")]
    StrideTooSmall {
        plane: &'static str,
        stride: usize,
        row: usize,
    },
    #[error("pixel buffer allocation failed: {0}")]
    Allocation(#[from] std::collections::TryReserveError),
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 studio-swing YUV to RGB with 8-bit fixed-point coefficients.
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

fn check_plane(
    plane: &'static str,
    data: &[u8],
    stride: usize,
    row: usize,
    rows: usize,
) -> Result<(), ConvertError> {
    if stride < row {
        return Err(ConvertError::StrideTooSmall { plane, stride, row });
    }
    let needed = stride
        .checked_mul(rows - 1)
        .and_then(|n| n.checked_add(row))
        .unwrap_or(usize::MAX);
    if data.len() < needed {
        return Err(ConvertError::PlaneTooSmall {
            plane,
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Convert I420 planes into a packed BGRA image (alpha = 255).
///
/// Each chroma sample covers a 2x2 block of luma samples.
pub fn i420_to_bgra(planes: &I420Planes) -> Result<BgraImage, ConvertError> {
    let (width, height) = (planes.width as usize, planes.height as usize);
    if width == 0 || height == 0 {
        return Err(ConvertError::ZeroSize {
            width: planes.width,
            height: planes.height,
        });
    }
    let (chroma_w, chroma_h) = (width.div_ceil(2), height.div_ceil(2));
    check_plane("Y", &planes.y, planes.stride_y, width, height)?;
    check_plane("U", &planes.u, planes.stride_u, chroma_w, chroma_h)?;
    check_plane("V", &planes.v, planes.stride_v, chroma_w, chroma_h)?;

    let bytes_per_row = width * 4;
    let mut out: Vec<u8> = Vec::new();
    out.try_reserve_exact(bytes_per_row * height)?;
    out.resize(bytes_per_row * height, 0);

    for (row, dst) in out.chunks_exact_mut(bytes_per_row).enumerate() {
        let y_row = &planes.y[row * planes.stride_y..];
        let u_row = &planes.u[(row / 2) * planes.stride_u..];
        let v_row = &planes.v[(row / 2) * planes.stride_v..];

        for (col, px) in dst.chunks_exact_mut(4).enumerate() {
            let [r, g, b] = yuv_to_rgb(y_row[col], u_row[col / 2], v_row[col / 2]);
            px.copy_from_slice(&[b, g, r, 255]);
        }
    }

    Ok(BgraImage {
        width: planes.width,
        height: planes.height,
        bytes_per_row,
        data: Bytes::from(out),
    })
}

/// Produce a display-ready image, reusing the buffer when it already is one.
pub fn to_display_image(frame: &VideoFrame) -> Result<BgraImage, ConvertError> {
    match &frame.buffer {
        FrameBuffer::Bgra(image) => Ok(image.clone()),
        FrameBuffer::I420(planes) => i420_to_bgra(planes),
    }
}

// ---------------------------------------------------------------------------
// Frame slot
// ---------------------------------------------------------------------------

/// At most one waiting frame plus the in-flight flag.
#[derive(Debug, Default)]
pub struct FrameSlot {
    next: Option<(u64, VideoFrame)>,
    processing: bool,
    seq: u64,
}

impl FrameSlot {
    /// Store `frame`, replacing any frame still waiting. Returns the
    /// frame's sequence number and whether an unprocessed frame was dropped.
    pub fn put(&mut self, frame: VideoFrame) -> (u64, bool) {
        self.seq += 1;
        let dropped = self.next.replace((self.seq, frame)).is_some();
        (self.seq, dropped)
    }

    /// Take the waiting frame unless a conversion is already in flight.
    pub fn begin(&mut self) -> Option<(u64, VideoFrame)> {
        if self.processing {
            return None;
        }
        let next = self.next.take()?;
        self.processing = true;
        Some(next)
    }

    /// End the in-flight conversion; true if a newer frame is waiting.
    pub fn finish(&mut self) -> bool {
        self.processing = false;
        self.next.is_some()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Counters for the pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub delivered: u64,
    /// Frames overwritten in the slot before conversion.
    pub superseded: u64,
    /// Frames that failed conversion.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    slot: Mutex<SlotState>,
    wake: Condvar,
    counters: Counters,
}

#[derive(Default)]
struct SlotState {
    slot: FrameSlot,
    shutdown: bool,
}

/// Frame converter with its own worker thread.
pub struct FramePipeline {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FramePipeline {
    /// Spawn the conversion worker delivering into `surface`.
    pub fn start(
        surface: Arc<dyn DisplaySurface>,
        max_frame_rate: u32,
        dispatch: UiDispatch,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(SlotState::default()),
            wake: Condvar::new(),
            counters: Counters::default(),
        });
        let frame_duration = Duration::from_secs(1) / max_frame_rate.max(1);

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("frame-convert".into())
                .spawn(move || convert_loop(shared, surface, frame_duration, dispatch))
                .context("Failed to spawn frame conversion thread")?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Hand a decoded frame to the pipeline. Never blocks on conversion.
    pub fn submit(&self, frame: VideoFrame) {
        let counters = &self.shared.counters;
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.slot.lock();
        if state.shutdown {
            return;
        }
        let (_, dropped) = state.slot.put(frame);
        if dropped {
            counters.superseded.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.shared.slot.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn convert_loop(
    shared: Arc<Shared>,
    surface: Arc<dyn DisplaySurface>,
    frame_duration: Duration,
    dispatch: UiDispatch,
) {
    let started = Instant::now();
    let mut next_due: Option<Instant> = None;
    let mut rotation: Option<Rotation> = None;

    loop {
        let (seq, frame) = {
            let mut state = shared.slot.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(due) = next_due {
                    if Instant::now() < due {
                        // Frames arriving meanwhile keep overwriting the slot.
                        shared.wake.wait_until(&mut state, due);
                        continue;
                    }
                }
                if let Some(next) = state.slot.begin() {
                    break next;
                }
                shared.wake.wait(&mut state);
            }
        };

        match to_display_image(&frame) {
            Ok(image) => {
                let now = Instant::now();
                let buffer = DisplayBuffer {
                    image,
                    presentation: now.duration_since(started),
                    duration: frame_duration,
                    source_timestamp_us: frame.timestamp_us,
                };
                let rotate_to = (rotation != Some(frame.rotation)).then_some(frame.rotation);
                rotation = Some(frame.rotation);

                let surface = surface.clone();
                dispatch(Box::new(move || {
                    surface.enqueue(buffer);
                    if let Some(r) = rotate_to {
                        surface.set_rotation(r);
                    }
                }));
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                next_due = Some(now + frame_duration);
            }
            Err(e) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping video frame #{}: {}", seq, e);
            }
        }

        if shared.slot.lock().slot.finish() {
            tracing::trace!("Newer frame waiting after #{}", seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn frame(ts: i64) -> VideoFrame {
        VideoFrame {
            buffer: FrameBuffer::I420(I420Planes::solid(4, 4, 128, 128, 128)),
            rotation: Rotation::Deg0,
            timestamp_us: ts,
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        frames: Mutex<Vec<i64>>,
        rotations: Mutex<Vec<Rotation>>,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        entered: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl DisplaySurface for RecordingSurface {
        fn enqueue(&self, buffer: DisplayBuffer) {
            self.frames.lock().push(buffer.source_timestamp_us);
            if let Some(tx) = self.entered.lock().take() {
                let _ = tx.send(());
            }
            let gate = self.gate.lock().take();
            if let Some(rx) = gate {
                let _ = rx.recv();
            }
        }
        fn set_rotation(&self, rotation: Rotation) {
            self.rotations.lock().push(rotation);
        }
        fn flush(&self) {}
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_white_and_black() {
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
    }

    #[test]
    fn test_known_triples() {
        // Mid grey: c = 110 -> (298 * 110 + 128) >> 8 = 128
        assert_eq!(yuv_to_rgb(126, 128, 128), [128, 128, 128]);
        // Saturated red in BT.601 studio swing.
        let [r, g, b] = yuv_to_rgb(81, 90, 240);
        assert_eq!(r, 255);
        assert!(g < 2, "g = {}", g);
        assert!(b < 2, "b = {}", b);
        // Clamping both ends.
        assert_eq!(yuv_to_rgb(0, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(255, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn test_i420_to_bgra_layout_and_chroma_sharing() {
        // 4x2 frame: left 2x2 block white-ish chroma neutral, right block
        // with strong blue chroma.
        let planes = I420Planes {
            width: 4,
            height: 2,
            y: Bytes::from(vec![235, 235, 41, 41, 235, 235, 41, 41]),
            stride_y: 4,
            u: Bytes::from(vec![128, 240]),
            stride_u: 2,
            v: Bytes::from(vec![128, 110]),
            stride_v: 2,
        };
        let img = i420_to_bgra(&planes).unwrap();
        assert_eq!(img.bytes_per_row, 16);
        assert_eq!(img.data.len(), 32);
        assert_eq!(img.pixel(0, 0), [255, 255, 255, 255]);
        assert_eq!(img.pixel(1, 1), [255, 255, 255, 255]);

        let [b, g, r] = {
            let [r, g, b] = yuv_to_rgb(41, 240, 110);
            [b, g, r]
        };
        assert_eq!(img.pixel(2, 0), [b, g, r, 255]);
        assert_eq!(img.pixel(3, 1), [b, g, r, 255]);
    }

    #[test]
    fn test_i420_honours_strides_and_odd_sizes() {
        // 3x3 frame with padded rows.
        let planes = I420Planes {
            width: 3,
            height: 3,
            y: Bytes::from(vec![
                16, 16, 16, 0, 0, //
                16, 16, 16, 0, 0, //
                235, 235, 235, 0, 0,
            ]),
            stride_y: 5,
            u: Bytes::from(vec![128, 128, 9, 128, 128, 9]),
            stride_u: 3,
            v: Bytes::from(vec![128, 128, 9, 128, 128, 9]),
            stride_v: 3,
        };
        let img = i420_to_bgra(&planes).unwrap();
        assert_eq!(img.pixel(2, 1), [0, 0, 0, 255]);
        assert_eq!(img.pixel(2, 2), [255, 255, 255, 255]);
    }

    #[test]
    fn test_from_packed_splits_planes() {
        let mut data = vec![16u8; 4 * 3];
        data.extend_from_slice(&[128; 2 * 2]);
        data.extend_from_slice(&[200; 2 * 2]);
        let planes = I420Planes::from_packed(4, 3, Bytes::from(data)).unwrap();
        assert_eq!(planes.y.len(), 12);
        assert_eq!(planes.stride_u, 2);
        assert_eq!(planes.v[0], 200);

        let short = I420Planes::from_packed(4, 3, Bytes::from(vec![0u8; 12]));
        assert!(matches!(short, Err(ConvertError::PlaneTooSmall { .. })));
    }

    #[test]
    fn test_i420_rejects_short_planes() {
        let mut planes = I420Planes::solid(4, 4, 16, 128, 128);
        planes.v = Bytes::from(vec![128; 3]);
        assert!(matches!(
            i420_to_bgra(&planes),
            Err(ConvertError::PlaneTooSmall { plane: "V", .. })
        ));

        let mut planes = I420Planes::solid(4, 4, 16, 128, 128);
        planes.stride_y = usize::MAX / 2;
        assert!(matches!(
            i420_to_bgra(&planes),
            Err(ConvertError::PlaneTooSmall { plane: "Y", needed: usize::MAX, .. })
        ));

        let mut planes = I420Planes::solid(4, 4, 16, 128, 128);
        planes.stride_y = 2;
        assert!(matches!(
            i420_to_bgra(&planes),
            Err(ConvertError::StrideTooSmall { plane: "Y", .. })
        ));

        let planes = I420Planes::solid(0, 4, 16, 128, 128);
        assert!(matches!(i420_to_bgra(&planes), Err(ConvertError::ZeroSize { .. })));
    }

    #[test]
    fn test_bgra_passthrough_shares_buffer() {
        let data = Bytes::from(vec![1u8; 16]);
        let frame = VideoFrame {
            buffer: FrameBuffer::Bgra(BgraImage {
                width: 2,
                height: 2,
                bytes_per_row: 8,
                data: data.clone(),
            }),
            rotation: Rotation::Deg0,
            timestamp_us: 0,
        };
        let img = to_display_image(&frame).unwrap();
        assert_eq!(img.data.as_ptr(), data.as_ptr());
    }

    #[test]
    fn test_slot_latest_wins() {
        let mut slot = FrameSlot::default();
        let (first, dropped) = slot.put(frame(1));
        assert!(!dropped);
        let (seq, f) = slot.begin().unwrap();
        assert_eq!(seq, first);
        assert_eq!(f.timestamp_us, 1);

        // Submitted while conversion is in flight.
        for ts in 2..=6 {
            slot.put(frame(ts));
        }
        assert!(slot.begin().is_none());
        assert!(slot.finish());

        let (_, f) = slot.begin().unwrap();
        assert_eq!(f.timestamp_us, 6);
        assert!(!slot.finish());
        assert!(slot.begin().is_none());
    }

    #[test]
    fn test_pipeline_converts_latest_after_in_flight() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let surface = Arc::new(RecordingSurface::default());
        *surface.gate.lock() = Some(gate_rx);
        *surface.entered.lock() = Some(entered_tx);

        let mut pipeline = FramePipeline::start(surface.clone(), 1000, inline_dispatch()).unwrap();
        pipeline.submit(frame(1));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Frame 1 is stuck in delivery; these all land in the slot.
        for ts in 2..=10 {
            pipeline.submit(frame(ts));
        }
        gate_tx.send(()).unwrap();

        wait_for(|| surface.frames.lock().len() >= 2);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(*surface.frames.lock(), vec![1, 10]);

        let stats = pipeline.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.superseded, 8);
        pipeline.stop();
    }

    #[test]
    fn test_pipeline_rotation_only_on_change() {
        let surface = Arc::new(RecordingSurface::default());
        let mut pipeline = FramePipeline::start(surface.clone(), 1000, inline_dispatch()).unwrap();

        for (ts, rotation) in [
            (1, Rotation::Deg0),
            (2, Rotation::Deg0),
            (3, Rotation::Deg90),
            (4, Rotation::Deg90),
        ] {
            let mut f = frame(ts);
            f.rotation = rotation;
            pipeline.submit(f);
            let expected = ts as usize;
            wait_for(|| surface.frames.lock().len() >= expected);
        }

        assert_eq!(*surface.rotations.lock(), vec![Rotation::Deg0, Rotation::Deg90]);
        pipeline.stop();
    }

    #[test]
    fn test_pipeline_skips_bad_frames() {
        let surface = Arc::new(RecordingSurface::default());
        let mut pipeline = FramePipeline::start(surface.clone(), 1000, inline_dispatch()).unwrap();

        let mut bad = frame(1);
        if let FrameBuffer::I420(p) = &mut bad.buffer {
            p.y = Bytes::new();
        }
        pipeline.submit(bad);
        wait_for(|| pipeline.stats().failed == 1);

        pipeline.submit(frame(2));
        wait_for(|| surface.frames.lock().len() == 1);
        assert_eq!(*surface.frames.lock(), vec![2]);
        pipeline.stop();
    }

    #[test]
    fn test_pipeline_rate_bound() {
        let surface = Arc::new(RecordingSurface::default());
        let mut pipeline = FramePipeline::start(surface.clone(), 10, inline_dispatch()).unwrap();

        let started = Instant::now();
        pipeline.submit(frame(1));
        wait_for(|| surface.frames.lock().len() == 1);
        pipeline.submit(frame(2));
        wait_for(|| surface.frames.lock().len() == 2);
        assert!(started.elapsed() >= Duration::from_millis(90));
        pipeline.stop();
    }
}
