//! SDL2 window showing converted remote video.
//!
//! Implements [`DisplaySurface`] by handing BGRA buffers to a dedicated
//! window thread over a small bounded channel. SDL2 wants its window owned
//! by one thread; on Linux any thread will do.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use sdl2::pixels::PixelFormatEnum;
use sdl2::rect::Rect;

use super::frame::{DisplayBuffer, DisplaySurface, Rotation};

enum Command {
    Frame(DisplayBuffer),
    Rotate(Rotation),
    Flush,
}

/// Video window handle. Dropping it closes the window.
pub struct SdlDisplay {
    tx: Mutex<Option<mpsc::SyncSender<Command>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SdlDisplay {
    /// Open a window titled `title`.
    pub fn start(title: &str) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Command>(2);
        let title = title.to_string();

        let handle = std::thread::Builder::new()
            .name("sdl-display".into())
            .spawn(move || {
                if let Err(e) = display_loop(&title, rx) {
                    tracing::error!("Video display loop exited: {:#}", e);
                }
            })
            .context("Failed to spawn display thread")?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) {
        if let Some(tx) = self.tx.lock().as_ref() {
            if let Err(mpsc::TrySendError::Full(_)) = tx.try_send(command) {
                tracing::trace!("Display busy, dropping command");
            }
        }
    }

    /// Close the window and wait for its thread.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SdlDisplay {
    fn drop(&mut self) {
        self.close();
    }
}

impl DisplaySurface for SdlDisplay {
    fn enqueue(&self, buffer: DisplayBuffer) {
        self.send(Command::Frame(buffer));
    }

    fn set_rotation(&self, rotation: Rotation) {
        self.send(Command::Rotate(rotation));
    }

    fn flush(&self) {
        self.send(Command::Flush);
    }
}

fn display_loop(title: &str, rx: mpsc::Receiver<Command>) -> Result<()> {
    sdl2::hint::set("SDL_AUDIODRIVER", "dummy");

    let sdl_context = sdl2::init().map_err(|e| anyhow::anyhow!("SDL2 init failed: {}", e))?;
    let video_subsystem = sdl_context
        .video()
        .map_err(|e| anyhow::anyhow!("SDL2 video init failed: {}", e))?;

    let window = video_subsystem
        .window(title, 640, 480)
        .position_centered()
        .resizable()
        .build()
        .context("Failed to create SDL2 window")?;

    let mut canvas = window
        .into_canvas()
        .build()
        .context("Failed to create SDL2 canvas")?;

    let texture_creator = canvas.texture_creator();
    let mut texture: Option<sdl2::render::Texture> = None;
    let mut current = (0u32, 0u32);
    let mut angle = 0.0f64;

    let mut event_pump = sdl_context
        .event_pump()
        .map_err(|e| anyhow::anyhow!("SDL2 event pump failed: {}", e))?;

    tracing::info!("Video display window opened: {}", title);

    loop {
        for event in event_pump.poll_iter() {
            if let sdl2::event::Event::Quit { .. } = event {
                tracing::info!("Video display window closed");
                return Ok(());
            }
        }

        match rx.recv_timeout(Duration::from_millis(16)) {
            Ok(Command::Frame(buffer)) => {
                let image = &buffer.image;
                if (image.width, image.height) != current {
                    current = (image.width, image.height);
                    // ARGB8888 is B, G, R, A in memory on little-endian hosts.
                    texture = Some(
                        texture_creator
                            .create_texture_streaming(
                                PixelFormatEnum::ARGB8888,
                                image.width,
                                image.height,
                            )
                            .context("Failed to create BGRA texture")?,
                    );
                    tracing::info!("Display texture created: {}x{}", image.width, image.height);
                }
                if let Some(tex) = texture.as_mut() {
                    if let Err(e) = tex.update(None, &image.data, image.bytes_per_row) {
                        tracing::debug!("Texture update failed: {}", e);
                        continue;
                    }
                    canvas.clear();
                    let (win_w, win_h) = canvas.output_size().unwrap_or((640, 480));
                    let dst = Rect::new(0, 0, win_w, win_h);
                    let _ = canvas.copy_ex(tex, None, Some(dst), angle, None, false, false);
                    canvas.present();
                }
            }
            Ok(Command::Rotate(rotation)) => angle = f64::from(rotation.degrees()),
            Ok(Command::Flush) => {
                canvas.clear();
                canvas.present();
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                tracing::info!("Display channel closed, shutting down window");
                return Ok(());
            }
        }
    }
}
