//! Frame sources.
//!
//! The pipeline only needs a capability that fills a frame slot on demand;
//! everything V4L2-specific stays behind the `Camera` trait so schedules can
//! run against real hardware or a deterministic synthetic source.

use color_eyre::eyre::{eyre, Result};
use tracing::info;
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::pipeline::Frame;

/// A source of pixel data. `read_into` fills the slot's RGB buffer and
/// reports whether a fresh frame was delivered.
pub trait Camera: Send {
    fn dimensions(&self) -> (u32, u32);
    fn read_into(&mut self, frame: &mut Frame) -> Result<bool>;
}

/// Scan `/dev/video0..9` for the first device with capture capability.
pub fn detect_device() -> Result<String> {
    for index in 0..10 {
        let path = format!("/dev/video{index}");
        if !std::path::Path::new(&path).exists() {
            continue;
        }
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            info!("Found capture device: {} - {}", path, caps.card);
            return Ok(path);
        }
    }
    Err(eyre!("no V4L2 capture device found"))
}

/// Memory-mapped V4L2 capture device delivering raw RGB frames.
pub struct V4lCamera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    buffer_count: u32,
}

impl V4lCamera {
    pub fn open(path: &str, width: u32, height: u32) -> Result<Self> {
        info!("Initializing V4L2 capture: {path}");

        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("{path} does not support video capture"));
        }

        let mut format = device.format()?;
        format.width = width;
        format.height = height;
        format.fourcc = FourCC::new(b"RGB3");
        let applied = device.set_format(&format)?;
        if applied.fourcc != FourCC::new(b"RGB3") {
            return Err(eyre!(
                "{path} cannot deliver RGB3 frames (offered {})",
                applied.fourcc
            ));
        }

        Ok(Self {
            device,
            stream: None,
            width: applied.width,
            height: applied.height,
            buffer_count: 4,
        })
    }
}

impl Camera for V4lCamera {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_into(&mut self, frame: &mut Frame) -> Result<bool> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
            info!("Capture stream started with {} buffers", self.buffer_count);
            self.stream = Some(stream);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| eyre!("stream not started"))?;

        let (buffer, _meta) = stream.next()?;
        if buffer.is_empty() {
            return Ok(false);
        }
        let length = buffer.len().min(frame.pixels.len());
        frame.pixels[..length].copy_from_slice(&buffer[..length]);
        Ok(true)
    }
}

/// Deterministic generated frames for tests and camera-less runs.
///
/// Each read fills the frame with the next luminance level from the script;
/// the script wraps, so a short script describes a periodic scene.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    levels: Vec<u8>,
    cursor: usize,
}

impl SyntheticCamera {
    pub fn scripted(width: u32, height: u32, levels: Vec<u8>) -> Self {
        assert!(!levels.is_empty(), "luminance script must not be empty");
        Self {
            width,
            height,
            levels,
            cursor: 0,
        }
    }

    pub fn uniform(width: u32, height: u32, level: u8) -> Self {
        Self::scripted(width, height, vec![level])
    }

    /// A slow drift punctuated by periodic jumps, shaped like a filmed
    /// clock face: long stable stretches with a motion spike at each tick.
    pub fn clock_face(width: u32, height: u32) -> Self {
        let mut levels = Vec::with_capacity(32);
        for step in 0..32u32 {
            if step % 8 == 0 {
                levels.push(200);
            } else {
                levels.push(40 + (step % 8) as u8);
            }
        }
        Self::scripted(width, height, levels)
    }
}

impl Camera for SyntheticCamera {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_into(&mut self, frame: &mut Frame) -> Result<bool> {
        let level = self.levels[self.cursor % self.levels.len()];
        self.cursor += 1;
        frame.pixels.fill(level);
        Ok(true)
    }
}
