use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// A single frame pulled from a device.
///
/// The frame owns its pixel buffer from construction until it is dropped and
/// exposes no way to mutate it. Cloning is cheap: the buffer is reference
/// counted, not copied.
#[derive(Clone)]
pub struct Frame {
    data: Bytes,
    meta: FrameMetadata,
    timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes, padding included
    pub stride: u32,
    pub x_padding: u32,
    pub y_padding: u32,
    pub format: PixelFormat,
    pub status: FrameStatus,
    /// Time spent blocked in the pull that produced this frame
    pub pull_latency: Duration,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Completeness reported by the driver for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Complete,
    Incomplete(u32),
}

impl FrameStatus {
    /// Drivers report zero for a complete image and a status code otherwise.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => FrameStatus::Complete,
            code => FrameStatus::Incomplete(code),
        }
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Mono8,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Yuyv4,
        PixelFormat::Mjpeg,
    ];

    /// Symbolic entry name of the `PixelFormat` enumeration node
    pub fn symbolic(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Rgb24 => "RGB8",
            PixelFormat::Bgr24 => "BGR8",
            PixelFormat::Yuyv4 => "YUV422_8",
            PixelFormat::Mjpeg => "JPEG",
        }
    }

    pub fn from_symbolic(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.symbolic() == name)
    }

    /// V4L2 four character code
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mono8 => *b"GREY",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Yuyv4 => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|f| &f.fourcc() == code)
    }

    /// Bytes per pixel, `None` for compressed formats
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Mono8 => Some(1),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Mjpeg => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbolic())
    }
}

impl Frame {
    pub fn new(meta: FrameMetadata, data: Bytes) -> Self {
        Self::with_timestamp(meta, data, Instant::now())
    }

    /// Incomplete frames never keep their pixel data.
    pub fn with_timestamp(meta: FrameMetadata, data: Bytes, timestamp: Instant) -> Self {
        let data = match meta.status {
            FrameStatus::Complete => data,
            FrameStatus::Incomplete(_) => Bytes::new(),
        };
        Self {
            data,
            meta,
            timestamp,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    /// Capture timestamp for latency tracking
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn status(&self) -> FrameStatus {
        self.meta.status
    }

    pub fn is_complete(&self) -> bool {
        self.meta.status == FrameStatus::Complete
    }

    /// Complete, with non-empty dimensions and data.
    pub fn is_usable(&self) -> bool {
        self.is_complete() && self.meta.width > 0 && self.meta.height > 0 && !self.data.is_empty()
    }

    /// Width of the buffer including horizontal padding
    pub fn padded_width(&self) -> u32 {
        self.meta.width + self.meta.x_padding
    }

    /// Height of the buffer including vertical padding
    pub fn padded_height(&self) -> u32 {
        self.meta.height + self.meta.y_padding
    }

    /// Visible pixels of row `y`, padding excluded.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let bpp = self.meta.format.bytes_per_pixel()?;
        if y >= self.meta.height {
            return None;
        }
        let start = y as usize * self.meta.stride as usize;
        let end = start + (self.meta.width * bpp) as usize;
        self.data.get(start..end)
    }

    pub fn into_parts(self) -> (FrameMetadata, Bytes, Instant) {
        (self.meta, self.data, self.timestamp)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}
