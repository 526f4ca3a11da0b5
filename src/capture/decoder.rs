//! Pixel-format normalization applied by the worker before publish
//!
//! Color conversion itself is delegated: compressed MJPEG frames go through
//! `jpeg-decoder`, everything the driver already delivers uncompressed is
//! passed through untouched.

use bytes::Bytes;
use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelFormat};
use crate::error::{CaptureError, Result};

/// Conversion step between `pull_frame` and publish
pub trait FrameConverter: Send {
    fn convert(&mut self, frame: Frame) -> Result<Frame>;
}

impl<F> FrameConverter for F
where
    F: FnMut(Frame) -> Result<Frame> + Send,
{
    fn convert(&mut self, frame: Frame) -> Result<Frame> {
        self(frame)
    }
}

/// Decodes MJPEG frames to RGB24 (or Mono8 for grayscale JPEGs).
pub fn normalize(frame: Frame) -> Result<Frame> {
    if frame.format() != PixelFormat::Mjpeg || !frame.is_complete() {
        return Ok(frame);
    }

    let (mut meta, data, timestamp) = frame.into_parts();
    let mut decoder = Decoder::new(&data[..]);
    let pixels = decoder
        .decode()
        .map_err(|e| CaptureError::Conversion(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| CaptureError::Conversion("missing JPEG header".into()))?;

    let format = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
        jpeg_decoder::PixelFormat::L8 => PixelFormat::Mono8,
        other => {
            return Err(CaptureError::Conversion(format!(
                "unsupported JPEG pixel format {other:?}"
            )))
        }
    };

    meta.width = info.width as u32;
    meta.height = info.height as u32;
    meta.stride = meta.width * format.bytes_per_pixel().unwrap_or(1);
    meta.x_padding = 0;
    meta.y_padding = 0;
    meta.format = format;
    Ok(Frame::with_timestamp(meta, Bytes::from(pixels), timestamp))
}
