//! V4L2 camera backend
//!
//! V4L2 has no node map, so the standard feature names are mapped onto the
//! format and streaming parameters plus the matching user controls; any other
//! name is looked up among the device controls by their V4L2 name.

use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Flags as ControlFlags, MenuItem, Type as ControlType, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{sfnc, DeviceHandle, FeatureKind, FeatureValue, NodeAccess, NodeInfo};
use crate::capture::frame::{Frame, FrameMetadata, FrameStatus, PixelFormat};
use crate::error::{CaptureError, Result};

const CID_VFLIP: u32 = 0x0098_0915;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

fn driver(err: io::Error) -> CaptureError {
    CaptureError::Driver(err.to_string())
}

/// Where a feature name lives on a V4L2 device
enum Binding {
    PixelFormat,
    Width,
    Height,
    FrameRate,
    AcquisitionMode,
    ExposureAuto(Description),
    ExposureTime(Description),
    Control(Description),
}

struct StreamGeometry {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
}

pub struct V4l2Camera {
    buffer_count: u32,
    path: Option<String>,
    device: Option<Device>,
    controls: Vec<Description>,
    stream: Option<MmapStream<'static>>,
    geometry: Option<StreamGeometry>,
    sequence: u64,
}

impl V4l2Camera {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            buffer_count: buffer_count.max(2),
            path: None,
            device: None,
            controls: Vec::new(),
            stream: None,
            geometry: None,
            sequence: 0,
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(CaptureError::NotOpen)
    }

    fn control_by_id(&self, id: u32) -> Option<&Description> {
        self.controls.iter().find(|c| c.id == id)
    }

    fn bind(&self, name: &str) -> Option<Binding> {
        let by_id = |id| self.control_by_id(id).cloned();
        match name {
            sfnc::PIXEL_FORMAT => Some(Binding::PixelFormat),
            sfnc::WIDTH => Some(Binding::Width),
            sfnc::HEIGHT => Some(Binding::Height),
            sfnc::ACQUISITION_FRAME_RATE => Some(Binding::FrameRate),
            sfnc::ACQUISITION_MODE => Some(Binding::AcquisitionMode),
            sfnc::REVERSE_Y => by_id(CID_VFLIP).map(Binding::Control),
            sfnc::EXPOSURE_AUTO => by_id(CID_EXPOSURE_AUTO).map(Binding::ExposureAuto),
            sfnc::EXPOSURE_TIME => by_id(CID_EXPOSURE_ABSOLUTE).map(Binding::ExposureTime),
            other => self
                .controls
                .iter()
                .find(|c| c.name == other)
                .cloned()
                .map(Binding::Control),
        }
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        let Ok(device) = self.device() else {
            return Vec::new();
        };
        device
            .enum_formats()
            .unwrap_or_default()
            .iter()
            .filter_map(|desc| PixelFormat::from_fourcc(&desc.fourcc.repr))
            .collect()
    }

    fn control_value(&self, id: u32) -> Result<i64> {
        match self.device()?.control(id).map_err(driver)?.value {
            Value::Integer(v) => Ok(v),
            Value::Boolean(v) => Ok(v as i64),
            _ => Err(CaptureError::Driver(format!("control {id:#x} has no scalar value"))),
        }
    }

    fn set_control_value(&self, desc: &Description, value: Value) -> Result<()> {
        self.device()?
            .set_control(Control { id: desc.id, value })
            .map_err(driver)
    }
}

fn control_kind(desc: &Description) -> Option<FeatureKind> {
    match desc.typ {
        ControlType::Boolean => Some(FeatureKind::Boolean),
        ControlType::Integer | ControlType::Integer64 => Some(FeatureKind::Integer),
        ControlType::Menu => Some(FeatureKind::Enumeration),
        _ => None,
    }
}

fn control_access(desc: &Description) -> NodeAccess {
    let flags = desc.flags;
    NodeAccess {
        available: !flags.contains(ControlFlags::DISABLED),
        readable: !flags.contains(ControlFlags::WRITE_ONLY),
        writable: !flags.intersects(
            ControlFlags::READ_ONLY | ControlFlags::INACTIVE | ControlFlags::GRABBED,
        ),
    }
}

fn menu_entries(desc: &Description) -> Vec<(u32, String)> {
    desc.items
        .iter()
        .flatten()
        .filter_map(|(index, item)| match item {
            MenuItem::Name(name) => Some((*index, name.clone())),
            MenuItem::Value(_) => None,
        })
        .collect()
}

impl DeviceHandle for V4l2Camera {
    fn list_available_serials(&self) -> Result<Vec<String>> {
        let mut serials = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_string_lossy().into_owned();
            let capture = Device::with_path(&path)
                .and_then(|dev| dev.query_caps())
                .map(|caps| caps.capabilities.contains(CapFlags::VIDEO_CAPTURE))
                .unwrap_or(false);
            if capture {
                serials.push(path);
            }
        }
        serials.sort();
        Ok(serials)
    }

    #[instrument(skip(self))]
    fn open(&mut self, serial: &str) -> Result<()> {
        if !self.list_available_serials()?.iter().any(|s| s == serial) {
            return Err(CaptureError::CameraNotFound {
                serial: serial.into(),
            });
        }
        self.close()?;

        let device = Device::with_path(serial)
            .map_err(|e| CaptureError::DeviceInitFailure(format!("{serial}: {e}")))?;
        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::DeviceInitFailure(format!("{serial}: {e}")))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        self.controls = device.query_controls().unwrap_or_else(|e| {
            warn!("{serial}: could not enumerate controls: {e}");
            Vec::new()
        });
        self.device = Some(device);
        self.path = Some(serial.into());
        self.sequence = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.end_acquisition()?;
        self.device = None;
        self.controls.clear();
        if let Some(path) = self.path.take() {
            info!("Closed {path}");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        let device = self.device()?;
        let fmt = device.format().map_err(driver)?;
        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr).ok_or_else(|| {
            CaptureError::Driver(format!("unsupported fourcc {}", fmt.fourcc))
        })?;
        let stream = MmapStream::with_buffers(device, Type::VideoCapture, self.buffer_count)
            .map_err(driver)?;
        self.geometry = Some(StreamGeometry {
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
        });
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", self.buffer_count);
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        // Dropping the stream turns streaming off and unmaps the buffers.
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
        self.geometry = None;
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.stream.is_some()
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame> {
        let start = Instant::now();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CaptureError::Driver("acquisition not started".into()))?;
        stream.set_timeout(timeout);

        let (data, timestamp, failed) = match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                (
                    Bytes::copy_from_slice(&buf[..used]),
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                    meta.flags.contains(BufferFlags::ERROR),
                )
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CaptureError::AcquisitionTimeout)
            }
            Err(e) => return Err(driver(e)),
        };

        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| CaptureError::Driver("acquisition not started".into()))?;
        self.sequence += 1;
        let meta = FrameMetadata {
            sequence: self.sequence,
            width: geometry.width,
            height: geometry.height,
            stride: geometry.stride,
            x_padding: 0,
            y_padding: 0,
            format: geometry.format,
            status: if failed {
                FrameStatus::Incomplete(1)
            } else {
                FrameStatus::Complete
            },
            pull_latency: start.elapsed(),
            device_timestamp: Some(timestamp),
        };
        Ok(Frame::new(meta, data))
    }

    fn describe_node(&self, name: &str) -> Option<NodeInfo> {
        self.device.as_ref()?;
        let streaming = self.stream.is_some();
        let (kind, access) = match self.bind(name)? {
            Binding::PixelFormat => (FeatureKind::Enumeration, format_access(streaming)),
            Binding::Width | Binding::Height => (FeatureKind::Integer, format_access(streaming)),
            Binding::FrameRate => (FeatureKind::Float, NodeAccess::READ_WRITE),
            Binding::AcquisitionMode => (FeatureKind::Enumeration, NodeAccess::READ_WRITE),
            Binding::ExposureAuto(desc) => (FeatureKind::Enumeration, control_access(&desc)),
            Binding::ExposureTime(desc) => (FeatureKind::Float, control_access(&desc)),
            Binding::Control(desc) => (control_kind(&desc)?, control_access(&desc)),
        };
        Some(NodeInfo {
            name: name.into(),
            kind,
            access,
        })
    }

    fn describe_entry(&self, node: &str, entry: &str) -> Option<NodeAccess> {
        let exists = match self.bind(node)? {
            Binding::PixelFormat => self
                .supported_formats()
                .iter()
                .any(|f| f.symbolic() == entry),
            Binding::AcquisitionMode => entry == "Continuous",
            Binding::ExposureAuto(_) => matches!(entry, "Off" | "Continuous"),
            Binding::Control(desc) => menu_entries(&desc).iter().any(|(_, name)| name == entry),
            _ => false,
        };
        exists.then_some(NodeAccess::READ_ONLY)
    }

    fn get_feature(&self, name: &str, kind: FeatureKind) -> Result<FeatureValue> {
        let device = self.device()?;
        let binding = self
            .bind(name)
            .ok_or_else(|| CaptureError::NodeUnavailable(name.into()))?;
        let value = match binding {
            Binding::PixelFormat => {
                let fmt = device.format().map_err(driver)?;
                let format = PixelFormat::from_fourcc(&fmt.fourcc.repr).ok_or_else(|| {
                    CaptureError::Driver(format!("unsupported fourcc {}", fmt.fourcc))
                })?;
                FeatureValue::entry(format.symbolic())
            }
            Binding::Width => FeatureValue::Int(device.format().map_err(driver)?.width as i64),
            Binding::Height => FeatureValue::Int(device.format().map_err(driver)?.height as i64),
            Binding::FrameRate => {
                let interval = device.params().map_err(driver)?.interval;
                FeatureValue::Float(interval.denominator as f64 / interval.numerator.max(1) as f64)
            }
            Binding::AcquisitionMode => FeatureValue::entry("Continuous"),
            Binding::ExposureAuto(desc) => {
                let mode = self.control_value(desc.id)?;
                FeatureValue::entry(if mode == EXPOSURE_MANUAL { "Off" } else { "Continuous" })
            }
            Binding::ExposureTime(desc) => {
                // V4L2 absolute exposure is in 100 µs units.
                FeatureValue::Float(self.control_value(desc.id)? as f64 * 100.0)
            }
            Binding::Control(desc) => match control_kind(&desc) {
                Some(FeatureKind::Boolean) => FeatureValue::Bool(self.control_value(desc.id)? != 0),
                Some(FeatureKind::Enumeration) => {
                    let index = self.control_value(desc.id)?;
                    let entry = menu_entries(&desc)
                        .into_iter()
                        .find(|(i, _)| *i as i64 == index)
                        .map(|(_, name)| name)
                        .ok_or_else(|| CaptureError::NodeNotReadable(name.into()))?;
                    FeatureValue::Entry(entry)
                }
                _ => FeatureValue::Int(self.control_value(desc.id)?),
            },
        };
        if value.kind() != kind {
            return Err(CaptureError::KindMismatch {
                node: name.into(),
                requested: kind.name(),
                actual: value.kind().name(),
            });
        }
        Ok(value)
    }

    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<()> {
        let binding = self
            .bind(name)
            .ok_or_else(|| CaptureError::NodeUnavailable(name.into()))?;
        let device = self.device()?;
        let mismatch = || CaptureError::KindMismatch {
            node: name.into(),
            requested: value.kind().name(),
            actual: "other",
        };

        match (binding, value) {
            (Binding::PixelFormat, FeatureValue::Entry(entry)) => {
                let format = PixelFormat::from_symbolic(entry).ok_or_else(|| {
                    CaptureError::EntryUnavailable {
                        node: name.into(),
                        entry: entry.clone(),
                    }
                })?;
                let mut fmt = device.format().map_err(driver)?;
                fmt.fourcc = FourCC::new(&format.fourcc());
                device.set_format(&fmt).map_err(driver)?;
            }
            (Binding::Width, FeatureValue::Int(v)) | (Binding::Height, FeatureValue::Int(v)) => {
                let mut fmt = device.format().map_err(driver)?;
                if name == sfnc::WIDTH {
                    fmt.width = *v as u32;
                } else {
                    fmt.height = *v as u32;
                }
                device.set_format(&fmt).map_err(driver)?;
            }
            (Binding::FrameRate, FeatureValue::Float(fps)) => {
                device
                    .set_params(&Parameters::with_fps(fps.round().max(1.0) as u32))
                    .map_err(driver)?;
            }
            (Binding::AcquisitionMode, FeatureValue::Entry(_)) => {}
            (Binding::ExposureAuto(desc), FeatureValue::Entry(entry)) => {
                let mode = if entry == "Off" {
                    EXPOSURE_MANUAL
                } else {
                    EXPOSURE_APERTURE_PRIORITY
                };
                self.set_control_value(&desc, Value::Integer(mode))?;
            }
            (Binding::ExposureTime(desc), FeatureValue::Float(us)) => {
                self.set_control_value(&desc, Value::Integer((us / 100.0).round() as i64))?;
            }
            (Binding::Control(desc), FeatureValue::Bool(v)) => {
                self.set_control_value(&desc, Value::Boolean(*v))?;
            }
            (Binding::Control(desc), FeatureValue::Int(v)) => {
                self.set_control_value(&desc, Value::Integer(*v))?;
            }
            (Binding::Control(desc), FeatureValue::Entry(entry)) => {
                let index = menu_entries(&desc)
                    .into_iter()
                    .find(|(_, n)| n == entry)
                    .map(|(i, _)| i)
                    .ok_or_else(|| CaptureError::EntryUnavailable {
                        node: name.into(),
                        entry: entry.clone(),
                    })?;
                self.set_control_value(&desc, Value::Integer(index as i64))?;
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

fn format_access(streaming: bool) -> NodeAccess {
    if streaming {
        NodeAccess::READ_ONLY
    } else {
        NodeAccess::READ_WRITE
    }
}
