//! In-process camera with a GenICam-style node map and a synthetic frame source

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::capture::device::{
    sfnc, DeviceHandle, FeatureKind, FeatureValue, NodeAccess, NodeInfo,
};
use crate::capture::frame::{Frame, FrameMetadata, FrameStatus, PixelFormat};
use crate::error::{CaptureError, Result};

/// Status code reported for injected incomplete frames
pub const SIM_INCOMPLETE_STATUS: u32 = 3;

/// Smallest ROI edge the node map accepts, and so the smallest sensor
const MIN_ROI: u32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedCameraConfig {
    pub serials: Vec<String>,
    pub sensor_width: u32,
    pub sensor_height: u32,
    /// Free-running rate used while `AcquisitionFrameRateEnable` is off
    pub frame_rate: f64,
    pub initial_format: PixelFormat,
    pub formats: Vec<PixelFormat>,
    pub supports_reverse_y: bool,
    pub x_padding: u32,
    /// Every n-th frame is delivered incomplete
    pub incomplete_every: Option<u64>,
    /// Pulls fail with a driver error once this many frames were delivered
    pub fail_after: Option<u64>,
    /// Never deliver a frame
    pub stall: bool,
    /// Number of discovery polls that report no cameras
    pub discovery_polls: u64,
    pub init_failure: bool,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            serials: vec!["SIM-0001".into()],
            sensor_width: 640,
            sensor_height: 480,
            frame_rate: 60.0,
            initial_format: PixelFormat::Mono8,
            formats: vec![
                PixelFormat::Mono8,
                PixelFormat::Rgb24,
                PixelFormat::Bgr24,
                PixelFormat::Yuyv4,
            ],
            supports_reverse_y: true,
            x_padding: 0,
            incomplete_every: None,
            fail_after: None,
            stall: false,
            discovery_polls: 0,
            init_failure: false,
        }
    }
}

#[derive(Default)]
struct SimCounters {
    feature_writes: AtomicU64,
    frames: AtomicU64,
    discovery_calls: AtomicU64,
    open: AtomicBool,
    acquiring: AtomicBool,
}

/// Read-only view on a camera's counters that stays valid after the camera
/// has been moved into a worker.
#[derive(Clone)]
pub struct SimMonitor {
    counters: Arc<SimCounters>,
}

impl SimMonitor {
    /// Number of successful feature writes since creation
    pub fn feature_writes(&self) -> u64 {
        self.counters.feature_writes.load(Ordering::Relaxed)
    }

    /// Frames delivered, complete or not
    pub fn frames(&self) -> u64 {
        self.counters.frames.load(Ordering::Relaxed)
    }

    pub fn discovery_calls(&self) -> u64 {
        self.counters.discovery_calls.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.counters.open.load(Ordering::Acquire)
    }

    pub fn is_acquiring(&self) -> bool {
        self.counters.acquiring.load(Ordering::Acquire)
    }
}

struct SimNode {
    kind: FeatureKind,
    value: FeatureValue,
    entries: Vec<String>,
}

impl SimNode {
    fn scalar(value: FeatureValue) -> Self {
        Self {
            kind: value.kind(),
            value,
            entries: Vec::new(),
        }
    }

    fn enumeration(current: &str, entries: &[&str]) -> Self {
        Self {
            kind: FeatureKind::Enumeration,
            value: FeatureValue::entry(current),
            entries: entries.iter().map(|e| e.to_string()).collect(),
        }
    }
}

pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    counters: Arc<SimCounters>,
    serial: Option<String>,
    nodes: BTreeMap<&'static str, SimNode>,
    acquiring: bool,
    acquisition_start: Option<Instant>,
    next_due: Option<Instant>,
    sequence: u64,
}

impl SimulatedCamera {
    pub fn new(config: SimulatedCameraConfig) -> Self {
        Self {
            config,
            counters: Arc::default(),
            serial: None,
            nodes: BTreeMap::new(),
            acquiring: false,
            acquisition_start: None,
            next_due: None,
            sequence: 0,
        }
    }

    pub fn monitor(&self) -> SimMonitor {
        SimMonitor {
            counters: self.counters.clone(),
        }
    }

    fn build_nodes(&self) -> BTreeMap<&'static str, SimNode> {
        let cfg = &self.config;
        let formats: Vec<&str> = cfg.formats.iter().map(|f| f.symbolic()).collect();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            sfnc::ACQUISITION_MODE,
            SimNode::enumeration("Continuous", &["Continuous", "SingleFrame", "MultiFrame"]),
        );
        nodes.insert(
            sfnc::PIXEL_FORMAT,
            SimNode::enumeration(cfg.initial_format.symbolic(), &formats),
        );
        nodes.insert(
            sfnc::WIDTH,
            SimNode::scalar(FeatureValue::Int(cfg.sensor_width as i64)),
        );
        nodes.insert(
            sfnc::HEIGHT,
            SimNode::scalar(FeatureValue::Int(cfg.sensor_height as i64)),
        );
        nodes.insert(sfnc::BINNING_HORIZONTAL, SimNode::scalar(FeatureValue::Int(1)));
        nodes.insert(sfnc::BINNING_VERTICAL, SimNode::scalar(FeatureValue::Int(1)));
        if cfg.supports_reverse_y {
            nodes.insert(sfnc::REVERSE_Y, SimNode::scalar(FeatureValue::Bool(false)));
        }
        nodes.insert(
            sfnc::ACQUISITION_FRAME_RATE_ENABLE,
            SimNode::scalar(FeatureValue::Bool(false)),
        );
        nodes.insert(
            sfnc::ACQUISITION_FRAME_RATE,
            SimNode::scalar(FeatureValue::Float(cfg.frame_rate)),
        );
        nodes.insert(
            sfnc::EXPOSURE_AUTO,
            SimNode::enumeration("Continuous", &["Off", "Once", "Continuous"]),
        );
        nodes.insert(
            sfnc::EXPOSURE_TIME,
            SimNode::scalar(FeatureValue::Float(10_000.0)),
        );
        nodes
    }

    fn int(&self, name: &str) -> i64 {
        match self.nodes.get(name).map(|n| &n.value) {
            Some(FeatureValue::Int(v)) => *v,
            _ => 0,
        }
    }

    fn flag(&self, name: &str) -> bool {
        matches!(self.nodes.get(name).map(|n| &n.value), Some(FeatureValue::Bool(true)))
    }

    fn entry(&self, name: &str) -> Option<&str> {
        match self.nodes.get(name).map(|n| &n.value) {
            Some(FeatureValue::Entry(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Access depends on device state, as on real firmware.
    fn access(&self, name: &str) -> NodeAccess {
        let locked = match name {
            sfnc::PIXEL_FORMAT
            | sfnc::WIDTH
            | sfnc::HEIGHT
            | sfnc::BINNING_HORIZONTAL
            | sfnc::BINNING_VERTICAL
            | sfnc::ACQUISITION_MODE => self.acquiring,
            sfnc::EXPOSURE_TIME => self.entry(sfnc::EXPOSURE_AUTO) != Some("Off"),
            sfnc::ACQUISITION_FRAME_RATE => !self.flag(sfnc::ACQUISITION_FRAME_RATE_ENABLE),
            _ => false,
        };
        if locked {
            NodeAccess::READ_ONLY
        } else {
            NodeAccess::READ_WRITE
        }
    }

    fn range(&self, name: &str) -> Option<(f64, f64)> {
        let binning = |node: &str| self.int(node).max(1) as f64;
        match name {
            sfnc::WIDTH => {
                let max = self.config.sensor_width as f64 / binning(sfnc::BINNING_HORIZONTAL);
                Some((MIN_ROI as f64, max.floor()))
            }
            sfnc::HEIGHT => {
                let max = self.config.sensor_height as f64 / binning(sfnc::BINNING_VERTICAL);
                Some((MIN_ROI as f64, max.floor()))
            }
            sfnc::BINNING_HORIZONTAL | sfnc::BINNING_VERTICAL => Some((1.0, 4.0)),
            sfnc::ACQUISITION_FRAME_RATE => Some((1.0, 500.0)),
            sfnc::EXPOSURE_TIME => Some((10.0, 1_000_000.0)),
            _ => None,
        }
    }

    /// Binning shrinks the maximum ROI; clamp the current one to it.
    fn clamp_roi(&mut self) {
        for node in [sfnc::WIDTH, sfnc::HEIGHT] {
            if let Some((_, max)) = self.range(node) {
                if let Some(n) = self.nodes.get_mut(node) {
                    if let FeatureValue::Int(v) = &mut n.value {
                        *v = (*v).min(max as i64);
                    }
                }
            }
        }
    }

    fn frame_period(&self) -> Duration {
        let rate = if self.flag(sfnc::ACQUISITION_FRAME_RATE_ENABLE) {
            match self.nodes.get(sfnc::ACQUISITION_FRAME_RATE).map(|n| &n.value) {
                Some(FeatureValue::Float(rate)) => *rate,
                _ => self.config.frame_rate,
            }
        } else {
            self.config.frame_rate
        };
        Duration::from_secs_f64(1.0 / rate.max(1.0))
    }

    fn render(&self, format: PixelFormat, width: u32, height: u32) -> (Bytes, u32) {
        let bpp = format.bytes_per_pixel().unwrap_or(1);
        let stride = (width + self.config.x_padding) * bpp;
        let flip = self.flag(sfnc::REVERSE_Y);
        let mut buf = vec![0u8; (stride * height) as usize];
        for (row, line) in buf.chunks_exact_mut(stride as usize).enumerate() {
            let y = if flip { height as usize - 1 - row } else { row };
            for (x, byte) in line[..(width * bpp) as usize].iter_mut().enumerate() {
                *byte = pattern_value(x, y, self.sequence);
            }
        }
        (Bytes::from(buf), stride)
    }
}

/// Byte at column `x` (in bytes) of source row `y` for frame `sequence`.
pub fn pattern_value(x: usize, y: usize, sequence: u64) -> u8 {
    (x + 3 * y + sequence as usize) as u8
}

impl DeviceHandle for SimulatedCamera {
    fn list_available_serials(&self) -> Result<Vec<String>> {
        let calls = self.counters.discovery_calls.fetch_add(1, Ordering::Relaxed);
        if calls < self.config.discovery_polls {
            return Ok(Vec::new());
        }
        Ok(self.config.serials.clone())
    }

    #[instrument(skip(self))]
    fn open(&mut self, serial: &str) -> Result<()> {
        if !self.config.serials.iter().any(|s| s == serial) {
            return Err(CaptureError::CameraNotFound {
                serial: serial.into(),
            });
        }
        if self.config.init_failure {
            return Err(CaptureError::DeviceInitFailure(format!(
                "{serial}: simulated init failure"
            )));
        }
        let (width, height) = (self.config.sensor_width, self.config.sensor_height);
        if width < MIN_ROI || height < MIN_ROI {
            return Err(CaptureError::DeviceInitFailure(format!(
                "{serial}: sensor {width}x{height} below the {MIN_ROI}x{MIN_ROI} minimum"
            )));
        }
        if self.serial.is_some() {
            self.close()?;
        }

        self.nodes = self.build_nodes();
        self.serial = Some(serial.into());
        self.sequence = 0;
        self.counters.open.store(true, Ordering::Release);
        info!("Opened simulated camera {serial}");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.end_acquisition()?;
        if let Some(serial) = self.serial.take() {
            self.nodes.clear();
            self.counters.open.store(false, Ordering::Release);
            info!("Closed simulated camera {serial}");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.serial.is_some()
    }

    fn begin_acquisition(&mut self) -> Result<()> {
        if self.serial.is_none() {
            return Err(CaptureError::NotOpen);
        }
        self.acquiring = true;
        self.acquisition_start = Some(Instant::now());
        self.next_due = None;
        self.counters.acquiring.store(true, Ordering::Release);
        debug!("Acquisition started");
        Ok(())
    }

    fn end_acquisition(&mut self) -> Result<()> {
        if self.acquiring {
            self.acquiring = false;
            self.acquisition_start = None;
            self.counters.acquiring.store(false, Ordering::Release);
            debug!("Acquisition ended");
        }
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame> {
        let start = Instant::now();
        if self.serial.is_none() {
            return Err(CaptureError::NotOpen);
        }
        if !self.acquiring {
            return Err(CaptureError::Driver("acquisition not started".into()));
        }
        if self.config.stall {
            thread::sleep(timeout);
            return Err(CaptureError::AcquisitionTimeout);
        }
        if let Some(limit) = self.config.fail_after {
            if self.sequence >= limit {
                return Err(CaptureError::Driver("device disconnected".into()));
            }
        }

        let period = self.frame_period();
        let due = self.next_due.unwrap_or(start + period);
        let wait = due.saturating_duration_since(start);
        if wait > timeout {
            thread::sleep(timeout);
            return Err(CaptureError::AcquisitionTimeout);
        }
        thread::sleep(wait);
        // A slow consumer does not earn a burst of back-to-back frames.
        self.next_due = Some(due.max(Instant::now()) + period);

        self.sequence += 1;
        let status = match self.config.incomplete_every {
            Some(n) if n > 0 && self.sequence % n == 0 => {
                FrameStatus::from_code(SIM_INCOMPLETE_STATUS)
            }
            _ => FrameStatus::Complete,
        };
        let format = self
            .entry(sfnc::PIXEL_FORMAT)
            .and_then(PixelFormat::from_symbolic)
            .unwrap_or(self.config.initial_format);
        let width = self.int(sfnc::WIDTH) as u32;
        let height = self.int(sfnc::HEIGHT) as u32;
        let (data, stride) = match status {
            FrameStatus::Complete => self.render(format, width, height),
            FrameStatus::Incomplete(_) => (Bytes::new(), 0),
        };
        self.counters.frames.fetch_add(1, Ordering::Relaxed);

        let meta = FrameMetadata {
            sequence: self.sequence,
            width,
            height,
            stride,
            x_padding: self.config.x_padding,
            y_padding: 0,
            format,
            status,
            pull_latency: start.elapsed(),
            // Device clock: time since acquisition began.
            device_timestamp: self.acquisition_start.map(|t0| t0.elapsed()),
        };
        Ok(Frame::new(meta, data))
    }

    fn describe_node(&self, name: &str) -> Option<NodeInfo> {
        let node = self.nodes.get(name)?;
        Some(NodeInfo {
            name: name.into(),
            kind: node.kind,
            access: self.access(name),
        })
    }

    fn describe_entry(&self, node: &str, entry: &str) -> Option<NodeAccess> {
        let node = self.nodes.get(node)?;
        node.entries
            .iter()
            .any(|e| e == entry)
            .then_some(NodeAccess::READ_ONLY)
    }

    fn get_feature(&self, name: &str, kind: FeatureKind) -> Result<FeatureValue> {
        if self.serial.is_none() {
            return Err(CaptureError::NotOpen);
        }
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| CaptureError::NodeUnavailable(name.into()))?;
        if node.kind != kind {
            return Err(CaptureError::KindMismatch {
                node: name.into(),
                requested: kind.name(),
                actual: node.kind.name(),
            });
        }
        Ok(node.value.clone())
    }

    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<()> {
        if self.serial.is_none() {
            return Err(CaptureError::NotOpen);
        }
        let access = self.access(name);
        let range = self.range(name);
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| CaptureError::NodeUnavailable(name.into()))?;
        if node.kind != value.kind() {
            return Err(CaptureError::KindMismatch {
                node: name.into(),
                requested: value.kind().name(),
                actual: node.kind.name(),
            });
        }
        if !access.writable {
            return Err(CaptureError::NodeNotWritable(name.into()));
        }
        let numeric = match value {
            FeatureValue::Int(v) => Some(*v as f64),
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        };
        if let (Some(v), Some((min, max))) = (numeric, range) {
            if v < min || v > max {
                return Err(CaptureError::Driver(format!(
                    "{name}: {v} outside [{min}, {max}]"
                )));
            }
        }
        if let FeatureValue::Entry(entry) = value {
            if !node.entries.iter().any(|e| e == entry) {
                return Err(CaptureError::EntryUnavailable {
                    node: name.into(),
                    entry: entry.clone(),
                });
            }
        }

        node.value = value.clone();
        self.counters.feature_writes.fetch_add(1, Ordering::Relaxed);
        if matches!(name, sfnc::BINNING_HORIZONTAL | sfnc::BINNING_VERTICAL) {
            self.clamp_roi();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(config: SimulatedCameraConfig) -> SimulatedCamera {
        let mut camera = SimulatedCamera::new(config);
        camera.open("SIM-0001").unwrap();
        camera.begin_acquisition().unwrap();
        camera
    }

    #[test]
    fn open_rejects_unknown_serial_and_init_failures() {
        let mut camera = SimulatedCamera::new(SimulatedCameraConfig::default());
        assert_eq!(
            camera.open("SIM-9999"),
            Err(CaptureError::CameraNotFound {
                serial: "SIM-9999".into()
            })
        );

        let mut broken = SimulatedCamera::new(SimulatedCameraConfig {
            init_failure: true,
            ..Default::default()
        });
        assert!(matches!(
            broken.open("SIM-0001"),
            Err(CaptureError::DeviceInitFailure(_))
        ));
        // Closing a camera that never opened is fine.
        assert_eq!(broken.close(), Ok(()));
    }

    #[test]
    fn open_rejects_sensor_below_minimum_roi() {
        for (sensor_width, sensor_height) in [(0, 480), (640, 8)] {
            let mut camera = SimulatedCamera::new(SimulatedCameraConfig {
                sensor_width,
                sensor_height,
                ..Default::default()
            });
            assert!(matches!(
                camera.open("SIM-0001"),
                Err(CaptureError::DeviceInitFailure(_))
            ));
            assert!(!camera.is_open());
        }
    }

    #[test]
    fn device_timestamps_count_from_acquisition_start() {
        let mut camera = started(SimulatedCameraConfig {
            frame_rate: 100.0,
            ..Default::default()
        });
        let first = camera.pull_frame(Duration::from_millis(100)).unwrap();
        let second = camera.pull_frame(Duration::from_millis(100)).unwrap();
        let t1 = first.meta().device_timestamp.unwrap();
        let t2 = second.meta().device_timestamp.unwrap();

        // First frame is due one period after the start, not after the pull began.
        assert!(t1 >= Duration::from_millis(9), "t1 {t1:?}");
        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(9));
    }

    #[test]
    fn discovery_settles_after_configured_polls() {
        let camera = SimulatedCamera::new(SimulatedCameraConfig {
            discovery_polls: 2,
            ..Default::default()
        });
        assert!(camera.list_available_serials().unwrap().is_empty());
        assert!(camera.list_available_serials().unwrap().is_empty());
        assert_eq!(camera.list_available_serials().unwrap(), vec!["SIM-0001"]);
    }

    #[test]
    fn frames_follow_configured_geometry_and_flip() {
        let mut camera = SimulatedCamera::new(SimulatedCameraConfig {
            frame_rate: 500.0,
            x_padding: 4,
            ..Default::default()
        });
        camera.open("SIM-0001").unwrap();
        camera.set_feature(sfnc::WIDTH, &FeatureValue::Int(32)).unwrap();
        camera.set_feature(sfnc::HEIGHT, &FeatureValue::Int(16)).unwrap();
        camera
            .set_feature(sfnc::PIXEL_FORMAT, &FeatureValue::entry("BGR8"))
            .unwrap();
        camera.set_feature(sfnc::REVERSE_Y, &FeatureValue::Bool(true)).unwrap();
        camera.begin_acquisition().unwrap();

        let frame = camera.pull_frame(Duration::from_millis(100)).unwrap();
        assert!(frame.is_usable());
        assert_eq!((frame.width(), frame.height()), (32, 16));
        assert_eq!(frame.meta().stride, (32 + 4) * 3);
        assert_eq!(frame.format(), PixelFormat::Bgr24);
        let first = frame.row(0).unwrap();
        assert_eq!(first.len(), 32 * 3);
        assert_eq!(first[0], pattern_value(0, 15, frame.sequence()));
    }

    #[test]
    fn roi_is_locked_during_acquisition() {
        let mut camera = started(SimulatedCameraConfig::default());
        assert_eq!(
            camera.set_feature(sfnc::WIDTH, &FeatureValue::Int(64)),
            Err(CaptureError::NodeNotWritable(sfnc::WIDTH.into()))
        );
        camera.end_acquisition().unwrap();
        assert_eq!(camera.set_feature(sfnc::WIDTH, &FeatureValue::Int(64)), Ok(()));
    }

    #[test]
    fn binning_clamps_roi() {
        let mut camera = SimulatedCamera::new(SimulatedCameraConfig::default());
        camera.open("SIM-0001").unwrap();
        camera
            .set_feature(sfnc::BINNING_HORIZONTAL, &FeatureValue::Int(2))
            .unwrap();
        assert_eq!(
            camera.get_feature(sfnc::WIDTH, FeatureKind::Integer),
            Ok(FeatureValue::Int(320))
        );
        assert!(matches!(
            camera.set_feature(sfnc::WIDTH, &FeatureValue::Int(640)),
            Err(CaptureError::Driver(_))
        ));
    }

    #[test]
    fn injected_incomplete_frames_carry_status() {
        let mut camera = started(SimulatedCameraConfig {
            frame_rate: 500.0,
            incomplete_every: Some(2),
            ..Default::default()
        });
        let timeout = Duration::from_millis(100);
        assert!(camera.pull_frame(timeout).unwrap().is_complete());
        let second = camera.pull_frame(timeout).unwrap();
        assert_eq!(second.status(), FrameStatus::Incomplete(SIM_INCOMPLETE_STATUS));
        assert!(second.data().is_empty());
    }

    #[test]
    fn stalled_camera_times_out() {
        let mut camera = started(SimulatedCameraConfig {
            stall: true,
            ..Default::default()
        });
        let start = Instant::now();
        assert!(matches!(
            camera.pull_frame(Duration::from_millis(20)),
            Err(CaptureError::AcquisitionTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
