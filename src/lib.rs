pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use capture::device::sfnc;
use capture::frame::PixelFormat;
use capture::nodes::FeatureRequest;
use capture::sim::SimulatedCameraConfig;
use pipeline::retry::ConnectionRetry;
use pipeline::worker::WorkerOptions;
use serde::{Deserialize, Serialize};

pub use error::{CaptureError, Result};
pub use session::{list_cameras, start_capture, CaptureSession};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Default configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "mvcap.toml";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub camera: DeviceSettings,
    pub pipeline: PipelineConfig,
    pub simulator: SimulatedCameraConfig,
    /// Applied after the requests derived from `camera`
    pub features: Vec<FeatureRequest>,
}

impl Config {
    /// Layers `path` (or `mvcap.toml` when absent) and `MVCAP__*` environment
    /// variables over the defaults. A missing default file is not an error; a
    /// missing explicit one is.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(CONFIG_FILE).required(false),
        };
        Self::layered(file, true)
    }

    fn layered<S>(source: S, env: bool) -> std::result::Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(source);
        if env {
            builder = builder.add_source(
                config::Environment::with_prefix("MVCAP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }
        builder.build()?.try_deserialize()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Simulated,
    V4l2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    #[default]
    Auto,
    Manual,
}

/// Camera settings, applied once between open and the start of acquisition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// First reported camera when unset
    pub serial: Option<String>,
    pub format: PixelFormat,
    /// Sensor default when unset
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub binning_horizontal: u32,
    pub binning_vertical: u32,
    pub reverse_y: bool,
    /// Free-running when unset
    pub frame_rate: Option<f64>,
    pub exposure: ExposureMode,
    pub exposure_time_us: f64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            serial: None,
            format: PixelFormat::Bgr24,
            width: None,
            height: None,
            binning_horizontal: 1,
            binning_vertical: 1,
            reverse_y: true,
            frame_rate: None,
            exposure: ExposureMode::Auto,
            exposure_time_us: 10_000.0,
        }
    }
}

impl DeviceSettings {
    /// Standard feature requests for these settings, in application order.
    ///
    /// Binning comes before the ROI since it shrinks the valid range of
    /// `Width`/`Height`, and the frame-rate enable flag before the rate.
    pub fn feature_requests(&self) -> Vec<FeatureRequest> {
        let mut requests = vec![
            FeatureRequest::enumeration(sfnc::ACQUISITION_MODE, "Continuous"),
            FeatureRequest::enumeration(sfnc::PIXEL_FORMAT, self.format.symbolic()),
            FeatureRequest::integer(sfnc::BINNING_HORIZONTAL, self.binning_horizontal as i64),
            FeatureRequest::integer(sfnc::BINNING_VERTICAL, self.binning_vertical as i64),
        ];
        if let Some(width) = self.width {
            requests.push(FeatureRequest::integer(sfnc::WIDTH, width as i64));
        }
        if let Some(height) = self.height {
            requests.push(FeatureRequest::integer(sfnc::HEIGHT, height as i64));
        }
        requests.push(FeatureRequest::boolean(sfnc::REVERSE_Y, self.reverse_y));
        if let Some(rate) = self.frame_rate {
            requests.push(FeatureRequest::boolean(sfnc::ACQUISITION_FRAME_RATE_ENABLE, true));
            requests.push(FeatureRequest::float(sfnc::ACQUISITION_FRAME_RATE, rate));
        }
        match self.exposure {
            ExposureMode::Auto => {
                requests.push(FeatureRequest::enumeration(sfnc::EXPOSURE_AUTO, "Continuous"));
            }
            ExposureMode::Manual => {
                requests.push(FeatureRequest::enumeration(sfnc::EXPOSURE_AUTO, "Off"));
                requests.push(FeatureRequest::float(sfnc::EXPOSURE_TIME, self.exposure_time_us));
            }
        }
        requests
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub worker: WorkerOptions,
    /// Waiting for the camera list to settle
    pub discovery: ConnectionRetry,
    /// Waiting for the first usable frame after start
    pub warmup: ConnectionRetry,
    /// Rate at which the binary polls the frame slot
    pub display_fps: u32,
    /// Mmap buffers requested by the V4L2 backend
    pub buffer_count: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            discovery: ConnectionRetry::new(20, std::time::Duration::from_millis(100)),
            warmup: ConnectionRetry::default(),
            display_fps: 60,
            buffer_count: 4,
        }
    }
}
