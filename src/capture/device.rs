//! Capability interface every camera backend implements

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::frame::Frame;
use crate::error::Result;

/// Standard feature names (GenICam SFNC) used by the configurator.
pub mod sfnc {
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    pub const ACQUISITION_FRAME_RATE: &str = "AcquisitionFrameRate";
    pub const ACQUISITION_FRAME_RATE_ENABLE: &str = "AcquisitionFrameRateEnable";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const BINNING_HORIZONTAL: &str = "BinningHorizontal";
    pub const BINNING_VERTICAL: &str = "BinningVertical";
    pub const REVERSE_Y: &str = "ReverseY";
    pub const EXPOSURE_AUTO: &str = "ExposureAuto";
    pub const EXPOSURE_TIME: &str = "ExposureTime";
}

/// Type of a feature node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Enumeration,
    Boolean,
    Integer,
    Float,
}

impl FeatureKind {
    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::Enumeration => "enumeration",
            FeatureKind::Boolean => "boolean",
            FeatureKind::Integer => "integer",
            FeatureKind::Float => "float",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value read from or written to a feature node. Enumerations are addressed
/// by the symbolic name of their entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Entry(String),
}

impl FeatureValue {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureValue::Bool(_) => FeatureKind::Boolean,
            FeatureValue::Int(_) => FeatureKind::Integer,
            FeatureValue::Float(_) => FeatureKind::Float,
            FeatureValue::Entry(_) => FeatureKind::Enumeration,
        }
    }

    pub fn entry(name: impl Into<String>) -> Self {
        FeatureValue::Entry(name.into())
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Bool(v) => write!(f, "{v}"),
            FeatureValue::Int(v) => write!(f, "{v}"),
            FeatureValue::Float(v) => write!(f, "{v}"),
            FeatureValue::Entry(v) => f.write_str(v),
        }
    }
}

/// Access flags of a node or enumeration entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAccess {
    pub available: bool,
    pub readable: bool,
    pub writable: bool,
}

impl NodeAccess {
    pub const READ_WRITE: NodeAccess = NodeAccess {
        available: true,
        readable: true,
        writable: true,
    };
    pub const READ_ONLY: NodeAccess = NodeAccess {
        available: true,
        readable: true,
        writable: false,
    };
    pub const UNAVAILABLE: NodeAccess = NodeAccess {
        available: false,
        readable: false,
        writable: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub kind: FeatureKind,
    pub access: NodeAccess,
}

/// One physical camera.
///
/// Implementations release resources in reverse order of acquisition:
/// `end_acquisition` before `close`, and both must be safe to call when the
/// matching `begin_acquisition`/`open` never happened.
pub trait DeviceHandle: Send {
    /// Serial identifiers of the cameras this backend can open, in a stable order
    fn list_available_serials(&self) -> Result<Vec<String>>;

    /// Fails with `CameraNotFound` for a serial not reported by
    /// `list_available_serials`, `DeviceInitFailure` for driver errors.
    fn open(&mut self, serial: &str) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn begin_acquisition(&mut self) -> Result<()>;

    fn end_acquisition(&mut self) -> Result<()>;

    fn is_acquiring(&self) -> bool;

    /// Blocks until a frame arrives or `timeout` elapses.
    ///
    /// A frame with a nonzero driver status is returned flagged incomplete
    /// rather than as an error; `AcquisitionTimeout` is returned on timeout.
    fn pull_frame(&mut self, timeout: Duration) -> Result<Frame>;

    /// Looks a node up by name; `None` when the device has no such node.
    fn describe_node(&self, name: &str) -> Option<NodeInfo>;

    /// Access flags of an enumeration entry, `None` when the entry does not exist.
    fn describe_entry(&self, node: &str, entry: &str) -> Option<NodeAccess>;

    fn get_feature(&self, name: &str, kind: FeatureKind) -> Result<FeatureValue>;

    fn set_feature(&mut self, name: &str, value: &FeatureValue) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        values: Vec<FeatureValue>,
    }

    #[test]
    fn untagged_values_keep_their_kind() {
        let parsed = from_toml(r#"values = [true, 12, 2.5, "Continuous"]"#);
        let kinds: Vec<_> = parsed.values.iter().map(FeatureValue::kind).collect();
        assert_eq!(
            kinds,
            vec![
                FeatureKind::Boolean,
                FeatureKind::Integer,
                FeatureKind::Float,
                FeatureKind::Enumeration
            ]
        );
    }

    fn from_toml(text: &str) -> Wrapper {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
