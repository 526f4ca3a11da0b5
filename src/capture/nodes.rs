//! Best-effort feature-node configuration
//!
//! Cameras differ in the features they expose across models and firmware, so
//! a missing or locked node never aborts configuration: the request is
//! skipped, recorded, and the next one is applied.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::capture::device::{sfnc, DeviceHandle, FeatureKind, FeatureValue};
use crate::error::CaptureError;

/// A desired setting for one feature node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawFeatureRequest")]
pub struct FeatureRequest {
    pub node: String,
    pub kind: FeatureKind,
    pub value: FeatureValue,
}

#[derive(Deserialize)]
struct RawFeatureRequest {
    node: String,
    kind: FeatureKind,
    value: FeatureValue,
}

impl From<RawFeatureRequest> for FeatureRequest {
    /// Integer literals written for a float node (`value = 5000`) are taken
    /// as floats.
    fn from(raw: RawFeatureRequest) -> Self {
        let value = match (raw.kind, raw.value) {
            (FeatureKind::Float, FeatureValue::Int(v)) => FeatureValue::Float(v as f64),
            (_, value) => value,
        };
        Self {
            node: raw.node,
            kind: raw.kind,
            value,
        }
    }
}

impl FeatureRequest {
    pub fn enumeration(node: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind: FeatureKind::Enumeration,
            value: FeatureValue::Entry(entry.into()),
        }
    }

    pub fn boolean(node: impl Into<String>, value: bool) -> Self {
        Self {
            node: node.into(),
            kind: FeatureKind::Boolean,
            value: FeatureValue::Bool(value),
        }
    }

    pub fn integer(node: impl Into<String>, value: i64) -> Self {
        Self {
            node: node.into(),
            kind: FeatureKind::Integer,
            value: FeatureValue::Int(value),
        }
    }

    pub fn float(node: impl Into<String>, value: f64) -> Self {
        Self {
            node: node.into(),
            kind: FeatureKind::Float,
            value: FeatureValue::Float(value),
        }
    }
}

impl fmt::Display for FeatureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.node, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOutcome {
    Applied,
    /// The node already held the desired value; nothing was written.
    Unchanged,
    Skipped(CaptureError),
    /// The desired pixel format is not offered by this device.
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub node: String,
    pub outcome: ConfigOutcome,
}

impl NodeOutcome {
    pub fn is_warning(&self) -> bool {
        matches!(
            self.outcome,
            ConfigOutcome::Skipped(_) | ConfigOutcome::Unsupported(_)
        )
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ConfigOutcome::Applied => write!(f, "{}: applied", self.node),
            ConfigOutcome::Unchanged => write!(f, "{}: unchanged", self.node),
            ConfigOutcome::Skipped(reason) => write!(f, "{}: skipped ({reason})", self.node),
            ConfigOutcome::Unsupported(format) => {
                write!(f, "{}: {format} not supported by device", self.node)
            }
        }
    }
}

/// Applies `requests` in order and returns one outcome per request.
#[instrument(skip_all, fields(requests = requests.len()))]
pub fn configure(device: &mut dyn DeviceHandle, requests: &[FeatureRequest]) -> Vec<NodeOutcome> {
    requests
        .iter()
        .map(|request| {
            let outcome = apply(device, request);
            match &outcome {
                ConfigOutcome::Applied | ConfigOutcome::Unchanged => {
                    debug!("{request}: {outcome:?}")
                }
                ConfigOutcome::Skipped(reason) if reason.is_configuration() => {
                    warn!("could not set {request}: {reason}")
                }
                ConfigOutcome::Skipped(reason) => error!("device failed to set {request}: {reason}"),
                ConfigOutcome::Unsupported(format) => {
                    warn!("{format} not available on this device, keeping current format")
                }
            }
            NodeOutcome {
                node: request.node.clone(),
                outcome,
            }
        })
        .collect()
}

fn apply(device: &mut dyn DeviceHandle, request: &FeatureRequest) -> ConfigOutcome {
    let name = request.node.as_str();
    let info = match device.describe_node(name) {
        Some(info) if info.access.available => info,
        _ => return ConfigOutcome::Skipped(CaptureError::NodeUnavailable(name.into())),
    };

    let requested = request.value.kind();
    if info.kind != request.kind || requested != request.kind {
        return ConfigOutcome::Skipped(CaptureError::KindMismatch {
            node: name.into(),
            requested: requested.name(),
            actual: info.kind.name(),
        });
    }

    // Skip redundant firmware writes, even on nodes we could not write anyway.
    if info.access.readable {
        if let Ok(current) = device.get_feature(name, info.kind) {
            if current == request.value {
                return ConfigOutcome::Unchanged;
            }
        }
    }

    if !info.access.writable {
        return ConfigOutcome::Skipped(CaptureError::NodeNotWritable(name.into()));
    }

    if let FeatureValue::Entry(entry) = &request.value {
        match device.describe_entry(name, entry) {
            None if name == sfnc::PIXEL_FORMAT => {
                return ConfigOutcome::Unsupported(entry.clone());
            }
            None => {
                return ConfigOutcome::Skipped(CaptureError::EntryUnavailable {
                    node: name.into(),
                    entry: entry.clone(),
                })
            }
            Some(access) if !access.available => {
                return ConfigOutcome::Skipped(CaptureError::EntryUnavailable {
                    node: name.into(),
                    entry: entry.clone(),
                })
            }
            Some(access) if !access.readable => {
                return ConfigOutcome::Skipped(CaptureError::NodeNotReadable(format!(
                    "{name}::{entry}"
                )))
            }
            Some(_) => {}
        }
    }

    match device.set_feature(name, &request.value) {
        Ok(()) => ConfigOutcome::Applied,
        Err(err) => ConfigOutcome::Skipped(err),
    }
}
