//! Error taxonomy shared by the device, configuration and capture layers

use thiserror::Error;

/// Result alias used across the capture core
pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("no cameras found")]
    NoCamerasFound,

    #[error("camera {serial:?} not found")]
    CameraNotFound { serial: String },

    #[error("device initialisation failed: {0}")]
    DeviceInitFailure(String),

    #[error("device is not open")]
    NotOpen,

    #[error("feature node {0:?} is not available")]
    NodeUnavailable(String),

    #[error("feature node {0:?} is not writable")]
    NodeNotWritable(String),

    #[error("feature node {0:?} is not readable")]
    NodeNotReadable(String),

    #[error("entry {entry:?} of feature node {node:?} is not available")]
    EntryUnavailable { node: String, entry: String },

    #[error("feature node {node:?} is {actual}, request was {requested}")]
    KindMismatch {
        node: String,
        requested: &'static str,
        actual: &'static str,
    },

    #[error("timed out waiting for a frame")]
    AcquisitionTimeout,

    #[error("frame incomplete with image status {status}")]
    FrameIncomplete { status: u32 },

    #[error("capture worker is already running")]
    WorkerAlreadyRunning,

    #[error("frame conversion failed: {0}")]
    Conversion(String),

    #[error("driver error: {0}")]
    Driver(String),
}

impl CaptureError {
    /// Errors the capture loop tolerates without stopping.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::AcquisitionTimeout | CaptureError::FrameIncomplete { .. }
        )
    }

    /// Configuration errors that skip a single feature request.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CaptureError::NodeUnavailable(_)
                | CaptureError::NodeNotWritable(_)
                | CaptureError::NodeNotReadable(_)
                | CaptureError::EntryUnavailable { .. }
                | CaptureError::KindMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_incomplete_frames_are_transient() {
        assert!(CaptureError::AcquisitionTimeout.is_transient());
        assert!(CaptureError::FrameIncomplete { status: 3 }.is_transient());
        assert!(!CaptureError::Driver("usb reset".into()).is_transient());
        assert!(!CaptureError::WorkerAlreadyRunning.is_transient());
    }

    #[test]
    fn display_names_the_node() {
        let err = CaptureError::NodeNotWritable("ReverseY".into());
        assert_eq!(err.to_string(), "feature node \"ReverseY\" is not writable");
        assert!(err.is_configuration());
    }
}
