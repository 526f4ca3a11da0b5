pub mod decoder;
pub mod device;
pub mod frame;
pub mod nodes;
pub mod sim;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use device::{sfnc, DeviceHandle, FeatureKind, FeatureValue, NodeAccess, NodeInfo};
pub use frame::{Frame, FrameMetadata, FrameStatus, PixelFormat};
pub use nodes::{configure, ConfigOutcome, FeatureRequest, NodeOutcome};
pub use sim::{SimulatedCamera, SimulatedCameraConfig};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;
