use tracing::info;

use crate::capture::{DeviceHandle, SimulatedCamera};
use crate::error::{CaptureError, Result};
use crate::{Backend, Config};

/// Picks `requested` out of `serials`, or the first camera when nothing was
/// requested.
pub fn select_camera(serials: &[String], requested: Option<&str>) -> Result<String> {
    match requested {
        Some(wanted) => serials
            .iter()
            .find(|s| s.as_str() == wanted)
            .cloned()
            .ok_or_else(|| CaptureError::CameraNotFound {
                serial: wanted.into(),
            }),
        None => serials.first().cloned().ok_or(CaptureError::NoCamerasFound),
    }
}

/// Builds the device backend named in `config`, unopened.
pub fn open_backend(config: &Config) -> Result<Box<dyn DeviceHandle>> {
    match config.backend {
        Backend::Simulated => {
            info!(
                "Using simulated camera backend ({} camera(s))",
                config.simulator.serials.len()
            );
            Ok(Box::new(SimulatedCamera::new(config.simulator.clone())))
        }
        #[cfg(feature = "v4l2")]
        Backend::V4l2 => {
            info!("Using V4L2 camera backend");
            Ok(Box::new(crate::capture::V4l2Camera::new(
                config.pipeline.buffer_count,
            )))
        }
        #[cfg(not(feature = "v4l2"))]
        Backend::V4l2 => Err(CaptureError::DeviceInitFailure(
            "built without the `v4l2` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serials() -> Vec<String> {
        vec!["A".into(), "B".into()]
    }

    #[test]
    fn first_camera_when_none_requested() {
        assert_eq!(select_camera(&serials(), None), Ok("A".into()));
        assert_eq!(select_camera(&[], None), Err(CaptureError::NoCamerasFound));
    }

    #[test]
    fn requested_camera_must_be_listed() {
        assert_eq!(select_camera(&serials(), Some("B")), Ok("B".into()));
        assert_eq!(
            select_camera(&serials(), Some("C")),
            Err(CaptureError::CameraNotFound { serial: "C".into() })
        );
    }

    #[test]
    fn simulated_backend_starts_closed() {
        let device = open_backend(&Config::default()).unwrap();
        assert!(!device.is_open());
        assert_eq!(device.list_available_serials(), Ok(vec!["SIM-0001".into()]));
    }
}
