//! Bounded retry with a fixed interval

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capture::DeviceHandle;
use crate::error::{CaptureError, Result};
use crate::pipeline::slot::{FrameSlot, FrameSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRetry {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for ConnectionRetry {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            interval_ms: 100,
        }
    }
}

impl ConnectionRetry {
    /// Sub-millisecond intervals round up to 1 ms.
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_micros().div_ceil(1000) as u64,
        }
    }

    /// At least 1 ms.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Calls `probe` with the attempt number (starting at 1) until it yields
    /// a value, sleeping the interval after every miss. Fails with
    /// `AcquisitionTimeout` once `max_attempts` probes came back empty.
    pub fn poll<T>(&self, mut probe: impl FnMut(u32) -> Option<T>) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = probe(attempt) {
                return Ok(value);
            }
            debug!(attempt, max = self.max_attempts, "nothing yet, retrying");
            thread::sleep(self.interval());
        }
        Err(CaptureError::AcquisitionTimeout)
    }

    /// Waits for the first frame with usable dimensions to reach `slot`.
    pub fn await_first_frame(&self, slot: &FrameSlot) -> Result<FrameSnapshot> {
        let snapshot = self.poll(|_| slot.read_latest().filter(|s| s.frame.is_usable()))?;
        info!(
            "First frame {}x{} after generation {}",
            snapshot.frame.width(),
            snapshot.frame.height(),
            snapshot.generation
        );
        Ok(snapshot)
    }

    /// Waits for discovery to report cameras (or `serial`, if given).
    ///
    /// An exhausted wait becomes `NoCamerasFound` or `CameraNotFound`.
    pub fn await_cameras(
        &self,
        device: &dyn DeviceHandle,
        serial: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut last_error = None;
        let found = self.poll(|_| match device.list_available_serials() {
            Ok(serials) => {
                let ready = match serial {
                    Some(wanted) => serials.iter().any(|s| s == wanted),
                    None => !serials.is_empty(),
                };
                ready.then_some(serials)
            }
            Err(err) => {
                last_error = Some(err);
                None
            }
        });

        match found {
            Ok(serials) => {
                info!("Found cams: {}", serials.len());
                Ok(serials)
            }
            Err(_) => Err(match (last_error, serial) {
                (Some(err), _) => err,
                (None, Some(wanted)) => CaptureError::CameraNotFound {
                    serial: wanted.into(),
                },
                (None, None) => CaptureError::NoCamerasFound,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimulatedCamera, SimulatedCameraConfig};
    use std::time::Instant;

    #[test]
    fn exhausted_retry_times_out_after_every_attempt() {
        let retry = ConnectionRetry::new(3, Duration::from_millis(20));
        let slot = FrameSlot::new();
        let mut attempts = 0;
        let start = Instant::now();

        let result = retry.poll(|_| {
            attempts += 1;
            slot.read_latest()
        });

        let elapsed = start.elapsed();
        assert!(matches!(result, Err(CaptureError::AcquisitionTimeout)));
        assert_eq!(attempts, 3);
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(60 + 200));
    }

    #[test]
    fn sub_millisecond_interval_still_sleeps() {
        let retry = ConnectionRetry::new(3, Duration::from_micros(200));
        assert_eq!(retry.interval(), Duration::from_millis(1));
        let zero = ConnectionRetry {
            max_attempts: 3,
            interval_ms: 0,
        };
        assert_eq!(zero.interval(), Duration::from_millis(1));

        let start = Instant::now();
        assert!(zero.poll(|_| None::<()>).is_err());
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn await_first_frame_on_empty_slot_times_out() {
        let retry = ConnectionRetry::new(3, Duration::from_millis(5));
        assert!(matches!(
            retry.await_first_frame(&FrameSlot::new()),
            Err(CaptureError::AcquisitionTimeout)
        ));
    }

    #[test]
    fn first_success_stops_polling() {
        let retry = ConnectionRetry::new(10, Duration::from_millis(1));
        let value = retry.poll(|attempt| (attempt == 4).then_some(attempt));
        assert_eq!(value, Ok(4));
    }

    #[test]
    fn discovery_waits_for_cameras_to_settle() {
        let camera = SimulatedCamera::new(SimulatedCameraConfig {
            discovery_polls: 2,
            ..Default::default()
        });
        let retry = ConnectionRetry::new(5, Duration::from_millis(1));
        assert_eq!(retry.await_cameras(&camera, None), Ok(vec!["SIM-0001".to_string()]));
        assert_eq!(camera.monitor().discovery_calls(), 3);
    }

    #[test]
    fn missing_serial_is_reported() {
        let camera = SimulatedCamera::new(SimulatedCameraConfig::default());
        let retry = ConnectionRetry::new(2, Duration::from_millis(1));
        assert_eq!(
            retry.await_cameras(&camera, Some("SIM-0042")),
            Err(CaptureError::CameraNotFound {
                serial: "SIM-0042".into()
            })
        );

        let empty = SimulatedCamera::new(SimulatedCameraConfig {
            serials: Vec::new(),
            ..Default::default()
        });
        assert_eq!(
            retry.await_cameras(&empty, None),
            Err(CaptureError::NoCamerasFound)
        );
    }
}
