//! Capture session: discovery, configuration, worker and warm-up in one place

use tracing::{info, instrument, warn};

use crate::capture::{configure, DeviceHandle, FeatureRequest, NodeOutcome};
use crate::error::Result;
use crate::pipeline::{
    CaptureWorker, FrameSnapshot, TelemetrySample, WorkerCounters, WorkerEvent, WorkerState,
};
use crate::utils::select_camera;
use crate::{DeviceSettings, PipelineConfig};

/// A configured camera with a running capture worker
pub struct CaptureSession {
    worker: CaptureWorker,
    serial: String,
    outcomes: Vec<NodeOutcome>,
    closed: bool,
}

/// Serials of the cameras `device` can currently open
pub fn list_cameras(device: &dyn DeviceHandle) -> Result<Vec<String>> {
    device.list_available_serials()
}

/// Opens the camera picked by `settings`, applies the derived feature
/// requests followed by `extra`, starts capture and waits for the first
/// usable frame.
///
/// Feature requests that cannot be applied are logged and kept in
/// [`CaptureSession::outcomes`]; they never fail the start. On any error the
/// device is left closed.
#[instrument(skip_all, fields(serial = settings.serial.as_deref()))]
pub fn start_capture(
    mut device: Box<dyn DeviceHandle>,
    settings: &DeviceSettings,
    extra: &[FeatureRequest],
    pipeline: &PipelineConfig,
) -> Result<CaptureSession> {
    let serials = pipeline
        .discovery
        .await_cameras(device.as_ref(), settings.serial.as_deref())?;
    let serial = select_camera(&serials, settings.serial.as_deref())?;
    device.open(&serial)?;
    info!("Opened camera {serial}");

    let mut requests = settings.feature_requests();
    requests.extend_from_slice(extra);
    let outcomes = configure(device.as_mut(), &requests);
    let warnings = outcomes.iter().filter(|o| o.is_warning()).count();
    if warnings > 0 {
        warn!("{warnings} of {} feature requests not applied", outcomes.len());
    }

    let mut session = CaptureSession {
        worker: CaptureWorker::new(device, pipeline.worker.clone()),
        serial,
        outcomes,
        closed: false,
    };
    if let Err(err) = session.worker.start() {
        session.shutdown();
        return Err(err);
    }

    if let Err(err) = pipeline.warmup.await_first_frame(&session.worker.slot()) {
        // A loop that died on the device says more than the timeout.
        let err = session.worker.fault().unwrap_or(err);
        session.shutdown();
        return Err(err);
    }
    Ok(session)
}

impl CaptureSession {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Outcome of every feature request, in application order
    pub fn outcomes(&self) -> &[NodeOutcome] {
        &self.outcomes
    }

    /// Newest published frame; never blocks on the capture thread.
    pub fn read_latest_frame(&self) -> Option<FrameSnapshot> {
        self.worker.read_latest()
    }

    /// Newest frame if it is newer than `generation`.
    pub fn read_frame_newer_than(&self, generation: u64) -> Option<FrameSnapshot> {
        self.worker.slot().read_newer_than(generation)
    }

    pub fn read_telemetry(&self) -> TelemetrySample {
        self.worker.telemetry()
    }

    pub fn counters(&self) -> WorkerCounters {
        self.worker.counters()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn fault(&self) -> Option<crate::CaptureError> {
        self.worker.fault()
    }

    pub fn events(&self) -> flume::Receiver<WorkerEvent> {
        self.worker.events()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stops capture and closes the device. Later calls do nothing.
    pub fn stop_capture(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let stopped = self.worker.stop();
        let closed = match self.worker.device_mut() {
            Some(device) => device.close(),
            None => Ok(()),
        };
        info!("Capture session for {} closed", self.serial);
        stopped.and(closed)
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.stop_capture() {
            warn!("Failed to release camera {}: {err}", self.serial);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimMonitor, SimulatedCamera, SimulatedCameraConfig};
    use crate::capture::{sfnc, ConfigOutcome};
    use crate::error::CaptureError;
    use crate::pipeline::{ConnectionRetry, WorkerOptions};
    use std::time::Duration;

    fn pipeline() -> PipelineConfig {
        PipelineConfig {
            worker: WorkerOptions {
                pull_timeout_ms: 50,
                telemetry_window: 5,
                ..Default::default()
            },
            discovery: ConnectionRetry::new(3, Duration::from_millis(5)),
            warmup: ConnectionRetry::new(20, Duration::from_millis(10)),
            ..Default::default()
        }
    }

    fn camera(config: SimulatedCameraConfig) -> (Box<dyn DeviceHandle>, SimMonitor) {
        let camera = SimulatedCamera::new(config);
        let monitor = camera.monitor();
        (Box::new(camera), monitor)
    }

    #[test]
    fn session_delivers_configured_frames() {
        let (device, monitor) = camera(SimulatedCameraConfig::default());
        let settings = DeviceSettings {
            width: Some(320),
            height: Some(240),
            ..Default::default()
        };
        let mut session = start_capture(device, &settings, &[], &pipeline()).unwrap();
        assert_eq!(session.serial(), "SIM-0001");

        let snapshot = session.read_latest_frame().unwrap();
        assert_eq!((snapshot.frame.width(), snapshot.frame.height()), (320, 240));
        assert_eq!(snapshot.frame.format(), settings.format);
        assert!(monitor.is_acquiring());

        session.stop_capture().unwrap();
        assert!(!monitor.is_acquiring());
        assert!(!monitor.is_open());
        assert!(session.is_closed());
    }

    #[test]
    fn stop_capture_is_repeatable() {
        let (device, _) = camera(SimulatedCameraConfig::default());
        let mut session =
            start_capture(device, &DeviceSettings::default(), &[], &pipeline()).unwrap();
        session.stop_capture().unwrap();
        session.stop_capture().unwrap();
        assert_eq!(session.state(), WorkerState::Stopped);
    }

    #[test]
    fn unknown_extra_feature_is_reported_not_fatal() {
        let (device, _) = camera(SimulatedCameraConfig::default());
        let extra = [FeatureRequest::enumeration("GainAuto", "Off")];
        let session =
            start_capture(device, &DeviceSettings::default(), &extra, &pipeline()).unwrap();

        let last = session.outcomes().last().unwrap();
        assert_eq!(last.node, "GainAuto");
        assert_eq!(
            last.outcome,
            ConfigOutcome::Skipped(CaptureError::NodeUnavailable("GainAuto".into()))
        );
        assert!(session
            .outcomes()
            .iter()
            .filter(|o| o.node == sfnc::PIXEL_FORMAT)
            .all(|o| o.outcome == ConfigOutcome::Applied));
    }

    #[test]
    fn requested_serial_must_exist() {
        let (device, monitor) = camera(SimulatedCameraConfig::default());
        let settings = DeviceSettings {
            serial: Some("SIM-0009".into()),
            ..Default::default()
        };
        let result = start_capture(device, &settings, &[], &pipeline());
        assert_eq!(
            result.err(),
            Some(CaptureError::CameraNotFound {
                serial: "SIM-0009".into()
            })
        );
        assert!(!monitor.is_open());
    }

    #[test]
    fn no_cameras_at_all() {
        let (device, _) = camera(SimulatedCameraConfig {
            serials: Vec::new(),
            ..Default::default()
        });
        let result = start_capture(device, &DeviceSettings::default(), &[], &pipeline());
        assert_eq!(result.err(), Some(CaptureError::NoCamerasFound));
    }

    #[test]
    fn zero_sized_sensor_fails_to_open_instead_of_capturing() {
        let (device, monitor) = camera(SimulatedCameraConfig {
            sensor_width: 0,
            ..Default::default()
        });
        let result = start_capture(device, &DeviceSettings::default(), &[], &pipeline());
        assert!(matches!(result, Err(CaptureError::DeviceInitFailure(_))));
        assert!(!monitor.is_open());
        assert!(!monitor.is_acquiring());
    }

    #[test]
    fn init_failure_surfaces() {
        let (device, _) = camera(SimulatedCameraConfig {
            init_failure: true,
            ..Default::default()
        });
        let result = start_capture(device, &DeviceSettings::default(), &[], &pipeline());
        assert!(matches!(result, Err(CaptureError::DeviceInitFailure(_))));
    }

    #[test]
    fn stalled_camera_times_out_during_warmup_and_is_closed() {
        let (device, monitor) = camera(SimulatedCameraConfig {
            stall: true,
            ..Default::default()
        });
        let mut options = pipeline();
        options.warmup = ConnectionRetry::new(3, Duration::from_millis(10));
        let result = start_capture(device, &DeviceSettings::default(), &[], &options);
        assert_eq!(result.err(), Some(CaptureError::AcquisitionTimeout));
        assert!(!monitor.is_acquiring());
        assert!(!monitor.is_open());
    }

    #[test]
    fn list_cameras_reports_serials() {
        let (device, _) = camera(SimulatedCameraConfig {
            serials: vec!["A".into(), "B".into()],
            ..Default::default()
        });
        assert_eq!(list_cameras(device.as_ref()), Ok(vec!["A".into(), "B".into()]));
    }
}
