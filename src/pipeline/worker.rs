//! Background capture loop feeding a [`FrameSlot`]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::capture::decoder::{self, FrameConverter};
use crate::capture::{DeviceHandle, FrameStatus};
use crate::error::{CaptureError, Result};
use crate::pipeline::slot::{FrameSlot, FrameSnapshot};
use crate::pipeline::telemetry::{TelemetrySample, TelemetryWindow, DEFAULT_WINDOW};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Upper bound of a single `pull_frame`, and so of `stop()` latency
    pub pull_timeout_ms: u64,
    pub telemetry_window: u32,
    /// Pin the capture thread to this core
    pub pin_core: Option<usize>,
    pub thread_name: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            pull_timeout_ms: 1000,
            telemetry_window: DEFAULT_WINDOW,
            pin_core: None,
            thread_name: "mvcap-capture".into(),
        }
    }
}

impl WorkerOptions {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
}

/// Lifecycle notifications. The channel holds a small backlog and new events
/// are dropped while it is full.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started,
    Faulted(CaptureError),
    Stopped,
}

const EVENT_CAPACITY: usize = 16;

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    incomplete: AtomicU64,
    timeouts: AtomicU64,
    conversion_failures: AtomicU64,
}

/// Cumulative counters since the worker was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounters {
    pub published: u64,
    pub incomplete: u64,
    pub timeouts: u64,
    pub conversion_failures: u64,
}

struct Shared {
    slot: Arc<FrameSlot>,
    cancel: AtomicBool,
    running: AtomicBool,
    fault: Mutex<Option<CaptureError>>,
    telemetry: ArcSwap<TelemetrySample>,
    stats: CachePadded<Stats>,
    events: flume::Sender<WorkerEvent>,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        // Lifecycle events are advisory; a full channel just loses one.
        let _ = self.events.try_send(event);
    }

    fn set_fault(&self, fault: Option<CaptureError>) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = fault;
    }
}

type Parts = (Box<dyn DeviceHandle>, Box<dyn FrameConverter>);
type LoopBody = Box<dyn FnOnce() -> Option<Parts> + Send>;

/// Owns one device and the single thread that pulls from it.
///
/// The device lives inside the capture thread while running and is handed
/// back when the thread exits, so there is never more than one capture loop
/// per device.
pub struct CaptureWorker {
    parts: Option<Parts>,
    thread: Option<JoinHandle<Option<Parts>>>,
    shared: Arc<Shared>,
    events: flume::Receiver<WorkerEvent>,
    options: WorkerOptions,
}

impl CaptureWorker {
    pub fn new(device: Box<dyn DeviceHandle>, options: WorkerOptions) -> Self {
        let (tx, rx) = flume::bounded(EVENT_CAPACITY);
        let converter: Box<dyn FrameConverter> = Box::new(decoder::normalize);
        Self {
            parts: Some((device, converter)),
            thread: None,
            shared: Arc::new(Shared {
                slot: Arc::new(FrameSlot::new()),
                cancel: AtomicBool::new(false),
                running: AtomicBool::new(false),
                fault: Mutex::new(None),
                telemetry: ArcSwap::from_pointee(TelemetrySample::default()),
                stats: CachePadded::new(Stats::default()),
                events: tx,
            }),
            events: rx,
            options,
        }
    }

    /// Replaces the default MJPEG normalization. Only effective while stopped.
    pub fn with_converter(mut self, converter: impl FrameConverter + 'static) -> Self {
        if let Some((_, current)) = self.parts.as_mut() {
            *current = Box::new(converter);
        }
        self
    }

    pub fn state(&self) -> WorkerState {
        if self.shared.running.load(Ordering::Acquire) {
            WorkerState::Running
        } else {
            WorkerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Begins acquisition and spawns the capture thread.
    ///
    /// Starting a running worker fails with `WorkerAlreadyRunning`. A worker
    /// whose loop died on a driver error is cleaned up and restarted.
    pub fn start(&mut self) -> Result<()> {
        self.launch(|builder, body| builder.spawn(body))
    }

    fn launch<S>(&mut self, spawn: S) -> Result<()>
    where
        S: FnOnce(thread::Builder, LoopBody) -> io::Result<JoinHandle<Option<Parts>>>,
    {
        if self.is_running() {
            return Err(CaptureError::WorkerAlreadyRunning);
        }
        // Reap a loop that exited on its own.
        self.stop()?;
        // Frames from a previous run are stale.
        self.shared.slot.clear();

        let (mut device, converter) = self
            .parts
            .take()
            .ok_or_else(|| CaptureError::Driver("device lost by a panicked capture thread".into()))?;
        if let Err(err) = device.begin_acquisition() {
            self.parts = Some((device, converter));
            return Err(err);
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.set_fault(None);
        self.shared.running.store(true, Ordering::Release);
        self.shared.emit(WorkerEvent::Started);

        // The parts stay reachable from here until the thread has taken them.
        let handoff = Arc::new(Mutex::new(Some((device, converter))));
        let body: LoopBody = {
            let handoff = Arc::clone(&handoff);
            let shared = Arc::clone(&self.shared);
            let options = self.options.clone();
            Box::new(move || {
                let parts = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
                parts.map(|(device, converter)| capture_loop(device, converter, shared, options))
            })
        };
        let builder = thread::Builder::new().name(self.options.thread_name.clone());
        match spawn(builder, body) {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("Capture worker started");
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                let parts = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some((mut device, converter)) = parts {
                    if let Err(end) = device.end_acquisition() {
                        warn!("Failed to end acquisition: {end}");
                    }
                    self.parts = Some((device, converter));
                }
                self.shared.emit(WorkerEvent::Stopped);
                Err(CaptureError::Driver(format!(
                    "failed to spawn capture thread: {err}"
                )))
            }
        }
    }

    /// Cancels the loop, waits for it to exit (at most one pull timeout) and
    /// ends acquisition. No-op on a stopped worker.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.shared.cancel.store(true, Ordering::Release);
        let joined = handle.join();
        self.shared.running.store(false, Ordering::Release);

        match joined {
            Ok(Some((mut device, converter))) => {
                let ended = device.end_acquisition();
                self.parts = Some((device, converter));
                self.shared.emit(WorkerEvent::Stopped);
                info!("Capture worker stopped");
                ended
            }
            Ok(None) => Ok(()),
            Err(_) => {
                let err = CaptureError::Driver("capture thread panicked".into());
                self.shared.set_fault(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Shared slot the loop publishes into
    pub fn slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.shared.slot)
    }

    pub fn read_latest(&self) -> Option<FrameSnapshot> {
        self.shared.slot.read_latest()
    }

    /// Latest completed telemetry window; all zeros until the first fills.
    pub fn telemetry(&self) -> TelemetrySample {
        **self.shared.telemetry.load()
    }

    pub fn counters(&self) -> WorkerCounters {
        let stats = &self.shared.stats;
        WorkerCounters {
            published: stats.published.load(Ordering::Relaxed),
            incomplete: stats.incomplete.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            conversion_failures: stats.conversion_failures.load(Ordering::Relaxed),
        }
    }

    /// The error that terminated the last run, if any
    pub fn fault(&self) -> Option<CaptureError> {
        self.shared
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> flume::Receiver<WorkerEvent> {
        self.events.clone()
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// The device, while no capture thread holds it
    pub fn device_mut(&mut self) -> Option<&mut (dyn DeviceHandle + 'static)> {
        self.parts.as_mut().map(|(device, _)| device.as_mut())
    }

    /// Stops the worker and hands the device back.
    pub fn into_device(mut self) -> Result<Box<dyn DeviceHandle>> {
        self.stop()?;
        self.parts
            .take()
            .map(|(device, _)| device)
            .ok_or_else(|| CaptureError::Driver("device lost by a panicked capture thread".into()))
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("Capture worker did not stop cleanly: {err}");
        }
    }
}

fn capture_loop(
    mut device: Box<dyn DeviceHandle>,
    mut converter: Box<dyn FrameConverter>,
    shared: Arc<Shared>,
    options: WorkerOptions,
) -> Parts {
    if let Some(id) = options.pin_core {
        if core_affinity::set_for_current(core_affinity::CoreId { id }) {
            debug!("Capture thread pinned to core {id}");
        } else {
            warn!("Could not pin capture thread to core {id}");
        }
    }

    let timeout = options.pull_timeout();
    let mut window = TelemetryWindow::new(options.telemetry_window);
    let mut last_publish = Instant::now();
    let stats = &shared.stats;

    while !shared.cancel.load(Ordering::Acquire) {
        let frame = match device.pull_frame(timeout) {
            Ok(frame) => frame,
            Err(CaptureError::FrameIncomplete { status }) => {
                stats.incomplete.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mvcap_frames_incomplete").increment(1);
                warn!("Image incomplete with image status {status}");
                continue;
            }
            Err(err) if err.is_transient() => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mvcap_pull_timeouts").increment(1);
                trace!("{err}");
                continue;
            }
            Err(err) => {
                error!("Capture loop stopped: {err}");
                if let Err(end) = device.end_acquisition() {
                    warn!("Failed to end acquisition: {end}");
                }
                shared.set_fault(Some(err.clone()));
                shared.running.store(false, Ordering::Release);
                shared.emit(WorkerEvent::Faulted(err));
                break;
            }
        };

        if let FrameStatus::Incomplete(status) = frame.status() {
            stats.incomplete.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("mvcap_frames_incomplete").increment(1);
            warn!("Image incomplete with image status {status}");
            continue;
        }

        let lag = frame.meta().pull_latency;
        let frame = match converter.convert(frame) {
            Ok(frame) => frame,
            Err(err) => {
                stats.conversion_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping frame: {err}");
                continue;
            }
        };

        let now = Instant::now();
        let interval = now.duration_since(last_publish);
        last_publish = now;
        shared.slot.publish(frame);
        stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mvcap_frames_published").increment(1);
        metrics::histogram!("mvcap_pull_latency_ms").record(lag.as_secs_f64() * 1000.0);

        if let Some(sample) = window.record(interval, lag) {
            metrics::gauge!("mvcap_capture_fps").set(sample.fps);
            debug!(
                "fps: {:.0}, lag: {:.1}ms",
                sample.fps, sample.avg_lag_ms
            );
            shared.telemetry.store(Arc::new(sample));
        }
    }

    (device, converter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{SimMonitor, SimulatedCamera, SimulatedCameraConfig};
    use crate::capture::Frame;
    use crate::pipeline::retry::ConnectionRetry;

    fn worker(config: SimulatedCameraConfig, options: WorkerOptions) -> (CaptureWorker, SimMonitor) {
        let mut camera = SimulatedCamera::new(config);
        camera.open("SIM-0001").unwrap();
        let monitor = camera.monitor();
        (CaptureWorker::new(Box::new(camera), options), monitor)
    }

    fn fast() -> SimulatedCameraConfig {
        SimulatedCameraConfig {
            frame_rate: 250.0,
            sensor_width: 64,
            sensor_height: 48,
            ..Default::default()
        }
    }

    fn options(pull_timeout_ms: u64, telemetry_window: u32) -> WorkerOptions {
        WorkerOptions {
            pull_timeout_ms,
            telemetry_window,
            ..Default::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        ConnectionRetry::new(200, Duration::from_millis(10))
            .poll(|_| condition().then_some(()))
            .unwrap();
    }

    #[test]
    fn immediate_stop_is_bounded_by_pull_timeout() {
        let (mut worker, monitor) = worker(
            SimulatedCameraConfig {
                stall: true,
                ..Default::default()
            },
            options(100, 60),
        );
        worker.start().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert!(monitor.is_acquiring());

        let start = Instant::now();
        worker.stop().unwrap();

        assert!(start.elapsed() < Duration::from_millis(100 + 150));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!monitor.is_acquiring());
    }

    #[test]
    fn publishes_frames_and_reports_telemetry() {
        let (mut worker, _monitor) = worker(fast(), options(200, 10));
        worker.start().unwrap();

        wait_for(|| worker.telemetry().windows >= 1);
        let sample = worker.telemetry();
        assert!(sample.fps > 0.0);
        assert!(sample.avg_lag_ms >= 0.0);

        let snapshot = worker.read_latest().unwrap();
        assert!(snapshot.frame.is_usable());
        assert_eq!((snapshot.frame.width(), snapshot.frame.height()), (64, 48));
        assert!(worker.counters().published >= 10);
        worker.stop().unwrap();
    }

    #[test]
    fn incomplete_frames_are_never_published() {
        let (mut worker, _monitor) = worker(
            SimulatedCameraConfig {
                incomplete_every: Some(2),
                ..fast()
            },
            options(200, 60),
        );
        worker.start().unwrap();
        wait_for(|| worker.counters().incomplete >= 3);

        let mut last = 0;
        for _ in 0..20 {
            if let Some(snapshot) = worker.read_latest() {
                assert!(snapshot.generation >= last);
                assert_eq!(snapshot.frame.sequence() % 2, 1);
                last = snapshot.generation;
            }
            thread::sleep(Duration::from_millis(2));
        }
        worker.stop().unwrap();
    }

    #[test]
    fn starting_twice_is_an_error() {
        let (mut worker, _monitor) = worker(fast(), options(100, 60));
        worker.start().unwrap();
        assert_eq!(worker.start(), Err(CaptureError::WorkerAlreadyRunning));
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn stopping_a_fresh_worker_is_a_noop() {
        let (mut worker, monitor) = worker(fast(), options(100, 60));
        assert_eq!(worker.stop(), Ok(()));
        assert!(worker.events().try_recv().is_err());
        assert!(monitor.is_open());
    }

    #[test]
    fn driver_error_stops_the_worker_with_a_fault() {
        let (mut worker, monitor) = worker(
            SimulatedCameraConfig {
                fail_after: Some(5),
                ..fast()
            },
            options(100, 60),
        );
        let events = worker.events();
        worker.start().unwrap();

        wait_for(|| worker.state() == WorkerState::Stopped);
        // Stopped already means acquisition has ended, before any reaping.
        assert!(!monitor.is_acquiring());
        let fault = worker.fault().unwrap();
        assert!(matches!(fault, CaptureError::Driver(_)));
        assert_eq!(events.recv().unwrap(), WorkerEvent::Started);
        assert_eq!(events.recv().unwrap(), WorkerEvent::Faulted(fault));

        worker.stop().unwrap();
        assert!(!monitor.is_acquiring());
        assert_eq!(events.recv().unwrap(), WorkerEvent::Stopped);
    }

    #[test]
    fn restart_continues_the_generation_sequence() {
        let (mut worker, _monitor) = worker(fast(), options(100, 60));
        worker.start().unwrap();
        wait_for(|| worker.read_latest().is_some());
        worker.stop().unwrap();
        let before = worker.slot().generation();

        worker.start().unwrap();
        wait_for(|| worker.slot().generation() > before);
        worker.stop().unwrap();
    }

    #[test]
    fn conversion_failures_drop_the_frame() {
        let (worker, _monitor) = worker(fast(), options(100, 60));
        let mut worker = worker.with_converter(|_frame: Frame| -> Result<Frame> {
            Err(CaptureError::Conversion("unsupported".into()))
        });
        worker.start().unwrap();
        wait_for(|| worker.counters().conversion_failures >= 3);
        assert!(worker.read_latest().is_none());
        assert_eq!(worker.counters().published, 0);

        let device = worker.into_device().unwrap();
        assert!(!device.is_acquiring());
    }

    #[test]
    fn failed_spawn_hands_the_device_back() {
        let (mut worker, monitor) = worker(fast(), options(100, 60));
        let result = worker.launch(|_, _| Err(io::Error::other("thread limit reached")));

        assert!(matches!(result, Err(CaptureError::Driver(_))));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!monitor.is_acquiring());

        // The device survived and can be started for real.
        worker.start().unwrap();
        wait_for(|| worker.read_latest().is_some());
        worker.stop().unwrap();
    }

    /// Reports incomplete frames as errors instead of flagged frames.
    struct StatusAsError(SimulatedCamera);

    impl DeviceHandle for StatusAsError {
        fn list_available_serials(&self) -> Result<Vec<String>> {
            self.0.list_available_serials()
        }
        fn open(&mut self, serial: &str) -> Result<()> {
            self.0.open(serial)
        }
        fn close(&mut self) -> Result<()> {
            self.0.close()
        }
        fn is_open(&self) -> bool {
            self.0.is_open()
        }
        fn begin_acquisition(&mut self) -> Result<()> {
            self.0.begin_acquisition()
        }
        fn end_acquisition(&mut self) -> Result<()> {
            self.0.end_acquisition()
        }
        fn is_acquiring(&self) -> bool {
            self.0.is_acquiring()
        }
        fn pull_frame(&mut self, timeout: Duration) -> Result<Frame> {
            let frame = self.0.pull_frame(timeout)?;
            match frame.status() {
                FrameStatus::Incomplete(status) => Err(CaptureError::FrameIncomplete { status }),
                FrameStatus::Complete => Ok(frame),
            }
        }
        fn describe_node(&self, name: &str) -> Option<crate::capture::NodeInfo> {
            self.0.describe_node(name)
        }
        fn describe_entry(&self, node: &str, entry: &str) -> Option<crate::capture::NodeAccess> {
            self.0.describe_entry(node, entry)
        }
        fn get_feature(
            &self,
            name: &str,
            kind: crate::capture::FeatureKind,
        ) -> Result<crate::capture::FeatureValue> {
            self.0.get_feature(name, kind)
        }
        fn set_feature(&mut self, name: &str, value: &crate::capture::FeatureValue) -> Result<()> {
            self.0.set_feature(name, value)
        }
    }

    #[test]
    fn incomplete_errors_count_as_incomplete_not_timeouts() {
        let mut camera = SimulatedCamera::new(SimulatedCameraConfig {
            incomplete_every: Some(2),
            ..fast()
        });
        camera.open("SIM-0001").unwrap();
        let mut worker = CaptureWorker::new(Box::new(StatusAsError(camera)), options(100, 60));

        worker.start().unwrap();
        wait_for(|| worker.counters().incomplete >= 3);
        worker.stop().unwrap();

        let counters = worker.counters();
        assert_eq!(counters.timeouts, 0);
        assert!(counters.published > 0);
        assert!(worker.fault().is_none());
    }
}
