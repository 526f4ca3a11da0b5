pub mod retry;
pub mod slot;
pub mod telemetry;
pub mod worker;

pub use retry::ConnectionRetry;
pub use slot::{FrameSlot, FrameSnapshot};
pub use telemetry::{TelemetrySample, TelemetryWindow};
pub use worker::{CaptureWorker, WorkerCounters, WorkerEvent, WorkerOptions, WorkerState};
