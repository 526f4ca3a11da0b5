//! Rolling throughput and latency statistics

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WINDOW: u32 = 60;

/// One fps/lag sample, produced once per telemetry window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub fps: f64,
    pub avg_lag_ms: f64,
    /// Number of windows completed so far; zero until the first fills
    pub windows: u64,
}

/// Fixed-size batch of frames over which fps and pull lag are aggregated.
#[derive(Debug, Clone)]
pub struct TelemetryWindow {
    size: u32,
    frames: u32,
    elapsed: Duration,
    lag: Duration,
    windows: u64,
}

impl TelemetryWindow {
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            frames: 0,
            elapsed: Duration::ZERO,
            lag: Duration::ZERO,
            windows: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Records one published frame: `interval` since the previous pull and
    /// the `lag` spent waiting on the device. Returns a sample and resets
    /// when the window fills.
    pub fn record(&mut self, interval: Duration, lag: Duration) -> Option<TelemetrySample> {
        self.frames += 1;
        self.elapsed += interval;
        self.lag += lag;
        if self.frames < self.size {
            return None;
        }

        let secs = self.elapsed.as_secs_f64();
        let fps = if secs > 0.0 {
            self.size as f64 / secs
        } else {
            0.0
        };
        let avg_lag_ms = self.lag.as_secs_f64() * 1000.0 / self.size as f64;
        self.windows += 1;
        self.reset();
        Some(TelemetrySample {
            fps,
            avg_lag_ms,
            windows: self.windows,
        })
    }

    pub fn reset(&mut self) {
        self.frames = 0;
        self.elapsed = Duration::ZERO;
        self.lag = Duration::ZERO;
    }
}

impl Default for TelemetryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
