//! mvcap headless capture loop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::WrapErr, Result};
use mvcap::pipeline::WorkerEvent;
use mvcap::{session, utils, Config};
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mvcap=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("mvcap launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref()).wrap_err("failed to load configuration")?;
    mvcap::CONFIG.store(Arc::new(config.clone()));

    let device = utils::open_backend(&config)?;
    info!("Cameras: {:?}", session::list_cameras(device.as_ref())?);

    let Config {
        camera,
        pipeline,
        features,
        ..
    } = config;
    let display_fps = pipeline.display_fps.max(1);
    let mut session = tokio::task::spawn_blocking(move || {
        session::start_capture(device, &camera, &features, &pipeline)
    })
    .await?
    .wrap_err("failed to start capture")?;

    for outcome in session.outcomes().iter().filter(|o| o.is_warning()) {
        warn!("Camera setting not applied: {outcome}");
    }
    info!("Capturing from {}", session.serial());

    let events = session.events();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / display_fps as f64));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut generation = 0;
    let mut shown = 0u64;
    let mut last_report = Instant::now();
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
            event = events.recv_async() => match event {
                Ok(WorkerEvent::Faulted(err)) => {
                    error!("Capture failed: {err}");
                    break;
                }
                Ok(event) => debug!(?event, "worker event"),
                Err(_) => break,
            },
            _ = ticker.tick() => {
                if let Some(snapshot) = session.read_frame_newer_than(generation) {
                    generation = snapshot.generation;
                    shown += 1;
                    metrics::histogram!("mvcap_display_age_seconds")
                        .record(snapshot.frame.age().as_secs_f64());
                }
                if last_report.elapsed() >= REPORT_INTERVAL {
                    let telemetry = session.read_telemetry();
                    let counters = session.counters();
                    info!(
                        "fps: {:.1}, lag: {:.2}ms, shown: {shown}, published: {}, incomplete: {}",
                        telemetry.fps,
                        telemetry.avg_lag_ms,
                        counters.published,
                        counters.incomplete,
                    );
                    last_report = Instant::now();
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || session.stop_capture())
        .await?
        .wrap_err("failed to stop capture")?;

    info!("mvcap shutting down");
    Ok(())
}
