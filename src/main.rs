//! Sample Forwarder - device-side buffering and forwarding service
//!
//! This binary feeds simulated sensor samples into the pipeline, which
//! buffers them in a quota-bounded store and forwards them in archives to the
//! configured endpoint.
//!
//! ## Configuration
//!
//! Configuration is loaded from `SAMPLE_FORWARDER_*` environment variables
//! (see `Config::from_env`), plus:
//!
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sample_forwarder::config::Config;
use sample_forwarder::connection::ManualConnectivity;
use sample_forwarder::pipeline::Pipeline;
use sample_forwarder::simulator::{SampleSimulator, SimulatorConfig};

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Sample Forwarder...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                device_id = %config.device_id,
                store_dir = %config.store_dir.display(),
                quota_bytes = config.quota.max_bytes,
                endpoint = %config.transport.endpoint_url,
                min_batch_size = config.transport.min_batch_size,
                max_batch_size = config.transport.max_batch_size,
                simulation_interval_ms = config.simulation_interval.as_millis() as u64,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let pipeline = match Pipeline::new(&config, Arc::new(ManualConnectivity::default())) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!(error = %e, "Failed to assemble pipeline");
            std::process::exit(1);
        }
    };

    let mut events = pipeline.subscribe();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                info!(event = %json, "Pipeline event");
            }
        }
    });

    pipeline.resume().await;

    let simulator = SampleSimulator::new(SimulatorConfig {
        raw_dir: Some(config.store_dir.join("raw")),
        ..SimulatorConfig::default()
    });
    let generation_interval = config.simulation_interval;

    let generator_pipeline = pipeline.clone();
    let generator_handle = tokio::spawn(async move {
        info!("Simulator started");
        run_simulator(simulator, generator_pipeline, generation_interval).await;
    });

    info!("Sample Forwarder running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    generator_handle.abort();

    let status = pipeline.status();
    info!(
        records = status.record_count,
        saved = status.saved_record_count,
        transmitted = status.transmitted_record_count,
        queued = status.queued,
        "Initiating graceful shutdown..."
    );
    let (ingestion, transmission) = pipeline.pause().await;
    info!(?ingestion, ?transmission, "Workers stopped");

    events_handle.abort();
    info!("Sample Forwarder stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Submit simulated samples at a fixed pace until aborted.
async fn run_simulator(simulator: SampleSimulator, pipeline: Arc<Pipeline>, period: Duration) {
    let mut ticker = interval(period);
    let mut generated: u64 = 0;
    let mut rejected: u64 = 0;
    let mut last_report_time = std::time::Instant::now();
    let report_interval = Duration::from_secs(30);

    loop {
        ticker.tick().await;

        let sample = match simulator.generate() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Failed to simulate sample");
                continue;
            }
        };

        match pipeline.submit(sample) {
            Ok(()) => generated += 1,
            Err(e) => {
                rejected += 1;
                if rejected % 1_000 == 1 {
                    warn!(error = %e, rejected, "Sample rejected by pipeline");
                }
            }
        }

        if last_report_time.elapsed() >= report_interval {
            info!(
                generated,
                rejected,
                rate = format!("{:.1}/s", generated as f64 / last_report_time.elapsed().as_secs_f64()),
                records = pipeline.record_count(),
                "Simulator progress"
            );
            generated = 0;
            rejected = 0;
            last_report_time = std::time::Instant::now();
        }
    }
}
