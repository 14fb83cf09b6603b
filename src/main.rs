use color_eyre::{eyre::eyre, Result};
use geopublisher::location::{SimulatedProvider, StaticPermission};
use geopublisher::mqtt::{RumqttTransport, TransportOptions};
use geopublisher::{PublisherConfig, PublisherController, PublisherState, PublisherStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(PublisherConfig::default_path);
    let config = PublisherConfig::load_or_create(&config_path).await?;

    setup_logging_env(&config.log_level);
    info!("Loaded configuration from {}", config_path.display());

    let controller = PublisherController::new(
        Arc::new(SimulatedProvider::new(config.location.simulated)),
        Arc::new(StaticPermission::granted()),
        Arc::new(RumqttTransport::factory(TransportOptions::from(
            &config.broker,
        ))),
    );

    let mut status_rx = controller.subscribe();
    controller
        .start(config)
        .await
        .map_err(|e| eyre!("Failed to start publisher: {}", e))?;

    let mut last = controller.status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping publisher");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                report(&last, &status);
                if status.state == PublisherState::Idle {
                    warn!("Publisher went idle: {:?}", status.last_error);
                    break;
                }
                last = status;
            }
        }
    }

    controller.stop().await;
    let status = controller.status();
    info!(
        "Session summary: received={}, sent={}, lost={}",
        status.samples_received, status.samples_sent, status.samples_lost
    );
    Ok(())
}

fn report(last: &PublisherStatus, status: &PublisherStatus) {
    if status.connection_state != last.connection_state {
        info!("Broker connection: {:?}", status.connection_state);
    }
    if status.last_error != last.last_error {
        if let Some(err) = &status.last_error {
            warn!("Publisher error: {}", err);
        }
    }
    debug!(
        "received={} sent={} lost={}",
        status.samples_received, status.samples_sent, status.samples_lost
    );
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(default_level: &str) {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let max_level = match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(max_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
