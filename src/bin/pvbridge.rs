use clap::{App, Arg};
use pvbridge::config::{BridgeConfig, DEFAULT_CONFIG_FILE};
use pvbridge::service::{register_service, service_name};
use pvbridge::{logging, BridgeRuntime, BusServer, FeedConnection, FeedSubscriber, FrameQueue, LocalBus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("pvbridge")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Energy Systems Engineering Team")
        .about("Publishes MQTT inverter telemetry as a PV inverter service on the bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: config.toml next to the executable)")
                .takes_value(true),
        )
        .get_matches();

    let config_path = matches
        .value_of("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = match BridgeConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pvbridge: {}", e);
            return Err(e.into());
        }
    };

    let log_dir = config.logging.directory_for(&config_path);
    let _log_guard = logging::init(&log_dir, &config.logging.level)?;
    info!("Start");

    if let Err(e) = run(config).await {
        error!(severity = "critical", "Error in main: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let queue = Arc::new(FrameQueue::new());

    let mut bus = LocalBus::new(service_name(config.device.instance));
    register_service(&mut bus, &config.device)?;

    let subscriber = FeedSubscriber::new(Arc::clone(&queue), config.broker.topic_suffix.clone());
    let feed_stats = subscriber.stats_handle();

    let client_id = config.broker.client_id(config.device.instance);
    info!("connecting to broker {}:{} as {}", config.broker.host, config.broker.port, client_id);
    let connection = FeedConnection::connect(&config.broker, client_id).await?;

    let (runtime, handle) = BridgeRuntime::new(bus, queue, &config.bridge, feed_stats)?;

    let feed_task = tokio::spawn(async move {
        match connection.run(subscriber).await {
            Ok(()) => info!("broker feed ended"),
            Err(e) => error!("broker feed stopped: {}", e),
        }
    });

    let server_task = if config.bus.enabled {
        let server = BusServer::bind(&config.bus.listen, handle.clone()).await?;
        Some(tokio::spawn(server.serve()))
    } else {
        None
    };

    info!("Connected to bus, and switching over to the main loop. (Ctrl+C to abort)");
    runtime.run(shutdown_signal()).await;

    feed_task.abort();
    if let Some(server_task) = server_task {
        server_task.abort();
    }
    drop(handle);

    info!("pvbridge stopped");
    Ok(())
}

fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
