//! OTGW Node - OpenTherm Gateway to MQTT bridge
//!
//! This binary connects an OpenTherm Gateway (serial or TCP) to an MQTT
//! broker:
//! - Gateway telemetry and command confirmations published as topics
//! - Commands received on the subscribe namespace sent to the gateway
//! - Retained `online`/`offline` liveness on the publish namespace

mod mqtt;
mod settings;

use anyhow::{anyhow, Context};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use otgw_bridge::{
    create_interface, GatewayConfig, GatewayInterface, InterfaceConfig, OtgwBridge, OtgwError,
    Watchdog,
};
use settings::Settings;
use tokio::sync::mpsc;

/// Time allowed for the final MQTT messages to leave
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "otgw-node")]
#[command(about = "OpenTherm Gateway to MQTT bridge")]
#[command(after_help = "Serial gateways (the default `otgw.type`) need a build with `--features serial`.")]
struct Args {
    /// Settings file (JSON); `otgw.type` "serial" needs the `serial` feature
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,

    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    #[arg(long, short, default_value = "INFO")]
    loglevel: String,

    /// Log every gateway event
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level: Level = args
        .loglevel
        .parse()
        .map_err(|_| anyhow!("Invalid log level: {}", args.loglevel))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting OTGW Node v{}", otgw_bridge::VERSION);

    let settings = Settings::load(&args.config)?;
    let gateway = settings.gateway_config();
    gateway.validate().context("Invalid gateway settings")?;

    let interface = open_gateway(&gateway)?;
    info!("Gateway interface: {}", interface.name());

    let (client, eventloop) = mqtt::connect(&settings.mqtt);
    info!(
        "MQTT broker: {}:{} (publish: {}, subscribe: {})",
        settings.mqtt.host,
        settings.mqtt.port,
        settings.mqtt.pub_topic_namespace,
        settings.mqtt.sub_topic_namespace
    );

    let watchdog = Watchdog::new(gateway.connection.data_timeout);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let listener = mqtt::listener(event_tx, watchdog.clone(), args.verbose);
    let (bridge, handle) = OtgwBridge::new(interface, &gateway, listener);

    let mut publisher = tokio::spawn(mqtt::run_publisher(
        event_rx,
        client.clone(),
        mqtt::PublishPolicy::new(&settings.mqtt),
        settings.mqtt.qos(),
    ));
    let worker = tokio::spawn(bridge.run());
    let watchdog_task = watchdog.spawn(handle.clone());
    let mut bus_task = tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        settings.mqtt.clone(),
        handle.clone(),
    ));

    shutdown_signal().await;
    handle.shutdown();

    match worker.await {
        Ok(Ok(())) => info!("Gateway bridge stopped"),
        Ok(Err(e)) => error!("Gateway bridge error: {}", e),
        Err(e) => error!("Gateway bridge task failed: {}", e),
    }
    watchdog_task.abort();

    // the worker dropped its listener, so the publisher ends after the backlog
    if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut publisher).await.is_err() {
        warn!("Dropping unpublished gateway events");
        publisher.abort();
    }

    // a clean disconnect suppresses the last will
    let offline = client.publish(
        settings.mqtt.pub_topic_namespace.as_str(),
        settings.mqtt.qos(),
        true,
        "offline",
    );
    match tokio::time::timeout(DISCONNECT_TIMEOUT, offline).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to publish offline state: {}", e),
        Err(_) => warn!("Timed out publishing offline state"),
    }
    if let Err(e) = client.try_disconnect() {
        warn!("MQTT disconnect failed: {}", e);
    }
    if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut bus_task).await.is_err() {
        bus_task.abort();
    }

    Ok(())
}

/// Create the gateway transport, explaining transports missing from this build
fn open_gateway(gateway: &GatewayConfig) -> anyhow::Result<Box<dyn GatewayInterface>> {
    match create_interface(&gateway.interface) {
        Ok(interface) => Ok(interface),
        Err(OtgwError::UnsupportedInterface(_))
            if matches!(gateway.interface, InterfaceConfig::Serial { .. }) =>
        {
            Err(anyhow!(
                "otgw type \"serial\" is not available in this build; \
                 rebuild with `cargo build -p otgw-node --features serial` or use type \"tcp\""
            ))
        }
        Err(e) => Err(e).context("Failed to create gateway interface"),
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
        let args = Args::parse_from(["otgw-node", "-c", "/etc/otgw.json", "-v"]);
        assert_eq!(args.config, PathBuf::from("/etc/otgw.json"));
        assert_eq!(args.loglevel, "INFO");
        assert!(args.verbose);
    }

    #[test]
    fn test_help_mentions_serial_feature() {
        let help = Args::command().render_help().to_string();
        assert!(help.contains("--features serial"));
    }

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_default_serial_gateway_explains_missing_feature() {
        let gateway = Settings::default().gateway_config();
        let err = open_gateway(&gateway).err().unwrap();
        assert!(err.to_string().contains("--features serial"));
    }

    #[test]
    fn test_tcp_gateway_is_created() {
        let settings =
            Settings::from_json(r#"{"otgw": {"type": "tcp", "host": "127.0.0.1"}}"#).unwrap();
        let interface = open_gateway(&settings.gateway_config()).unwrap();
        assert_eq!(interface.name(), "tcp:127.0.0.1:6638");
    }
}
