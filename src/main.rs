//! mqttlink command-line entry point

use clap::{Parser, Subcommand};
use mqttlink::client::{AckMode, ClientEvent, MqttClient};
use mqttlink::config::MqttLinkConfig;
use mqttlink::engine::RumqttcEngineFactory;
use mqttlink::message::{ConnectionHandle, MqttMessage, QoS};
use mqttlink::network::TcpProbe;
use mqttlink::observability::{health::HealthServer, init_default_logging};
use mqttlink::ping::NoopWakeLock;
use mqttlink::service::MqttService;
use mqttlink::store::{MessageStore, SqliteMessageStore};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// How long `publish` waits for the broker to complete the QoS flow
const DELIVERY_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "mqttlink")]
#[command(about = "MQTT connection manager with durable inbound buffering")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and stream arrived messages until interrupted
    Run,
    /// Publish one message and wait for delivery
    Publish {
        topic: String,
        payload: String,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// List buffered, unacknowledged messages
    Backlog {
        /// Include every connection, not just the configured one
        #[arg(long)]
        all: bool,
    },
    /// Delete buffered messages
    Purge {
        #[arg(long)]
        all: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Publish {
            topic,
            payload,
            qos,
            retain,
        } => publish(config, topic, payload, qos, retain).await,
        Commands::Backlog { all } => backlog(config, all),
        Commands::Purge { all } => purge(config, all),
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<MqttLinkConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => MqttLinkConfig::find_default_path().ok_or(
            "No configuration file found. Provide one with -c/--config or create mqttlink.toml",
        )?,
    };
    info!("Loading configuration from: {}", path.display());
    Ok(MqttLinkConfig::load_from_file(&path)?)
}

fn configured_handle(config: &MqttLinkConfig) -> ConnectionHandle {
    ConnectionHandle::new(
        &config.connection.broker_url,
        &config.connection.client_id,
        &config.service.app_id,
    )
}

fn open_service(config: &MqttLinkConfig) -> Result<Arc<MqttService>, Box<dyn std::error::Error>> {
    let store = SqliteMessageStore::open(&config.service.store_path)?;
    Ok(Arc::new(MqttService::new(
        Arc::new(store),
        Arc::new(RumqttcEngineFactory),
        Arc::new(NoopWakeLock),
    )))
}

async fn open_client(
    config: &MqttLinkConfig,
    service: Arc<MqttService>,
    ack_mode: AckMode,
) -> Result<(MqttClient, tokio::sync::mpsc::UnboundedReceiver<ClientEvent>), Box<dyn std::error::Error>>
{
    let (client, events) = MqttClient::new(
        service,
        &config.connection.broker_url,
        &config.connection.client_id,
        &config.service.app_id,
        ack_mode,
    )
    .await?;
    client.connect(config.connect_options()?).await?;
    Ok((client, events))
}

async fn run(config: MqttLinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let service = open_service(&config)?;

    if let Some(port) = config.service.health_port {
        let health_server = Arc::new(HealthServer::new(
            config.service.app_id.clone(),
            port,
            service.clone(),
        ));
        tokio::spawn(health_server.start());
    }

    if let Some((interval, probe_timeout)) = config.probe_settings() {
        let probe = TcpProbe::for_broker(&config.connection.broker_url, interval, probe_timeout)?;
        let reporter = service.clone();
        probe.spawn(move |reachability| reporter.set_reachability(reachability));
    }

    let ack_mode = config.connection.ack_mode;
    let (client, mut events) = open_client(&config, service.clone(), ack_mode).await?;
    let filters = config.subscription_filters()?;
    if !filters.is_empty() {
        client.subscribe(filters).await?;
    }
    info!(handle = %client.handle(), "Connected, streaming messages");

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Some(ClientEvent::MessageArrived { id, topic, message }) => {
                    println!("{topic} {}", message.payload_str());
                    if ack_mode == AckMode::Manual {
                        client.acknowledge(&id).await?;
                    }
                }
                Some(ClientEvent::ConnectionLost { cause }) => {
                    warn!("Connection lost: {}", cause);
                }
                Some(ClientEvent::ConnectComplete { reconnect, server_uri }) => {
                    info!(reconnect, "Connected to {}", server_uri);
                }
                Some(ClientEvent::DeliveryComplete { .. }) => {}
                None => break,
            }
        }
    }

    if let Err(e) = client.disconnect(None).await {
        warn!("Disconnect failed: {}", e);
    }
    service.shutdown().await;
    Ok(())
}

async fn publish(
    config: MqttLinkConfig,
    topic: String,
    payload: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::from_u8(qos).ok_or("qos must be 0, 1 or 2")?;
    let service = open_service(&config)?;
    let (client, mut events) = open_client(&config, service.clone(), AckMode::Auto).await?;

    client
        .publish(topic.clone(), MqttMessage::new(payload, qos).retained(retain))
        .await?;

    let delivered = timeout(DELIVERY_WAIT, async {
        while let Some(event) = events.recv().await {
            if matches!(&event, ClientEvent::DeliveryComplete { topic: t, .. } if *t == topic) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if delivered {
        info!(topic = %topic, "Message delivered");
    } else {
        warn!(topic = %topic, "No delivery confirmation within {:?}", DELIVERY_WAIT);
    }

    client.disconnect(Some(Duration::from_secs(1))).await?;
    service.shutdown().await;
    Ok(())
}

fn backlog(config: MqttLinkConfig, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteMessageStore::open(&config.service.store_path)?;
    let handle = configured_handle(&config);
    let messages = store.all_arrived((!all).then_some(&handle))?;

    for stored in &messages {
        println!(
            "{} {} [{}] {} {}",
            stored.arrived_at.to_rfc3339(),
            stored.id,
            stored.handle,
            stored.topic,
            stored.message.payload_str()
        );
    }
    info!(count = messages.len(), "Buffered messages listed");
    Ok(())
}

fn purge(config: MqttLinkConfig, all: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteMessageStore::open(&config.service.store_path)?;
    let handle = configured_handle(&config);
    let removed = store.clear((!all).then_some(&handle))?;
    info!(removed, "Buffered messages purged");
    Ok(())
}

fn handle_config_command(
    config: MqttLinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
