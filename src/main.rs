// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use local_device_bridge::directory::StateRead;
use local_device_bridge::{
    ChannelQueue, ChannelRecord, Connector, ConnectorConfig, ConnectorMessage, DataPointValue,
    DeviceRecord, Directory, InMemoryDirectory, InMemoryStateStore, PropertyRecord,
    PropertyWriter, ProtocolVersion, StateStore, StateUpdate, WriterConfig, WriterMode, discover,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "device2mqtt")]
#[command(about = "Bridge between local LAN devices and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Listen for device broadcasts for this many seconds, print them and exit
    #[arg(long, value_name = "SECS")]
    discover: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    mqtt: MqttToml,
    #[serde(default)]
    connector: ConnectorToml,
    #[serde(default)]
    writer: WriterToml,
    #[serde(default)]
    devices: Vec<DeviceToml>,
}

#[derive(Debug, Deserialize)]
struct ConnectorToml {
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    heartbeat_timeout_ms: u64,
}

impl Default for ConnectorToml {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            request_timeout_ms: default_request_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

fn default_reconnect_delay() -> u64 {
    10000
}
fn default_request_timeout() -> u64 {
    5000
}
fn default_heartbeat_interval() -> u64 {
    7000
}
fn default_heartbeat_timeout() -> u64 {
    10000
}

#[derive(Debug, Default, Deserialize)]
struct WriterToml {
    #[serde(default)]
    mode: WriterMode,
    /// Overrides the mode's default debounce window
    #[serde(default)]
    debounce_ms: Option<u64>,
    #[serde(default)]
    pending_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceToml {
    id: String,
    identifier: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
    #[serde(default = "default_device_port")]
    port: u16,
    #[serde(default)]
    local_key: Option<String>,
    #[serde(default)]
    protocol_version: ProtocolVersion,
    #[serde(default)]
    gateway_id: Option<String>,
    #[serde(default)]
    properties: Vec<PropertyToml>,
}

fn default_device_port() -> u16 {
    local_device_bridge::constants::DEFAULT_DEVICE_PORT
}

#[derive(Debug, Deserialize)]
struct PropertyToml {
    id: String,
    /// Data point key
    identifier: String,
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default)]
    settable: bool,
    #[serde(default = "default_true")]
    queryable: bool,
    #[serde(default)]
    name: Option<String>,
}

fn default_channel() -> String {
    "main".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_client_id() -> String {
    "device-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "devices/cmd".to_string()
}
fn default_publish_topic() -> String {
    "devices".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

fn build_connector_config(toml: &ConnectorToml) -> ConnectorConfig {
    ConnectorConfig {
        reconnect_delay: Duration::from_millis(toml.reconnect_delay_ms),
        request_timeout: Duration::from_millis(toml.request_timeout_ms),
        heartbeat_interval: Duration::from_millis(toml.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(toml.heartbeat_timeout_ms),
        ..ConnectorConfig::default()
    }
}

fn build_writer_config(toml: &WriterToml) -> WriterConfig {
    let mut config = WriterConfig::for_mode(toml.mode);
    if let Some(ms) = toml.debounce_ms {
        config.debounce = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.pending_timeout_ms {
        config.pending_timeout = Duration::from_millis(ms);
    }
    config
}

/// Fill a directory from the `[[devices]]` tables.
///
/// Channels are implied by the properties: one per distinct channel name,
/// with id `<device>/<channel>`.
fn build_directory(devices: &[DeviceToml]) -> Result<InMemoryDirectory> {
    let directory = InMemoryDirectory::new();
    let mut seen_properties = BTreeSet::new();

    for device in devices {
        anyhow::ensure!(
            directory.find_device(&device.id).is_none(),
            "Duplicate device id: {}",
            device.id
        );
        directory.insert_device(DeviceRecord {
            id: device.id.clone(),
            identifier: device.identifier.clone(),
            name: device.name.clone(),
            ip_address: device.ip_address.clone(),
            port: device.port,
            local_key: device.local_key.clone(),
            protocol_version: device.protocol_version,
            gateway_id: device.gateway_id.clone(),
        });

        for property in &device.properties {
            anyhow::ensure!(
                seen_properties.insert(property.id.clone()),
                "Duplicate property id: {}",
                property.id
            );
            let channel_id = format!("{}/{}", device.id, property.channel);
            if directory.find_channel(&channel_id).is_none() {
                directory.insert_channel(ChannelRecord {
                    id: channel_id.clone(),
                    device: device.id.clone(),
                    identifier: property.channel.clone(),
                    name: None,
                });
            }
            directory.insert_property(PropertyRecord {
                id: property.id.clone(),
                device: device.id.clone(),
                channel: channel_id,
                identifier: property.identifier.clone(),
                settable: property.settable,
                queryable: property.queryable,
                name: property.name.clone(),
            });
        }
    }
    Ok(directory)
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages share the flat {now, op, ...} structure
#[derive(Serialize)]
struct MqttMessage<'a> {
    now: u64,
    #[serde(flatten)]
    message: &'a ConnectorMessage,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    #[allow(dead_code)]
    op_id: Option<String>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    value: Option<DataPointValue>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_message(client: &AsyncClient, topic: &str, message: &ConnectorMessage) {
    // Property and connection states are retained so late subscribers see the latest value
    let retain = !matches!(message, ConnectorMessage::WriteFailed { .. });
    let msg = MqttMessage {
        now: now_epoch_ms(),
        message,
    };
    publish_json(client, topic, &msg, retain).await;
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    outcome: std::result::Result<Option<serde_json::Value>, String>,
    src: Option<serde_json::Value>,
) {
    let (success, data, error) = match outcome {
        Ok(data) => (true, data, None),
        Err(e) => (false, None, Some(e)),
    };
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
        error,
    };
    publish_json(client, topic, &msg, false).await;
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

/// Everything a command needs to act on the bridge.
#[derive(Clone)]
struct Bridge {
    directory: Arc<InMemoryDirectory>,
    states: Arc<InMemoryStateStore>,
    connector: Connector,
    writer: PropertyWriter<Connector>,
}

impl Bridge {
    /// Record a new expected value and hand it to the writer.
    fn set_expected(&self, property_id: &str, value: DataPointValue) -> std::result::Result<(), String> {
        let property = self
            .directory
            .find_property(property_id)
            .ok_or_else(|| format!("unknown property {property_id}"))?;
        if !property.settable {
            return Err(format!("property {property_id} is not settable"));
        }
        self.states
            .set(&property, StateUpdate::new().expected(Some(value)));
        self.writer.notify(property_id);
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        let mut properties = Vec::new();
        for device in self.directory.devices() {
            for property in self.directory.find_properties_for_device(&device.id) {
                let StateRead::Ready(state) = self.states.read(&property) else {
                    continue;
                };
                let msg = ConnectorMessage::property_state(&property, &state);
                if let Ok(value) = serde_json::to_value(&msg) {
                    properties.push(value);
                }
            }
        }
        serde_json::Value::Array(properties)
    }
}

async fn handle_command(
    payload_str: &str,
    cmd: MqttCommand,
    client: &AsyncClient,
    topic: &str,
    bridge: &Bridge,
) {
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    let outcome = match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            Ok(None)
        }

        "SNAPSHOT" => {
            debug!("Command: SNAPSHOT");
            Ok(Some(bridge.snapshot()))
        }

        "SET" => match (cmd.property, cmd.value) {
            (Some(property), Some(value)) => {
                info!("Command: SET {property} = {value}");
                bridge.set_expected(&property, value).map(|_| None)
            }
            _ => {
                warn!("SET: missing property or value");
                Err("SET requires property and value".to_string())
            }
        },

        "READ" => match cmd.device {
            Some(device) => {
                info!("Command: READ {device}");
                bridge
                    .connector
                    .refresh(&device)
                    .await
                    .map(|_| None)
                    .map_err(|e| e.to_string())
            }
            None => {
                warn!("READ: missing device");
                Err("READ requires device".to_string())
            }
        },

        other => {
            warn!("Unknown command: {other}");
            Err(format!("unknown command {other}"))
        }
    };

    if let Err(e) = &outcome {
        warn!("Command {} failed: {e}", cmd.op);
    }
    publish_cmd_ack(client, topic, outcome, src_json).await;
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn run_discovery(secs: u64) -> Result<()> {
    info!("Listening for device broadcasts for {secs}s...");
    let devices = discover(Duration::from_secs(secs))
        .await
        .context("Discovery failed")?;
    if devices.is_empty() {
        println!("No devices found");
    }
    for d in devices {
        println!(
            "{}  ip={}  version={}  encrypted={}  product_key={}",
            d.gateway_id,
            d.ip_address,
            d.protocol_version.map(|v| v.tag()).unwrap_or("?"),
            d.encrypted,
            d.product_key.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=local_device_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    if let Some(secs) = cli.discover {
        return run_discovery(secs).await;
    }

    let mut config = load_config(&cli.config)?;
    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let mut directory = Arc::new(build_directory(&config.devices)?);

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let states = Arc::new(InMemoryStateStore::new());
        let (queue, mut queue_rx) = ChannelQueue::new();
        let queue = Arc::new(queue);

        let connector = Connector::new(
            build_connector_config(&config.connector),
            directory.clone(),
            states.clone(),
            queue.clone(),
        );
        let writer = PropertyWriter::new(
            build_writer_config(&config.writer),
            directory.clone(),
            states.clone(),
            queue,
            Arc::new(connector.clone()),
        );
        let bridge = Bridge {
            directory: directory.clone(),
            states,
            connector: connector.clone(),
            writer: writer.clone(),
        };

        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        client
            .subscribe(&config.mqtt.subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {}", config.mqtt.subscribe_topic);

        // Task 1: connector messages -> MQTT
        let client_out = client.clone();
        let topic_out = config.mqtt.publish_topic.clone();
        let publish_handle = tokio::spawn(async move {
            while let Some(message) = queue_rx.recv().await {
                publish_message(&client_out, &topic_out, &message).await;
            }
            debug!("Message queue closed");
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
        let client_cmds = client.clone();
        let sub_topic = config.mqtt.subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = client_cmds.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                            if cmd_tx.send(payload).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: command execution, kept off the event loop so a slow
        // device never stalls MQTT keep-alives
        let client_exec = client.clone();
        let topic_exec = config.mqtt.publish_topic.clone();
        let bridge_exec = bridge.clone();
        let command_handle = tokio::spawn(async move {
            while let Some(payload) = cmd_rx.recv().await {
                match serde_json::from_str::<MqttCommand>(&payload) {
                    Ok(cmd) => {
                        if cmd.op == "SNAPSHOT" {
                            debug!("MQTT command received: {payload}");
                        } else {
                            info!("MQTT command received: {payload}");
                        }
                        handle_command(&payload, cmd, &client_exec, &topic_exec, &bridge_exec)
                            .await;
                    }
                    Err(e) => warn!("Failed to parse MQTT command: {e}"),
                }
            }
        });

        connector.start();
        writer.start();

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        writer.stop();
        connector.stop().await;

        mqtt_handle.abort();
        command_handle.abort();
        publish_handle.abort();
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok(new_config) => match (
                parse_mqtt_url(&new_config.mqtt.url),
                build_directory(&new_config.devices),
            ) {
                (Ok((new_host, new_port)), Ok(new_directory)) => {
                    mqtt_host = new_host;
                    mqtt_port = new_port;
                    directory = Arc::new(new_directory);
                    config = new_config;
                    info!("Config reloaded successfully");
                }
                (Err(e), _) => warn!("Invalid MQTT URL in new config, keeping previous: {e}"),
                (_, Err(e)) => warn!("Invalid devices in new config, keeping previous: {e}"),
            },
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        info!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
