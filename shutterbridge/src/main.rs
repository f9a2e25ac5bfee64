#[macro_use]
extern crate log;

mod bridge;
mod config;
mod dispatcher;
mod errors;
mod estimator;
mod mqtt;
mod sender;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::bridge::{Bridge, Topics};
use crate::dispatcher::Dispatcher;
use crate::sender::SenderAddress;
use crate::store::PositionStore;

pub use crate::errors::{Error, ErrorKind, Result};

const DEFAULT_CONFIG: &str = "config.yaml";
/// How long to wait for the offline messages to reach the broker on the way out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Resolves once the gateway reports that the serial line is gone.
async fn gateway_lost(connected: &mut watch::Receiver<bool>) {
    while *connected.borrow() {
        if connected.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = config::load(&path).map_err(|error| {
        error!("{}", error);
        anyhow!("could not load config from {}", path)
    })?;

    // Nothing may go on the air until every shutter has its own sender offset.
    let offsets = sender::validate_all(&config.shutters).map_err(|error| {
        error!("{}", error);
        anyhow!("invalid configuration in {}", path)
    })?;
    for (shutter, offset) in config.shutters.iter().zip(&offsets) {
        info!(
            "{} ({}): sender offset {}{}",
            shutter.name,
            shutter.device_id,
            offset,
            if shutter.sender_offset.is_some() {
                " (from config)"
            } else {
                ""
            }
        );
    }

    let positions = store::load(&config.position_file)
        .await
        .unwrap_or_else(|error| {
            warn!(
                "could not read {}: {}. Using default positions",
                config.position_file.display(),
                error
            );
            HashMap::new()
        });

    let (gateway, telegrams) = enocean::open_tty(&config.enocean.port)
        .with_context(|| format!("could not open {}", config.enocean.port))?;
    let base = gateway
        .id_base()
        .await
        .context("could not read EnOcean base ID")?;
    info!("gateway base ID {}", base);

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let store = PositionStore::new(config.position_file.clone(), positions.clone());
    let mut dispatcher = Dispatcher::new(gateway.clone(), updates_tx, store);
    for (shutter, offset) in config.shutters.iter().zip(offsets) {
        let address = SenderAddress::new(base, offset);
        info!("{}: sending as {}", shutter.name, address);
        dispatcher.add(
            shutter.clone(),
            address,
            store::initial_position(&positions, shutter),
        );
    }

    let topics = Topics::new(config.mqtt.base_topic.clone());
    let bridge = Arc::new(Bridge::new(topics.clone(), dispatcher, &config.shutters));
    bridge
        .dispatcher()
        .set_available(gateway.is_connected())
        .await?;

    let (client, eventloop) = mqtt::connect(&config.mqtt, &topics);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let connection = mqtt::Connection {
        client: client.clone(),
        eventloop,
        topics: topics.clone(),
        shutters: Arc::new(config.shutters.clone()),
        inbound: inbound_tx,
    };
    let publisher = mqtt::Publisher {
        client: client.clone(),
        topics: topics.clone(),
        updates: updates_rx,
    };

    let connection = tokio::spawn(connection.task());
    tokio::spawn(publisher.task());
    tokio::spawn(mqtt::route_commands(bridge.clone(), inbound_rx));
    tokio::spawn(bridge::route_telegrams(bridge.clone(), telegrams));

    let mut connected = gateway.connected();
    let mut terminate = signal(SignalKind::terminate())?;
    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("terminated, shutting down");
            Ok(())
        }
        _ = gateway_lost(&mut connected) => {
            error!("lost connection to the EnOcean gateway");
            if let Err(error) = bridge.dispatcher().set_available(false).await {
                warn!("could not mark shutters offline: {}", error);
            }
            Err(anyhow!("lost connection to the EnOcean gateway"))
        }
    };

    if let Err(error) = bridge.dispatcher().save_positions().await {
        warn!("could not save positions: {}", error);
    }
    match tokio::time::timeout(
        SHUTDOWN_GRACE,
        mqtt::shutdown(&client, &topics, &config.shutters),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!("could not mark shutters offline: {}", error),
        Err(_) => warn!("MQTT broker did not take the offline messages in time"),
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, connection).await;

    exit
}
