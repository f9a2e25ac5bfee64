//! MQTT side of the bridge: one task polls the rumqttc event loop, one routes inbound commands
//! to the bridge and one publishes shutter updates.
//!
//! Shutter tasks never wait on the broker. While it is unreachable the publisher keeps taking
//! updates and only the latest payload per topic is kept.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish,
    QoS,
};
use serde_json::json;
use tokio::sync::mpsc;

use crate::bridge::{Bridge, Topics, OFFLINE, ONLINE};
use crate::config::{MqttConfig, ShutterConfig};
use crate::dispatcher::{ShutterUpdate, Update};
use crate::Result;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

pub fn connect(config: &MqttConfig, topics: &Topics) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    options.set_last_will(LastWill::new(
        topics.bridge_available(),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    info!("connecting to MQTT broker at {}:{}", config.host, config.port);
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Home Assistant discovery payload for one shutter.
pub fn discovery_config(topics: &Topics, shutter: &ShutterConfig) -> serde_json::Value {
    let id = shutter.device_id;
    let unique_id = format!("enocean_cover_{}", shutter.topic_id());

    json!({
        "name": shutter.name,
        "unique_id": unique_id,
        "device_class": "shutter",
        "command_topic": topics.set(id),
        "set_position_topic": topics.set_position(id),
        "state_topic": topics.state(id),
        "position_topic": topics.position(id),
        "availability": [
            { "topic": topics.available(id) },
            { "topic": topics.bridge_available() },
        ],
        "availability_mode": "all",
        "payload_available": ONLINE,
        "payload_not_available": OFFLINE,
        "payload_open": "OPEN",
        "payload_close": "CLOSE",
        "payload_stop": "STOP",
        "state_open": "open",
        "state_closed": "closed",
        "state_opening": "opening",
        "state_closing": "closing",
        "position_open": 100,
        "position_closed": 0,
        "qos": 1,
        "device": {
            "identifiers": [format!("enocean_{}", shutter.topic_id())],
            "name": format!("{} Shutter", shutter.name),
            "manufacturer": "Eltako",
            "model": "FSB61NP-230V",
        },
    })
}

/// Topic and retained payload for an update.
pub fn update_message(topics: &Topics, update: &ShutterUpdate) -> (String, String) {
    let id = update.device_id;
    match update.update {
        Update::State(state) => (topics.state(id), state.as_str().to_string()),
        Update::Position(position) => (topics.position(id), position.to_string()),
        Update::Availability(available) => (
            topics.available(id),
            if available { ONLINE } else { OFFLINE }.to_string(),
        ),
    }
}

/// Subscribes to the command topics and announces the shutters. Runs after every (re)connect,
/// off the event loop so the requests can be queued.
async fn announce(client: AsyncClient, topics: Topics, shutters: Arc<Vec<ShutterConfig>>) -> Result<()> {
    for shutter in shutters.iter() {
        for topic in topics.commands(shutter.device_id).iter() {
            client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
        }

        let config = discovery_config(&topics, shutter);
        client
            .publish(
                topics.discovery(shutter.device_id),
                QoS::AtLeastOnce,
                true,
                config.to_string(),
            )
            .await?;
        info!("published discovery for {} ({})", shutter.name, shutter.topic_id());
    }

    client
        .publish(topics.bridge_available(), QoS::AtLeastOnce, true, ONLINE)
        .await?;
    Ok(())
}

/// Polls the connection. Inbound publishes are handed to the router task so a busy shutter never
/// stalls the connection.
pub struct Connection {
    pub client: AsyncClient,
    pub eventloop: EventLoop,
    pub topics: Topics,
    pub shutters: Arc<Vec<ShutterConfig>>,
    pub inbound: mpsc::UnboundedSender<Publish>,
}

impl Connection {
    /// Returns once a disconnect has been sent.
    pub async fn task(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    let client = self.client.clone();
                    let topics = self.topics.clone();
                    let shutters = self.shutters.clone();
                    tokio::spawn(async move {
                        if let Err(error) = announce(client, topics, shutters).await {
                            warn!("mqtt: could not announce shutters: {}", error);
                        }
                    });
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if self.inbound.send(publish).is_err() {
                        warn!("mqtt: command router is gone");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("mqtt: disconnected");
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        "mqtt: {}, reconnecting in {}s",
                        error,
                        RECONNECT_DELAY.as_secs()
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Feeds inbound MQTT messages to the bridge in arrival order.
pub async fn route_commands(bridge: Arc<Bridge>, mut inbound: mpsc::UnboundedReceiver<Publish>) {
    while let Some(publish) = inbound.recv().await {
        bridge.handle_message(&publish.topic, &publish.payload).await;
    }
}

/// Retained messages waiting to be handed to the client, oldest first. A newer payload for a
/// queued topic replaces the old one in place.
#[derive(Debug, Default)]
struct Backlog {
    messages: Vec<(String, String)>,
}

impl Backlog {
    fn push(&mut self, topic: String, payload: String) {
        match self.messages.iter_mut().find(|(queued, _)| *queued == topic) {
            Some(message) => message.1 = payload,
            None => self.messages.push((topic, payload)),
        }
    }

    fn front(&self) -> Option<(String, String)> {
        self.messages.first().cloned()
    }

    /// Forgets a message once it has gone out, unless it was replaced in the meantime.
    fn published(&mut self, topic: &str, payload: &str) {
        if let Some(index) = self
            .messages
            .iter()
            .position(|(queued, queued_payload)| queued == topic && queued_payload == payload)
        {
            self.messages.remove(index);
        }
    }

    fn len(&self) -> usize {
        self.messages.len()
    }
}

type Published = ((String, String), std::result::Result<(), ClientError>);

async fn publish_retained(client: &AsyncClient, message: Option<(String, String)>) -> Option<Published> {
    let (topic, payload) = message?;
    debug!("mqtt: publishing {} = {}", topic, payload);
    let result = client
        .publish(topic.as_str(), QoS::AtLeastOnce, true, payload.as_str())
        .await;
    Some(((topic, payload), result))
}

pub struct Publisher {
    pub client: AsyncClient,
    pub topics: Topics,
    pub updates: mpsc::UnboundedReceiver<ShutterUpdate>,
}

impl Publisher {
    pub async fn task(self) {
        let Publisher {
            client,
            topics,
            mut updates,
        } = self;
        let mut backlog = Backlog::default();

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => {
                        let (topic, payload) = update_message(&topics, &update);
                        backlog.push(topic, payload);
                    }
                    None => break,
                },
                Some(((topic, payload), result)) = publish_retained(&client, backlog.front()) => {
                    if let Err(error) = result {
                        warn!("mqtt: could not publish {}: {}", topic, error);
                    }
                    backlog.published(&topic, &payload);
                }
            }
        }

        debug!("mqtt: publisher exiting with {} unsent", backlog.len());
    }
}

/// Marks every shutter and the bridge offline, then disconnects.
pub async fn shutdown(client: &AsyncClient, topics: &Topics, shutters: &[ShutterConfig]) -> Result<()> {
    for shutter in shutters {
        client
            .publish(
                topics.available(shutter.device_id),
                QoS::AtLeastOnce,
                true,
                OFFLINE,
            )
            .await?;
    }
    client
        .publish(topics.bridge_available(), QoS::AtLeastOnce, true, OFFLINE)
        .await?;
    client.disconnect().await?;
    Ok(())
}
