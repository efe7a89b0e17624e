pub mod internal_commands;
pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::models::{Account, Meter};
use crate::mqtt::ha_interface::{account_state_topic, meter_state_topic, HaDiscover};
use crate::services::events::{ServiceEvent, NOTIFICATION_TOPIC};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{Receiver, Sender};
use serde::{Serialize, Deserialize};
use serde_json;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};

pub const TOPIC_PREFIX: &str = "pik_comfort";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Error(String),
}

#[derive(Clone, Debug)]
pub struct MqttHealthStatus {
    pub status: MqttConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_message_sent: Option<Instant>,
    pub last_message_received: Option<Instant>,
    pub connection_attempts: u64,
}

#[derive(Clone, Debug)]
pub struct AppStatus {
    pub start_time: Instant,
    pub mqtt_health: MqttHealthStatus,
}

impl MqttHealthStatus {
    pub fn new() -> Self {
        Self {
            status: MqttConnectionStatus::Disconnected,
            last_connected: None,
            last_message_sent: None,
            last_message_received: None,
            connection_attempts: 0,
        }
    }
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_health: MqttHealthStatus::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// `topic` is relative to `pik_comfort/`
#[derive(Debug)]
pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

#[derive(Debug)]
pub enum Transmission {
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData),
    Event(ServiceEvent),
}

fn qos_from(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Messages an event turns into: the event itself and its notification, if any
pub fn event_messages(event: &ServiceEvent) -> Vec<PublishData> {
    let mut messages = Vec::new();
    match serde_json::to_string(&event.data) {
        Ok(payload) => messages.push(PublishData { topic: event.topic(), payload, qos: 1, retain: false }),
        Err(e) => error!("Unable to serialize event {}: {e}", event.event_type),
    }

    if let Some(notification) = &event.notification {
        match serde_json::to_string(notification) {
            Ok(payload) => messages.push(PublishData { topic: NOTIFICATION_TOPIC.to_string(), payload, qos: 1, retain: false }),
            Err(e) => error!("Unable to serialize notification {}: {e}", notification.notification_id),
        }
    }
    return messages;
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding a callback to topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    pub async fn send(&self, topic: String, payload: String) {
        let Some(v) = self.calls.get(&topic) else {
            debug!("Send for unknown topic {topic}");
            return;
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            if let Err(e) = call.send(payload.clone()).await {
                warn!("Callback for {topic} is gone: {e}");
            }
        }
    }

    pub async fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

async fn set_mqtt_status(status: MqttConnectionStatus) {
    let mut app_status = APP_STATUS.write().await;
    match status {
        MqttConnectionStatus::Connected => {
            app_status.mqtt_health.last_connected = Some(Instant::now());
        },
        MqttConnectionStatus::Reconnecting => {
            app_status.mqtt_health.connection_attempts += 1;
        },
        _ => {},
    }
    app_status.mqtt_health.status = status;
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new thread to handle the incomming commands
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = match String::from_utf8(p.payload.to_vec()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("Dropping non UTF-8 message on {topic}: {e}");
                                continue;
                            }
                        };
                        debug!("Received MQTT message on {topic}: {payload:?}");
                        APP_STATUS.write().await.mqtt_health.last_message_received = Some(Instant::now());

                        let callback = CALLBACKS.read().await;
                        callback.send(topic.clone(), payload.clone()).await;
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");
                        set_mqtt_status(MqttConnectionStatus::Connected).await;

                        /* We are connected resubstribe to everything */
                        let callbacks = CALLBACKS.read().await.get_topics().await;
                        for callback in callbacks {
                            /* Move the resubscription to it's own thread */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(callback.clone(), QoS::AtLeastOnce).await {
                                    error!("Resubscribing {callback} failed: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        set_mqtt_status(MqttConnectionStatus::Error(e.to_string())).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        set_mqtt_status(MqttConnectionStatus::Reconnecting).await;
                    }
                }
            }
        });

        return (MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx);
    }

    async fn publish(&self, data: PublishData) {
        match self.client.publish(data.topic.clone(), qos_from(data.qos), data.retain, data.payload).await {
            Err(e) => { error!("Error publishing to {}: {}", data.topic, e); },
            Ok(_) => {
                debug!("Published to {} successfully", data.topic);
                APP_STATUS.write().await.mqtt_health.last_message_sent = Some(Instant::now());
            }
        }
    }

    /// Forwards every transmission to the broker, events are also mirrored to `broadcast`
    pub async fn start_thread(&mut self, broadcast: tokio::sync::broadcast::Sender<String>) {
        while !self.exit_thread {
            let Some(transmission) = self.rx.recv().await else {
                debug!("Reading returned none, we exit now");
                self.exit_thread = true;
                continue;
            };

            match transmission {
                Transmission::AutoDiscovery(disc) => {
                    match serde_json::to_string(&disc) {
                        Ok(payload) => {
                            self.publish(PublishData { topic: disc.discover_topic.clone(), payload, qos: 1, retain: true }).await;
                        },
                        Err(e) => error!("Unable to serialize discovery for {}: {e}", disc.get_dev_id()),
                    }
                },
                Transmission::Subscribe(subscribe_data) => {
                    let topic = format!("{TOPIC_PREFIX}/{}", subscribe_data.topic);
                    match self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                        Ok(_) => {
                            CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                            info!("Registered Callback {topic}");
                        },
                        Err(e) => error!("Subscribing to {topic} failed: {e}"),
                    }
                },
                Transmission::Publish(publish_data) => {
                    self.publish(publish_data).await;
                },
                Transmission::Event(event) => {
                    info!("Event {} fired (success: {})", event.event_type, event.success());
                    if let Ok(json) = serde_json::to_string_pretty(&event) {
                        let _ = broadcast.send(json);
                    }
                    for message in event_messages(&event) {
                        self.publish(message).await;
                    }
                },
            };
        }

        info!("Thread exit, waiting");
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>) {
    let app_status = get_app_status().await;

    let uptime_publish = PublishData {
        topic: format!("{TOPIC_PREFIX}/mgt/uptime"),
        payload: app_status.uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}

pub async fn publish_meter_state(mqtt_sender: &Sender<Transmission>, meter: &Meter) {
    let state_publish = PublishData {
        topic: meter_state_topic(meter),
        payload: meter.state_json().to_string(),
        qos: 1,
        retain: true,
    };
    if mqtt_sender.send(Transmission::Publish(state_publish)).await.is_err() {
        error!("Unable to queue state of meter {}", meter.uid);
    }
}

pub async fn publish_account_state(mqtt_sender: &Sender<Transmission>, account: &Account) {
    let state_publish = PublishData {
        topic: account_state_topic(account),
        payload: account.state_json().to_string(),
        qos: 1,
        retain: true,
    };
    if mqtt_sender.send(Transmission::Publish(state_publish)).await.is_err() {
        error!("Unable to queue state of account {}", account.id);
    }
}
