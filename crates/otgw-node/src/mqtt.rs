//! MQTT side of the bridge
//!
//! Gateway events are published under the publish namespace; publishes on the
//! subscribe namespace are handed to the bridge as commands. The bare publish
//! namespace carries the retained `online`/`offline` liveness value, with
//! `offline` also registered as the last will.

use async_trait::async_trait;
use otgw_bridge::{BridgeHandle, DecodedEvent, Listener, Watchdog};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::settings::MqttSettings;

/// Requests buffered between the client and its event loop
const REQUEST_CAPACITY: usize = 64;

/// Pause after a broker connection error before polling again
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// A message ready to go out on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Decides topic, retain flag and suppression for each gateway event
#[derive(Debug)]
pub struct PublishPolicy {
    namespace: String,
    retain: bool,
    changed_only: bool,
    last_payloads: HashMap<String, String>,
}

impl PublishPolicy {
    pub fn new(settings: &MqttSettings) -> Self {
        Self {
            namespace: settings.pub_topic_namespace.clone(),
            retain: settings.retain,
            changed_only: settings.changed_messages_only,
            last_payloads: HashMap::new(),
        }
    }

    /// Publication for an event, or `None` when it repeats the last
    /// published value
    pub fn publication(&self, event: &DecodedEvent) -> Option<Publication> {
        let topic = format!("{}{}", self.namespace, event.topic);
        let payload = event.payload();

        if event.is_liveness() {
            return Some(Publication {
                topic,
                payload,
                retain: true,
            });
        }

        if self.changed_only && self.last_payloads.get(&topic) == Some(&payload) {
            return None;
        }

        Some(Publication {
            topic,
            payload,
            retain: self.retain,
        })
    }

    /// Remember a publication that reached the client
    pub fn record(&mut self, publication: &Publication) {
        if self.changed_only {
            self.last_payloads
                .insert(publication.topic.clone(), publication.payload.clone());
        }
    }
}

/// Destination of the publications
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hand one publication to the bus
    async fn send(&self, publication: &Publication, qos: QoS) -> Result<(), String>;
}

#[async_trait]
impl EventSink for AsyncClient {
    async fn send(&self, publication: &Publication, qos: QoS) -> Result<(), String> {
        self.publish(
            publication.topic.as_str(),
            qos,
            publication.retain,
            publication.payload.as_str(),
        )
        .await
        .map_err(|e| e.to_string())
    }
}

/// Create the client and its (not yet polled) event loop
pub fn connect(settings: &MqttSettings) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keepalive));

    if let Some(username) = settings.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(username, settings.password.as_deref().unwrap_or(""));
    }

    options.set_last_will(LastWill::new(
        &settings.pub_topic_namespace,
        "offline",
        settings.qos(),
        true,
    ));

    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Bridge listener handing every event to the publisher task
///
/// Never blocks the bridge worker. Non-liveness events also feed the
/// watchdog.
pub fn listener(
    events: mpsc::UnboundedSender<DecodedEvent>,
    watchdog: Watchdog,
    verbose: bool,
) -> Listener {
    Arc::new(move |event: &DecodedEvent| {
        if verbose {
            debug!(topic = %event.topic, value = %event.value, "Gateway event");
        }
        if !event.is_liveness() {
            watchdog.feed();
        }

        events
            .send(event.clone())
            .map_err(|_| "MQTT publisher stopped".to_string())
    })
}

/// Publish events in arrival order until every listener is gone
///
/// A failed publication is not recorded, so `changed_messages_only` lets
/// the same value through again.
pub async fn run_publisher<S: EventSink>(
    mut events: mpsc::UnboundedReceiver<DecodedEvent>,
    sink: S,
    mut policy: PublishPolicy,
    qos: QoS,
) {
    while let Some(event) = events.recv().await {
        let Some(publication) = policy.publication(&event) else {
            continue;
        };
        match sink.send(&publication, qos).await {
            Ok(()) => policy.record(&publication),
            Err(e) => warn!(topic = %publication.topic, "MQTT publish failed: {}", e),
        }
    }
    debug!("MQTT publisher exiting");
}

/// Drive the MQTT connection until the client disconnects or the bridge stops
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    settings: MqttSettings,
    handle: BridgeHandle,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %settings.host, port = settings.port, "Connected to MQTT broker");
                tokio::spawn(announce(client.clone(), settings.clone()));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if forward_command(&handle, &publish).is_err() {
                    debug!("Bridge stopped, MQTT loop exiting");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT client disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }
}

/// Subscribe to the command topics and mark the bridge online
///
/// Runs beside the event loop, since the request queue may still be full of
/// publications queued during an outage.
async fn announce(client: AsyncClient, settings: MqttSettings) {
    let qos = settings.qos();
    let sub_ns = settings.sub_topic_namespace.as_str();

    for topic in [sub_ns.to_string(), format!("{}/#", sub_ns)] {
        if let Err(e) = client.subscribe(topic.as_str(), qos).await {
            warn!(topic = %topic, "Subscribe failed: {}", e);
        }
    }
    if let Err(e) = client
        .publish(settings.pub_topic_namespace.as_str(), qos, true, "online")
        .await
    {
        warn!("Failed to publish online state: {}", e);
    }
}

/// Hand an inbound publish to the bridge as a command
fn forward_command(handle: &BridgeHandle, publish: &Publish) -> otgw_bridge::Result<()> {
    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
    info!(topic = %publish.topic, payload = %payload, "Command received");
    handle.command(&publish.topic, payload)
}
