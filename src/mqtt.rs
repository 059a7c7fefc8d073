//! MQTT transport.
//!
//! Owns the broker connection: subscribes to the status and online topics on
//! every (re)connect and feeds inbound publishes to the [`LaneRouter`].
//! Outbound commands share the same client through
//! [`crate::dispatch::MqttCommandChannel`].

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ingest::LaneRouter;

// ---

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Build the client and its event loop. Nothing touches the network until
/// the loop is polled.
pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    // ---
    let mut options = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(KEEP_ALIVE);
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Drive the connection forever. Connection errors are logged and retried;
/// the loop itself never returns.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: [String; 2],
    mut router: LaneRouter,
) {
    // ---
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                for topic in &subscriptions {
                    match client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                        Ok(()) => info!(topic = %topic, "Subscribed"),
                        Err(e) => warn!(topic = %topic, "Subscribe failed: {e}"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "Inbound message");
                router.route_raw(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {e}, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
