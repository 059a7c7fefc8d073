//! Command dispatcher.
//!
//! Publishes operator and detector commands to devices on
//! `<prefix>/<device_id>/command`. Delivery is fire-and-forget; every
//! dispatched command is also written to the device's system log.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tracing::{info, warn};

use crate::models::LogKind;
use crate::store::DurableStore;

// ---

/// Suspends automatic watering on the device.
pub const LOCK_SYSTEM: &str = "LOCK_SYSTEM";
/// Re-enables automatic watering after an operator reset.
pub const UNLOCK_SYSTEM: &str = "UNLOCK_SYSTEM";

/// Transport used to reach a device.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn publish_command(&self, device_id: &str, command: &str) -> Result<()>;
}

/// [`CommandChannel`] over the MQTT broker connection.
#[derive(Clone)]
pub struct MqttCommandChannel {
    // ---
    client: AsyncClient,
    prefix: String,
}

impl MqttCommandChannel {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn topic(&self, device_id: &str) -> String {
        format!("{}/{}/command", self.prefix, device_id)
    }
}

#[async_trait]
impl CommandChannel for MqttCommandChannel {
    async fn publish_command(&self, device_id: &str, command: &str) -> Result<()> {
        // ---
        self.client
            .publish(self.topic(device_id), QoS::AtMostOnce, false, command.as_bytes().to_vec())
            .await?;
        Ok(())
    }
}

pub struct CommandDispatcher {
    // ---
    channel: Arc<dyn CommandChannel>,
    durable: Arc<dyn DurableStore>,
}

impl CommandDispatcher {
    pub fn new(channel: Arc<dyn CommandChannel>, durable: Arc<dyn DurableStore>) -> Self {
        Self { channel, durable }
    }

    /// Publish `command` to `device_id`. A failed log write is only warned
    /// about; a failed publish is returned.
    pub async fn send(&self, device_id: &str, command: &str) -> Result<()> {
        // ---
        let command = command.trim();
        if device_id.is_empty() || command.is_empty() {
            bail!("device id and command are required");
        }

        self.channel.publish_command(device_id, command).await?;
        info!(device_id, command, "Sent command");

        if let Err(e) = self
            .durable
            .insert_log(device_id, LogKind::Info, &format!("Command Sent: {command}"))
            .await
        {
            warn!(device_id, "Failed to log command: {e:#}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::keyed::lock;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CommandChannel for RecordingChannel {
        async fn publish_command(&self, device_id: &str, command: &str) -> Result<()> {
            lock(&self.sent).push((device_id.to_string(), command.to_string()));
            Ok(())
        }
    }

    struct BrokenChannel;

    #[async_trait]
    impl CommandChannel for BrokenChannel {
        async fn publish_command(&self, _device_id: &str, _command: &str) -> Result<()> {
            bail!("broker unreachable")
        }
    }

    #[test]
    fn test_command_topic() {
        // ---
        let (client, _eventloop) =
            AsyncClient::new(rumqttc::MqttOptions::new("test", "localhost", 1883), 10);
        let channel = MqttCommandChannel::new(client, "plantcare/");
        assert_eq!(channel.topic("esp32-1"), "plantcare/esp32-1/command");
    }

    #[tokio::test]
    async fn test_send_publishes_and_logs() {
        // ---
        let channel = Arc::new(RecordingChannel::default());
        let durable = Arc::new(MemoryStore::new());
        let dispatcher = CommandDispatcher::new(channel.clone(), durable.clone());

        dispatcher.send("esp32-1", " PUMP_ON ").await.unwrap();

        assert_eq!(
            *lock(&channel.sent),
            vec![("esp32-1".to_string(), "PUMP_ON".to_string())]
        );
        let logs = durable.logs("esp32-1");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "Command Sent: PUMP_ON");
        assert_eq!(logs[0].kind, LogKind::Info);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_input() {
        // ---
        let dispatcher = CommandDispatcher::new(
            Arc::new(RecordingChannel::default()),
            Arc::new(MemoryStore::new()),
        );
        assert!(dispatcher.send("", "PUMP_ON").await.is_err());
        assert!(dispatcher.send("esp32-1", "  ").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned_and_not_logged() {
        // ---
        let durable = Arc::new(MemoryStore::new());
        let dispatcher = CommandDispatcher::new(Arc::new(BrokenChannel), durable.clone());

        assert!(dispatcher.send("esp32-1", LOCK_SYSTEM).await.is_err());
        assert!(durable.logs("esp32-1").is_empty());
    }

    #[tokio::test]
    async fn test_log_failure_does_not_fail_send() {
        // ---
        let durable = Arc::new(MemoryStore::new());
        durable.fail_writes(true);
        let dispatcher =
            CommandDispatcher::new(Arc::new(RecordingChannel::default()), durable.clone());

        assert!(dispatcher.send("esp32-1", UNLOCK_SYSTEM).await.is_ok());
    }
}
