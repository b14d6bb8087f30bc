// MIT License - Copyright (c) 2026 Peter Wright
// Per-device MQTT connection

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::CommandRouter;
use crate::config::MqttSettings;
use crate::error::Result;

/// One outbound publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Where a bridge loop sends its telemetry.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a batch. Losing individual messages is tolerated.
    async fn publish_batch(&self, batch: Vec<BusMessage>) -> Result<()>;
}

/// Publishes through a device's own MQTT client at QoS 0.
///
/// Publishing never waits on the client's request queue. While the broker is
/// unreachable the queue fills up and further messages are dropped, so the
/// bridge loop keeps its heartbeat schedule.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish_batch(&self, batch: Vec<BusMessage>) -> Result<()> {
        let total = batch.len();
        let mut last_error = None;
        let mut failed = 0;

        for message in batch {
            if let Err(e) = self
                .client
                .try_publish(&message.topic, QoS::AtMostOnce, false, message.payload)
            {
                warn!("Failed to publish to {}: {e}", message.topic);
                failed += 1;
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) if failed == total => Err(e.into()),
            _ => {
                debug!("Published {}/{total} messages", total - failed);
                Ok(())
            }
        }
    }
}

/// A device's bus connection: the client plus the task driving its event loop.
///
/// The event loop task subscribes to the device's command filter on every
/// ConnAck and hands each inbound publish to the device's [`CommandRouter`].
pub struct BusAdapter {
    client: AsyncClient,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BusAdapter {
    pub fn options(settings: &MqttSettings, client_id: &str) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, &settings.hostname, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        if !settings.username.is_empty() {
            opts.set_credentials(&settings.username, &settings.password);
        }
        opts
    }

    pub fn connect(
        settings: &MqttSettings,
        client_id: &str,
        filter: String,
        router: Arc<CommandRouter>,
        cancel: CancellationToken,
    ) -> Self {
        let (client, eventloop) = AsyncClient::new(Self::options(settings, client_id), 256);
        info!(
            "MQTT: {} connecting to {}:{}",
            router.device(),
            settings.hostname,
            settings.port
        );

        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            filter,
            router,
            cancel.clone(),
        ));
        Self {
            client,
            cancel,
            handle,
        }
    }

    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher::new(self.client.clone())
    }

    /// Disconnect from the broker and wait for the event loop task to end.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("MQTT event loop task failed: {e}");
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    filter: String,
    router: Arc<CommandRouter>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // rumqttc does not resubscribe after a broker reconnect.
                info!("MQTT: connected, subscribing to {filter}");
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    error!("Failed to subscribe to {filter}: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                debug!("MQTT command on {}: {:?}", msg.topic, msg.payload);
                if let Err(e) = router.handle(&msg.topic, &msg.payload).await {
                    warn!("{}: command on {} failed: {e}", router.device(), msg.topic);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT event loop error for {}: {e}", router.device());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    // Give the broker a clean DISCONNECT, but don't hang on a dead link.
    if client.try_disconnect().is_ok() {
        let flushed = timeout(Duration::from_secs(1), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("MQTT: {} disconnect not flushed", router.device());
        }
    }
    debug!("MQTT: {} event loop stopped", router.device());
}
