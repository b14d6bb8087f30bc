// MIT License - Copyright (c) 2026 Peter Wright
// Fan-out: one task per device

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::BridgeLoop;
use crate::bus::BusAdapter;
use crate::command::CommandRouter;
use crate::config::{BridgeSettings, Settings};
use crate::error::{BridgeError, Result};
use crate::registry::{DeviceDescriptor, NameTable, Registry};
use crate::session::{Connector, DeviceLink, DeviceSession};
use crate::topics::Topics;
use crate::transport::ConnectionFactory;

/// Owns everything shared between device tasks and runs them to completion.
///
/// Each device gets its own session, bus connection and bridge loop. A
/// device whose loop fails logs and stops; the others carry on. Cancelling
/// the token stops every loop.
pub struct BridgeRunner {
    devices: Vec<DeviceDescriptor>,
    names: Arc<NameTable>,
    settings: Arc<Settings>,
    connector: Arc<Connector>,
    cancel: CancellationToken,
}

impl BridgeRunner {
    pub fn new(
        registry: Registry,
        settings: Settings,
        factory: Arc<dyn ConnectionFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let (devices, names) = registry.into_parts();
        let connector = Connector::new(factory, &devices, settings.bridge.receive_timeout());
        Self {
            devices,
            names: Arc::new(names),
            settings: Arc::new(settings),
            connector: Arc::new(connector),
            cancel,
        }
    }

    /// Spawn every device loop and wait for all of them to end.
    ///
    /// Returns the number of devices whose loop ended with an error.
    pub async fn run(self) -> usize {
        info!("Starting {} device loops", self.devices.len());

        let mut tasks = JoinSet::new();
        for device in self.devices {
            let connector = self.connector.clone();
            let names = self.names.clone();
            let settings = self.settings.clone();
            let cancel = self.cancel.child_token();

            tasks.spawn(async move {
                let name = device.name.clone();
                let result = run_device(device, &connector, names, &settings, cancel).await;
                if let Err(e) = &result {
                    error!("{name}: {e}");
                }
                info!("{name}: fin");
                result.is_err()
            });
        }

        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("Device task aborted: {e}");
                    failed += 1;
                }
            }
        }
        failed
    }
}

async fn run_device(
    device: DeviceDescriptor,
    connector: &Connector,
    names: Arc<NameTable>,
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(session) = open_session(connector, &device, &settings.bridge, &cancel).await? else {
        return Ok(());
    };
    let link: Arc<dyn DeviceLink> = Arc::new(session);

    let topics = Topics::new(&settings.mqtt.base_topic);
    let router = Arc::new(CommandRouter::new(&device.name, topics.clone(), link.clone()));
    let bus = BusAdapter::connect(
        &settings.mqtt,
        &device.id,
        topics.command_filter(&device.name),
        router,
        cancel.child_token(),
    );

    let mut bridge = BridgeLoop::new(
        device,
        link,
        Arc::new(bus.publisher()),
        names,
        topics,
        settings.bridge.clone(),
        cancel,
    );
    let result = bridge.run().await;
    bus.shutdown().await;
    result
}

/// Open a session, retrying transport faults with the reconnect backoff.
///
/// `None` when cancelled before a session could be opened.
pub(crate) async fn open_session(
    connector: &Connector,
    device: &DeviceDescriptor,
    settings: &BridgeSettings,
    cancel: &CancellationToken,
) -> Result<Option<DeviceSession>> {
    let mut attempt = 1;
    loop {
        match connector.connect(device).await {
            Ok(session) => return Ok(Some(session)),
            Err(e) if e.is_retryable() && settings.retries_after(attempt) => {
                let delay = settings.reconnect_delay(attempt);
                warn!(
                    "{}: connect failed ({e}), retrying in {:.1}s",
                    device.name,
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                return Err(BridgeError::ReconnectExhausted { attempts: attempt });
            }
            Err(e) => return Err(e),
        }
    }
}
