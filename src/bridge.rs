// MIT License - Copyright (c) 2026 Peter Wright
// Per-device bridge loop

use std::sync::Arc;

use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, Publisher};
use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::frame::{Datapoints, Frame, render_payload};
use crate::registry::{DeviceDescriptor, NameTable};
use crate::session::DeviceLink;
use crate::topics::{ONLINE_PAYLOAD, Topics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Active,
    Finished,
}

/// A periodic gate checked once per tick.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    period: Duration,
}

impl Deadline {
    pub fn new(now: Instant, period: Duration) -> Self {
        Self {
            at: now + period,
            period,
        }
    }

    /// True when `now` has reached the deadline; the next one is then `now + period`.
    pub fn fire(&mut self, now: Instant) -> bool {
        if now >= self.at {
            self.at = now + self.period;
            true
        } else {
            false
        }
    }
}

/// The publish batch for one set of datapoints: the online marker first, then
/// one state message per datapoint, values unconverted.
pub fn telemetry_batch(topics: &Topics, device: &str, dps: &Datapoints) -> Vec<BusMessage> {
    let mut batch = Vec::with_capacity(dps.len() + 1);
    batch.push(BusMessage::new(topics.online(device), ONLINE_PAYLOAD));
    for (index, value) in dps {
        batch.push(BusMessage::new(
            topics.state(device, index),
            render_payload(value),
        ));
    }
    batch
}

/// Drives one device: seeds the bus with its state, then ticks through the
/// receive pass, heartbeat gate and poll gate until cancelled.
pub struct BridgeLoop {
    device: DeviceDescriptor,
    link: Arc<dyn DeviceLink>,
    publisher: Arc<dyn Publisher>,
    names: Arc<NameTable>,
    topics: Topics,
    settings: BridgeSettings,
    refresh_dps: Vec<u32>,
    cancel: CancellationToken,
    state: LoopState,
}

impl BridgeLoop {
    pub fn new(
        device: DeviceDescriptor,
        link: Arc<dyn DeviceLink>,
        publisher: Arc<dyn Publisher>,
        names: Arc<NameTable>,
        topics: Topics,
        settings: BridgeSettings,
        cancel: CancellationToken,
    ) -> Self {
        let refresh_dps = device
            .refresh_dps
            .clone()
            .unwrap_or_else(|| settings.refresh_dps.clone());
        Self {
            device,
            link,
            publisher,
            names,
            topics,
            settings,
            refresh_dps,
            cancel,
            state: LoopState::Connecting,
        }
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until cancelled. Returns an error only for faults that end this
    /// device's loop.
    pub async fn run(&mut self) -> Result<()> {
        self.state = LoopState::Connecting;
        let result = self.run_inner().await;
        self.state = LoopState::Finished;
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            self.recover(e).await?;
        }

        self.state = LoopState::Active;
        info!("{}: active", self.device.name);

        let now = Instant::now();
        let mut heartbeat = Deadline::new(now, self.settings.heartbeat_interval());
        let mut poll = Deadline::new(now, self.settings.poll_interval());
        let tick = self.settings.tick();

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.tick(&mut heartbeat, &mut poll).await {
                self.recover(e).await?;
                // The connection is fresh; don't wait a full period to keep it alive.
                heartbeat = Deadline::new(Instant::now(), self.settings.heartbeat_interval());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(tick) => {}
            }
        }
        debug!("{}: cancelled", self.device.name);
        Ok(())
    }

    /// Startup: non-blocking status request, then one blocking fetch-and-publish.
    async fn start(&self) -> Result<()> {
        self.link.request_status(false).await?;
        self.fetch_and_publish().await
    }

    /// One steady-state iteration.
    async fn tick(&self, heartbeat: &mut Deadline, poll: &mut Deadline) -> Result<()> {
        self.receive_pass().await?;

        if heartbeat.fire(Instant::now()) {
            debug!("{}: heartbeat", self.device.name);
            self.link.heartbeat(false).await?;
        }

        if poll.fire(Instant::now()) && !self.refresh_dps.is_empty() {
            debug!("{}: refreshing dps {:?}", self.device.name, self.refresh_dps);
            self.link.update_dps(&self.refresh_dps).await?;
        }
        Ok(())
    }

    /// Handle at most one available frame.
    pub(crate) async fn receive_pass(&self) -> Result<()> {
        let Some(frame) = self.link.receive().await? else {
            return Ok(());
        };

        match frame {
            Frame::Error { message } => {
                debug!("{}: error frame ({message}), re-reading status", self.device.name);
                let status = self.link.request_status(true).await?;
                debug!("{}: status after error: {status:?}", self.device.name);
            }
            Frame::Datapoints { dps, cid: Some(cid) } => match self.names.name_for(&cid) {
                Some(name) => self.publish(name, &dps).await,
                None => debug!("{}: frame for unknown cid {cid}", self.device.name),
            },
            Frame::Datapoints { dps, cid: None } => self.publish(&self.device.name, &dps).await,
            Frame::Empty => debug!("{}: empty frame", self.device.name),
        }
        Ok(())
    }

    /// Blocking status call; publishes the datapoints it returns.
    pub async fn fetch_and_publish(&self) -> Result<()> {
        match self.link.request_status(true).await? {
            Some(Frame::Datapoints { dps, .. }) => self.publish(&self.device.name, &dps).await,
            Some(Frame::Error { message }) => {
                debug!("{}: status returned error: {message}", self.device.name)
            }
            _ => debug!("{}: status returned no datapoints", self.device.name),
        }
        Ok(())
    }

    async fn publish(&self, device: &str, dps: &Datapoints) {
        let batch = telemetry_batch(&self.topics, device, dps);
        debug!("{}: publishing {} messages for {device}", self.device.name, batch.len());
        if let Err(e) = self.publisher.publish_batch(batch).await {
            warn!("{}: publish for {device} failed: {e}", self.device.name);
        }
    }

    /// Reconnect with backoff after a transport fault, then re-seed the bus.
    ///
    /// Returns early without error when cancelled.
    async fn recover(&self, cause: BridgeError) -> Result<()> {
        if !cause.is_retryable() {
            error!("{}: {cause}", self.device.name);
            return Err(cause);
        }
        warn!("{}: connection fault: {cause}", self.device.name);

        let mut attempt = 1;
        loop {
            info!("{}: reconnecting (attempt {attempt})", self.device.name);
            let result = match self.link.reconnect().await {
                Ok(()) => self.start().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!("{}: reconnected", self.device.name);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => debug!("{}: reconnect failed: {e}", self.device.name),
                Err(e) => return Err(e),
            }

            if !self.settings.retries_after(attempt) {
                return Err(BridgeError::ReconnectExhausted { attempts: attempt });
            }
            let delay = self.settings.reconnect_delay(attempt);
            warn!(
                "{}: reconnect attempt {attempt} failed, retrying in {:.1}s",
                self.device.name,
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
