// MIT License - Copyright (c) 2026 Peter Wright
// Device connections

pub mod codec;
pub mod engine;
pub mod inbox;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::frame::Frame;
use crate::registry::DeviceDescriptor;

/// What one outbound frame asks the device to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Session opening: identifies the device and its key/protocol version.
    Hello,
    Status,
    Heartbeat,
    /// Write an arbitrary value to a datapoint.
    SetValue { index: u32, value: Value },
    /// Write an on/off datapoint.
    SetSwitch { index: u32, on: bool },
    /// Ask the device to re-read the listed datapoints.
    UpdateDps { indices: Vec<u32> },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Hello => "hello",
            Op::Status => "status",
            Op::Heartbeat => "heartbeat",
            Op::SetValue { .. } => "set",
            Op::SetSwitch { .. } => "switch",
            Op::UpdateDps { .. } => "updatedps",
        }
    }
}

/// An operation plus the sub-device channel it targets, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: Op,
    pub cid: Option<String>,
}

impl Request {
    pub fn new(op: Op, cid: Option<&str>) -> Self {
        Self {
            op,
            cid: cid.map(str::to_string),
        }
    }
}

/// One persistent device socket.
///
/// Implementations must be safe to share: a gateway's connection is used
/// concurrently by the gateway loop and every sub-device loop behind it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(&self, request: Request) -> Result<Frame>;

    /// Send a request without waiting; any response shows up in `receive`.
    async fn send(&self, request: Request) -> Result<()>;

    /// Next frame nobody was waiting for, waiting at most `wait`.
    ///
    /// `channel` is a sub-device's channel id; `None` receives for the device
    /// owning the socket, which gets every untagged frame.
    async fn receive(&self, channel: Option<&str>, wait: Duration) -> Result<Option<Frame>>;

    /// Re-open the socket. A no-op when already connected.
    ///
    /// A request that times out leaves the connection disconnected, so a
    /// silent peer gets a fresh socket here.
    async fn reconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Opens connections for devices that own a socket (direct devices and gateways).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, owner: &DeviceDescriptor) -> Result<Arc<dyn Connection>>;
}
