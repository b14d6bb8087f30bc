// MIT License - Copyright (c) 2026 Peter Wright
// Device session to MQTT bridge
//
//! # tuya_bridge
//!
//! Bridges persistent smart-device sessions to MQTT. Each device in the
//! inventory (direct devices, gateways, and the sub-devices relayed through
//! a gateway) gets its own bridge loop that polls status, keeps the socket
//! alive with heartbeats, publishes telemetry and turns command messages
//! into device writes.
//!
//! Topics, under a configurable base:
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `{base}/{device}/online` | out | `online` |
//! | `{base}/{device}/dps/{index}/state` | out | raw datapoint value |
//! | `{base}/{device}/dps/{index}/command` | in | `on`/`off`/`true`/`false`, text, or a number |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tuya_bridge::{BridgeRunner, Registry, TcpConnectionFactory};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = tuya_bridge::config::load_settings(Path::new("tuya2mqtt.toml"))?;
//!     let inventory = tuya_bridge::config::load_inventory(Path::new("devices.json"))?;
//!     let registry = Registry::from_inventory(inventory)?;
//!
//!     let cancel = CancellationToken::new();
//!     let runner = BridgeRunner::new(
//!         registry,
//!         settings,
//!         Arc::new(TcpConnectionFactory::default()),
//!         cancel.clone(),
//!     );
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         cancel.cancel();
//!     });
//!     runner.run().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod registry;
pub mod runner;
pub mod session;
pub mod topics;
pub mod transport;

// Re-exports for convenience
pub use bridge::{BridgeLoop, Deadline, LoopState};
pub use bus::{BusAdapter, BusMessage, MqttPublisher, Publisher};
pub use command::{CommandRouter, CommandValue, parse_command_value};
pub use config::{BridgeSettings, DeviceRecord, MqttSettings, Settings, SubDeviceRecord};
pub use error::{BridgeError, ConfigError, Result};
pub use frame::{Datapoints, DpValue, Frame};
pub use registry::{DeviceDescriptor, DeviceKind, NameTable, Registry};
pub use runner::BridgeRunner;
pub use session::{Connector, DeviceLink, DeviceSession};
pub use topics::Topics;
pub use transport::tcp::{TcpConnection, TcpConnectionFactory};
pub use transport::{Connection, ConnectionFactory};
