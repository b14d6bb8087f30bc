// MIT License - Copyright (c) 2026 Peter Wright
// Error types

use std::path::PathBuf;

/// All errors that can occur while talking to a device or the bus.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout: {address}")]
    ConnectionTimeout { address: String },

    #[error("Command timeout: {command}")]
    CommandTimeout { command: String },

    #[error("Socket disconnected")]
    Disconnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid frame: {details}")]
    InvalidFrame { details: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid command payload: {payload:?}")]
    InvalidCommand { payload: String },

    #[error("Unknown device: {id}")]
    UnknownDevice { id: String },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl BridgeError {
    /// Whether this error is a transport fault that a reconnect may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::ConnectionTimeout { .. }
                | BridgeError::CommandTimeout { .. }
                | BridgeError::Disconnected
                | BridgeError::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Startup configuration failures. Each cause maps to its own exit code.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file: {name}")]
    Missing { name: String },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid device inventory: {0}")]
    InvalidInventory(String),

    #[error("Invalid bus configuration: {0}")]
    InvalidBus(String),
}

impl ConfigError {
    /// Process exit code for this failure.
    ///
    /// Missing or unreadable files exit with 2, a malformed device inventory
    /// with 3 and a malformed bus configuration with 4.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Missing { .. } | ConfigError::Read { .. } => 2,
            ConfigError::InvalidInventory(_) => 3,
            ConfigError::InvalidBus(_) => 4,
        }
    }
}
