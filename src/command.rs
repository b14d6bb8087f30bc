// MIT License - Copyright (c) 2026 Peter Wright
// Inbound bus commands -> device writes

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::DpValue;
use crate::session::DeviceLink;
use crate::topics::Topics;

/// How a command payload is written to a datapoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandValue {
    Boolean(bool),
    Text(String),
    Number(i64),
    Invalid,
}

/// Infer the datapoint value a payload stands for.
///
/// `on`/`true` and `off`/`false` (any case) are booleans, purely alphabetic
/// payloads are text, anything else must parse as a decimal number and is
/// truncated toward zero.
pub fn parse_command_value(payload: &str) -> CommandValue {
    match payload.to_lowercase().as_str() {
        "on" | "true" => return CommandValue::Boolean(true),
        "off" | "false" => return CommandValue::Boolean(false),
        _ => {}
    }

    if !payload.is_empty() && payload.chars().all(char::is_alphabetic) {
        return CommandValue::Text(payload.to_string());
    }

    match payload.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n > i64::MIN as f64 && n < i64::MAX as f64 => {
            CommandValue::Number(n.trunc() as i64)
        }
        _ => CommandValue::Invalid,
    }
}

/// Routes command messages for one device into writes on its session.
pub struct CommandRouter {
    device: String,
    topics: Topics,
    link: Arc<dyn DeviceLink>,
}

impl CommandRouter {
    pub fn new(device: impl Into<String>, topics: Topics, link: Arc<dyn DeviceLink>) -> Self {
        Self {
            device: device.into(),
            topics,
            link,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Handle one inbound message.
    ///
    /// Returns the datapoint index written, or `None` when the message was
    /// ignored (foreign topic or empty payload).
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Option<u32>> {
        let Some((device, index)) = self.topics.parse_command(topic) else {
            warn!("{}: ignoring message on unexpected topic {topic}", self.device);
            return Ok(None);
        };
        if device != self.device {
            warn!("{}: ignoring command for {device}", self.device);
            return Ok(None);
        }
        if payload.is_empty() {
            debug!("{}: empty command for dps {index}", self.device);
            return Ok(None);
        }

        let text = String::from_utf8_lossy(payload);
        match parse_command_value(&text) {
            CommandValue::Boolean(on) => {
                info!("{}: dps {index} <- {on}", self.device);
                self.link.set_switch(index, on).await?;
            }
            CommandValue::Text(s) => {
                info!("{}: dps {index} <- {s:?}", self.device);
                self.link.set_value(index, DpValue::Text(s)).await?;
            }
            CommandValue::Number(n) => {
                info!("{}: dps {index} <- {n}", self.device);
                self.link.set_value(index, DpValue::Int(n)).await?;
            }
            CommandValue::Invalid => {
                return Err(BridgeError::InvalidCommand {
                    payload: text.into_owned(),
                });
            }
        }

        // Some firmware only reports a written value after an explicit refresh.
        if let Err(e) = self.link.update_dps(&[index]).await {
            warn!("{}: refresh of dps {index} failed: {e}", self.device);
        }
        Ok(Some(index))
    }
}
