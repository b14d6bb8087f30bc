// MIT License - Copyright (c) 2026 Peter Wright
// MQTT topic namespace

/// Payload of the online marker topic.
pub const ONLINE_PAYLOAD: &str = "online";

/// Builds and parses topics under one base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// `{base}/{device}/dps/+/command`
    pub fn command_filter(&self, device: &str) -> String {
        format!("{}/{device}/dps/+/command", self.base)
    }

    /// `{base}/{device}/online`
    pub fn online(&self, device: &str) -> String {
        format!("{}/{device}/online", self.base)
    }

    /// `{base}/{device}/dps/{index}/state`
    pub fn state(&self, device: &str, index: &str) -> String {
        format!("{}/{device}/dps/{index}/state", self.base)
    }

    /// Split a command topic into (device name, datapoint index).
    ///
    /// Returns `None` for topics outside the base, topics of another shape and
    /// non-numeric indices.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Option<(&'a str, u32)> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let device = parts.next()?;
        if device.is_empty() || parts.next()? != "dps" {
            return None;
        }
        let index = parts.next()?.trim().parse::<u32>().ok()?;
        if parts.next()? != "command" || parts.next().is_some() {
            return None;
        }
        Some((device, index))
    }
}
