// MIT License - Copyright (c) 2026 Peter Wright
// Telemetry frames and datapoint values

use serde_json::{Map, Value};

/// Datapoint index (as text, the way devices key them) -> raw value.
pub type Datapoints = Map<String, Value>;

/// Result of a receive or status operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The session reported a failure for this exchange.
    Error { message: String },
    /// Datapoint values. `cid` is set when a gateway relayed them for a sub-device.
    Datapoints { dps: Datapoints, cid: Option<String> },
    /// A well-formed frame without datapoints (heartbeat ack, write ack, ...).
    Empty,
}

impl Frame {
    pub fn datapoints(dps: Datapoints) -> Self {
        Frame::Datapoints { dps, cid: None }
    }

    pub fn relayed(dps: Datapoints, cid: impl Into<String>) -> Self {
        Frame::Datapoints {
            dps,
            cid: Some(cid.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// Interpret a decoded response object.
    ///
    /// `{"Err": code, "Error": text}` is an error, `{"dps": {...}}` carries
    /// datapoints, and an optional `"cid"` marks a gateway-relayed frame.
    /// Datapoints may also sit one level down under `"data"`.
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Frame::Empty;
        };

        if let Some(err) = obj.get("Err") {
            let message = obj
                .get("Error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| render_payload(err));
            return Frame::Error { message };
        }

        let (dps, cid) = match obj.get("dps") {
            Some(dps) => (dps, obj.get("cid")),
            None => match obj.get("data").and_then(Value::as_object) {
                Some(data) => match data.get("dps") {
                    Some(dps) => (dps, data.get("cid").or_else(|| obj.get("cid"))),
                    None => return Frame::Empty,
                },
                None => return Frame::Empty,
            },
        };

        let Some(dps) = dps.as_object() else {
            return Frame::Error {
                message: format!("dps is not an object: {dps}"),
            };
        };

        Frame::Datapoints {
            dps: dps.clone(),
            cid: cid.and_then(cid_text),
        }
    }
}

fn cid_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Render a raw datapoint value as an MQTT payload, without conversion:
/// strings go out unquoted, everything else as compact JSON.
pub fn render_payload(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A value written to a datapoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl DpValue {
    pub fn to_json(&self) -> Value {
        match self {
            DpValue::Bool(b) => Value::Bool(*b),
            DpValue::Int(n) => Value::from(*n),
            DpValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for DpValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DpValue::Bool(b) => write!(f, "{b}"),
            DpValue::Int(n) => write!(f, "{n}"),
            DpValue::Text(s) => write!(f, "{s}"),
        }
    }
}
