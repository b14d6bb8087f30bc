// MIT License - Copyright (c) 2026 Peter Wright
// Frame codecs

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::frame::Frame;
use crate::registry::DeviceDescriptor;
use crate::transport::{Op, Request};

/// A frame read off the socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Sequence number of the request this answers, if it answers one.
    pub seq: Option<u32>,
    pub frame: Frame,
}

/// Turns requests into bytes and bytes into frames for one device socket.
///
/// The bridge never looks at wire bytes itself; encryption, framing and
/// protocol versions all live behind this trait.
pub trait FrameCodec: Send + Sync + 'static {
    fn encode(&self, seq: u32, request: &Request) -> Result<Vec<u8>>;

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `None` when `buf` holds no complete frame yet. Bytes of a
    /// frame that fails to decode are consumed before the error is returned.
    fn decode(&self, buf: &mut Vec<u8>) -> Option<Result<Inbound>>;
}

/// Newline-delimited JSON envelopes, spoken by a local protocol adapter.
///
/// Outbound: `{"seq":7,"cmd":"status","devId":"...","cid":"...","t":1700000000}`.
/// Inbound: any object; `seq` ties it to a request, the rest is read by
/// [`Frame::from_json`].
#[derive(Debug, Clone)]
pub struct JsonLinesCodec {
    device_id: String,
    key: String,
    version: String,
}

impl JsonLinesCodec {
    pub fn new(device_id: impl Into<String>, key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            key: key.into(),
            version: version.into(),
        }
    }

    pub fn for_device(device: &DeviceDescriptor) -> Self {
        Self::new(&device.id, &device.key, &device.version)
    }

    fn envelope(&self, seq: u32, request: &Request) -> Value {
        let mut obj = Map::new();
        obj.insert("seq".into(), json!(seq));
        obj.insert("cmd".into(), json!(request.op.name()));
        obj.insert("devId".into(), json!(self.device_id));
        if let Some(cid) = &request.cid {
            obj.insert("cid".into(), json!(cid));
        }

        match &request.op {
            Op::Hello => {
                obj.insert("key".into(), json!(self.key));
                obj.insert("version".into(), json!(self.version));
            }
            Op::Status | Op::Heartbeat => {}
            Op::SetValue { index, value } => {
                let mut dps = Map::new();
                dps.insert(index.to_string(), value.clone());
                obj.insert("dps".into(), Value::Object(dps));
            }
            Op::SetSwitch { index, on } => {
                let mut dps = Map::new();
                dps.insert(index.to_string(), Value::Bool(*on));
                obj.insert("dps".into(), Value::Object(dps));
            }
            Op::UpdateDps { indices } => {
                obj.insert("dpId".into(), json!(indices));
            }
        }

        obj.insert("t".into(), json!(Utc::now().timestamp()));
        Value::Object(obj)
    }
}

impl FrameCodec for JsonLinesCodec {
    fn encode(&self, seq: u32, request: &Request) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&self.envelope(seq, request)).map_err(|e| {
            BridgeError::InvalidFrame {
                details: format!("encode {}: {e}", request.op.name()),
            }
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode(&self, buf: &mut Vec<u8>) -> Option<Result<Inbound>> {
        loop {
            let end = buf.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = buf.drain(..=end).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_slice(line) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Undecodable line: {}", String::from_utf8_lossy(line));
                    return Some(Err(BridgeError::InvalidFrame {
                        details: e.to_string(),
                    }));
                }
            };

            let seq = value
                .get("seq")
                .and_then(Value::as_u64)
                .and_then(|s| u32::try_from(s).ok());
            return Some(Ok(Inbound {
                seq,
                frame: Frame::from_json(&value),
            }));
        }
    }
}
