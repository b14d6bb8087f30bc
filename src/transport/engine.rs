// MIT License - Copyright (c) 2026 Peter Wright
// Request/response engine shared by everything writing to one socket

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, error};

use crate::error::{BridgeError, Result};
use crate::frame::Frame;
use crate::transport::Request;
use crate::transport::codec::{FrameCodec, Inbound};

pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Tracks pending requests and routes responses back to callers via oneshot channels.
///
/// Writes are serialized through the writer mutex, so several bridge loops may
/// share one engine.
pub struct RequestEngine {
    /// Wraps at u32::MAX, skipping 0
    sequence: AtomicU32,
    /// Sequence number -> waiting caller
    pending: Mutex<HashMap<u32, oneshot::Sender<Frame>>>,
    writer: Mutex<Option<Writer>>,
    codec: Arc<dyn FrameCodec>,
    connected: AtomicBool,
    response_timeout: Duration,
}

impl RequestEngine {
    pub fn new(codec: Arc<dyn FrameCodec>, response_timeout: Duration) -> Self {
        Self {
            sequence: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            codec,
            connected: AtomicBool::new(false),
            response_timeout,
        }
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.codec
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Install a fresh writer and mark the engine connected.
    pub async fn attach(&self, writer: Writer) {
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::Release);
    }

    /// Drop the writer and fail every waiting caller.
    pub async fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        self.writer.lock().await.take();
        // Dropping the senders wakes waiters with ChannelClosed.
        self.pending.lock().await.clear();
    }

    fn next_sequence(&self) -> u32 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Send a request. With `wait`, block until the response arrives or the
    /// response timeout expires.
    pub async fn send(&self, request: &Request, wait: bool) -> Result<Option<Frame>> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }

        let seq = self.next_sequence();
        let encoded = self.codec.encode(seq, request)?;

        let rx = if wait {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(seq, tx);
            Some(rx)
        } else {
            None
        };

        debug!("Sending {} (seq {seq}, cid {:?})", request.op.name(), request.cid);
        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.write_all(&encoded).await.map_err(|e| {
                    error!("Failed to write {}: {e}", request.op.name());
                    BridgeError::Io(e)
                }),
                None => Err(BridgeError::Disconnected),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            if e.is_retryable() {
                self.connected.store(false, Ordering::Release);
            }
            return Err(e);
        }

        let Some(rx) = rx else {
            return Ok(None);
        };

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(frame)) => {
                debug!("Response for seq {seq}: {frame:?}");
                Ok(Some(frame))
            }
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                debug!("Timeout waiting for {} (seq {seq})", request.op.name());
                Err(BridgeError::CommandTimeout {
                    command: request.op.name().to_string(),
                })
            }
        }
    }

    /// Hand an inbound frame to whoever waits for its sequence number.
    ///
    /// Returns the frame back when nobody is waiting for it.
    pub async fn route(&self, inbound: Inbound) -> Option<Frame> {
        if let Some(seq) = inbound.seq
            && let Some(tx) = self.pending.lock().await.remove(&seq)
        {
            // Waiter may have timed out in the meantime; then the frame is lost.
            let _ = tx.send(inbound.frame);
            return None;
        }
        Some(inbound.frame)
    }
}
