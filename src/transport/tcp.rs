// MIT License - Copyright (c) 2026 Peter Wright
// Persistent TCP connection to a device (or gateway) socket

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::Frame;
use crate::registry::DeviceDescriptor;
use crate::transport::codec::{FrameCodec, JsonLinesCodec};
use crate::transport::engine::RequestEngine;
use crate::transport::inbox::Inbox;
use crate::transport::{Connection, ConnectionFactory, Op, Request};

pub const DEFAULT_DEVICE_PORT: u16 = 6668;

/// Frames nobody waited for, per channel. Beyond this the oldest are dropped.
const UNSOLICITED_CAPACITY: usize = 64;

/// Append the default port unless the address already carries one.
pub fn socket_address(address: &str, default_port: u16) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ => format!("{address}:{default_port}"),
    }
}

/// One persistent socket, shared by a device loop and (for gateways) every
/// sub-device loop behind it.
pub struct TcpConnection {
    address: String,
    device_id: String,
    connect_timeout: Duration,
    engine: Arc<RequestEngine>,
    inbox: Arc<Inbox>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every (re)open; a timeout only tears down the socket it hit.
    generation: AtomicU64,
    /// Serializes reconnects and teardowns from concurrent loops.
    reconnect_lock: Mutex<()>,
}

impl TcpConnection {
    /// Connect and run the session opening handshake.
    pub async fn connect(
        address: String,
        device_id: String,
        codec: Arc<dyn FrameCodec>,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let connection = Self {
            address,
            device_id,
            connect_timeout,
            engine: Arc::new(RequestEngine::new(codec, response_timeout)),
            inbox: Arc::new(Inbox::new(UNSOLICITED_CAPACITY)),
            reader_handle: std::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_lock: Mutex::new(()),
        };
        connection.open().await?;
        Ok(connection)
    }

    async fn open(&self) -> Result<()> {
        info!("Connecting to {} at {}", self.device_id, self.address);

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| BridgeError::ConnectionTimeout {
                address: self.address.clone(),
            })?
            .map_err(|e| {
                error!("TCP connect to {} failed: {e}", self.address);
                BridgeError::Io(e)
            })?;
        stream.set_nodelay(true)?;
        debug!("TCP socket connected to {}", self.address);

        let (reader, writer) = stream.into_split();
        self.engine.attach(Box::new(writer)).await;
        self.generation.fetch_add(1, Ordering::AcqRel);

        let handle = spawn_reader_task(
            reader,
            self.engine.clone(),
            self.inbox.clone(),
            self.device_id.clone(),
        );
        if let Some(old) = self.swap_reader(Some(handle)) {
            old.abort();
        }

        let hello = self.engine.send(&Request::new(Op::Hello, None), true).await;
        match hello {
            Ok(Some(Frame::Error { message })) => {
                self.engine.detach().await;
                Err(BridgeError::Device(format!(
                    "{} refused session: {message}",
                    self.device_id
                )))
            }
            Ok(_) => {
                info!("Session to {} established", self.device_id);
                Ok(())
            }
            Err(e) => {
                // Leave the engine detached so a later reconnect retries the handshake.
                self.engine.detach().await;
                Err(e)
            }
        }
    }

    fn swap_reader(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut guard = self
            .reader_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, handle)
    }

    /// Stop the reader and drop the socket. Waiters fail with `ChannelClosed`.
    ///
    /// The old reader detaches the engine on exit, so it must be gone before
    /// a new socket is attached.
    async fn teardown(&self) {
        if let Some(old) = self.swap_reader(None) {
            old.abort();
            let _ = old.await;
        }
        self.engine.detach().await;
    }

    /// Tear down the socket of `generation` after it stopped answering, unless
    /// it was already replaced.
    async fn drop_silent(&self, generation: u64) {
        let _guard = self.reconnect_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        warn!("{} stopped answering, dropping the socket", self.device_id);
        self.teardown().await;
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn request(&self, request: Request) -> Result<Frame> {
        let generation = self.generation.load(Ordering::Acquire);
        match self.engine.send(&request, true).await {
            Ok(frame) => frame.ok_or(BridgeError::ChannelClosed),
            Err(e @ BridgeError::CommandTimeout { .. }) => {
                self.drop_silent(generation).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.engine.send(&request, false).await.map(|_| ())
    }

    async fn receive(&self, channel: Option<&str>, wait: Duration) -> Result<Option<Frame>> {
        if let Some(frame) = self.inbox.pop(channel) {
            return Ok(Some(frame));
        }
        if !self.engine.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        Ok(self.inbox.recv(channel, wait).await)
    }

    async fn reconnect(&self) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.engine.is_connected() {
            debug!("{} already reconnected", self.device_id);
            return Ok(());
        }
        warn!("Reconnecting to {} at {}", self.device_id, self.address);
        self.teardown().await;
        self.open().await
    }

    fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.swap_reader(None) {
            handle.abort();
        }
    }
}

/// Spawn the reader task that decodes incoming frames from the device.
fn spawn_reader_task(
    mut reader: OwnedReadHalf,
    engine: Arc<RequestEngine>,
    inbox: Arc<Inbox>,
    device_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Reader {device_id}: connection closed");
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(decoded) = engine.codec().decode(&mut pending) {
                        let inbound = match decoded {
                            Ok(inbound) => inbound,
                            Err(e) => {
                                debug!("Reader {device_id}: dropping frame: {e}");
                                continue;
                            }
                        };
                        if let Some(frame) = engine.route(inbound).await
                            && inbox.push(frame).is_some()
                        {
                            warn!("Reader {device_id}: receive queue full, dropped oldest frame");
                        }
                    }
                }
                Err(e) => {
                    error!("Reader {device_id}: read error: {e}");
                    break;
                }
            }
        }
        engine.detach().await;
    })
}

/// Opens [`TcpConnection`]s speaking [`JsonLinesCodec`].
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    pub default_port: u16,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_DEVICE_PORT,
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn open(&self, owner: &DeviceDescriptor) -> Result<Arc<dyn Connection>> {
        let connection = TcpConnection::connect(
            socket_address(&owner.address, self.default_port),
            owner.id.clone(),
            Arc::new(JsonLinesCodec::for_device(owner)),
            self.connect_timeout,
            self.response_timeout,
        )
        .await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_address() {
        assert_eq!(socket_address("10.0.0.5", 6668), "10.0.0.5:6668");
        assert_eq!(socket_address("10.0.0.5:7000", 6668), "10.0.0.5:7000");
        assert_eq!(socket_address("plug.lan", 6668), "plug.lan:6668");
        assert_eq!(socket_address("plug.lan:x", 6668), "plug.lan:x:6668");
    }

    /// Minimal adapter: answers hello/status, pushes one relayed frame after the
    /// first status, then optionally hangs up.
    async fn fake_adapter(listener: TcpListener, hang_up_after_status: bool) {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let seq = req["seq"].clone();
            let reply = match req["cmd"].as_str().unwrap() {
                "hello" => json!({"seq": seq}),
                "status" => json!({"seq": seq, "dps": {"1": true, "2": 100}}),
                _ => json!({"seq": seq}),
            };
            write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();

            if req["cmd"] == "status" {
                let push = json!({"dps": {"1": false}, "cid": "c1"});
                write.write_all(format!("{push}\n").as_bytes()).await.unwrap();
                if hang_up_after_status {
                    return;
                }
            }
        }
    }

    async fn connect_with(listener: TcpListener, hang_up: bool) -> TcpConnection {
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_adapter(listener, hang_up));
        TcpConnection::connect(
            address,
            "gw".into(),
            Arc::new(JsonLinesCodec::new("gw", "key", "3.3")),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_and_unsolicited() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connection = connect_with(listener, false).await;

        let frame = connection
            .request(Request::new(Op::Status, None))
            .await
            .unwrap();
        assert!(matches!(frame, Frame::Datapoints { cid: None, ref dps } if dps["2"] == json!(100)));

        let pushed = connection
            .receive(None, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(pushed, Frame::Datapoints { cid: Some(ref c), .. } if c == "c1"));

        assert!(connection.receive(None, Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_untagged_frames_stay_with_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connection = connect_with(listener, false).await;

        // The sub-device loop listens on c1 before anything arrives.
        assert!(connection.receive(Some("c1"), Duration::from_millis(10)).await.unwrap().is_none());

        // Unwaited status: the gateway's answer arrives untagged, then the relayed c1 frame.
        connection.send(Request::new(Op::Status, None)).await.unwrap();

        let relayed = connection
            .receive(Some("c1"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(relayed, Frame::Datapoints { cid: Some(ref c), .. } if c == "c1"));
        assert!(connection.receive(Some("c1"), Duration::from_millis(20)).await.unwrap().is_none());

        let own = connection
            .receive(None, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(own, Frame::Datapoints { cid: None, ref dps } if dps["2"] == json!(100)));
    }

    #[tokio::test]
    async fn test_silent_device_gets_new_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            // First session answers the handshake and then goes quiet with the
            // socket held open. Later sessions answer everything.
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let session = counter.fetch_add(1, Ordering::SeqCst);
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                if session == 0 {
                    let line = lines.next_line().await.unwrap().unwrap();
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let reply = json!({"seq": req["seq"]});
                    write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                    held.push((lines, write));
                    continue;
                }
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        let req: Value = serde_json::from_str(&line).unwrap();
                        let reply = json!({"seq": req["seq"], "dps": {"1": true}});
                        write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                    }
                });
            }
        });

        let connection = TcpConnection::connect(
            address,
            "plug".into(),
            Arc::new(JsonLinesCodec::new("plug", "key", "3.3")),
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let err = connection
            .request(Request::new(Op::Status, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CommandTimeout { .. }));
        assert!(!connection.is_connected());

        connection.reconnect().await.unwrap();
        let frame = connection
            .request(Request::new(Op::Status, None))
            .await
            .unwrap();
        assert!(matches!(frame, Frame::Datapoints { ref dps, .. } if dps["1"] == json!(true)));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hang_up_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connection = connect_with(listener, true).await;

        connection
            .request(Request::new(Op::Status, None))
            .await
            .unwrap();
        // The pushed frame is still delivered after the hang-up.
        assert!(connection.receive(None, Duration::from_secs(1)).await.unwrap().is_some());

        while connection.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = connection.receive(None, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_retryable());
        let err = connection
            .send(Request::new(Op::Heartbeat, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected));
    }

    #[tokio::test]
    async fn test_refused_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({"seq": req["seq"], "Err": "914", "Error": "Check device key"});
                write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let result = TcpConnection::connect(
            address,
            "plug".into(),
            Arc::new(JsonLinesCodec::new("plug", "wrong", "3.3")),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        match result {
            Err(BridgeError::Device(msg)) => assert!(msg.contains("Check device key")),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("session should be refused"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_hang_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // First session: handshake, then hang up. Second: serve normally.
            for session in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let reply = json!({"seq": req["seq"], "dps": {"1": session}});
                    write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
                    if session == 0 {
                        break;
                    }
                }
            }
        });

        let connection = TcpConnection::connect(
            address,
            "plug".into(),
            Arc::new(JsonLinesCodec::new("plug", "key", "3.3")),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        while connection.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        connection.reconnect().await.unwrap();
        assert!(connection.is_connected());
        // Reconnecting a live connection does nothing.
        connection.reconnect().await.unwrap();

        let frame = connection
            .request(Request::new(Op::Status, None))
            .await
            .unwrap();
        assert!(matches!(frame, Frame::Datapoints { ref dps, .. } if dps["1"] == json!(1)));
    }
}
