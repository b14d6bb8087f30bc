// MIT License - Copyright (c) 2026 Peter Wright
// Device sessions: the capability set a bridge loop drives

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::frame::{DpValue, Frame};
use crate::registry::{DeviceDescriptor, DeviceKind};
use crate::transport::{Connection, ConnectionFactory, Op, Request};

/// What a bridge loop and command router need from a device.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Query status. Without `wait` the response shows up in [`receive`](Self::receive).
    async fn request_status(&self, wait: bool) -> Result<Option<Frame>>;

    /// Next available frame for this device, waiting only a short bound.
    ///
    /// On a shared gateway socket a sub-device sees only frames tagged with
    /// its channel id; untagged frames go to the gateway's own session.
    async fn receive(&self) -> Result<Option<Frame>>;

    async fn heartbeat(&self, wait: bool) -> Result<Option<Frame>>;

    /// Write an arbitrary value to a datapoint.
    async fn set_value(&self, index: u32, value: DpValue) -> Result<()>;

    /// Write an on/off datapoint.
    async fn set_switch(&self, index: u32, on: bool) -> Result<()>;

    /// Ask the device to refresh the listed datapoints; does not wait.
    async fn update_dps(&self, indices: &[u32]) -> Result<()>;

    /// Re-open the underlying connection.
    async fn reconnect(&self) -> Result<()>;
}

/// A device bound to a (possibly shared) connection.
///
/// Sub-device sessions tag their requests with the channel id; heartbeats go
/// untagged since they keep the gateway socket itself alive.
pub struct DeviceSession {
    conn: Arc<dyn Connection>,
    cid: Option<String>,
    receive_timeout: Duration,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("cid", &self.cid)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(conn: Arc<dyn Connection>, cid: Option<String>, receive_timeout: Duration) -> Self {
        Self {
            conn,
            cid,
            receive_timeout,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn cid(&self) -> Option<&str> {
        self.cid.as_deref()
    }

    fn request(&self, op: Op) -> Request {
        Request::new(op, self.cid.as_deref())
    }

    async fn write(&self, op: Op) -> Result<()> {
        let name = op.name();
        match self.conn.request(self.request(op)).await? {
            Frame::Error { message } => Err(BridgeError::Device(format!("{name} rejected: {message}"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceLink for DeviceSession {
    async fn request_status(&self, wait: bool) -> Result<Option<Frame>> {
        if wait {
            self.conn.request(self.request(Op::Status)).await.map(Some)
        } else {
            self.conn.send(self.request(Op::Status)).await.map(|_| None)
        }
    }

    async fn receive(&self) -> Result<Option<Frame>> {
        self.conn.receive(self.cid.as_deref(), self.receive_timeout).await
    }

    async fn heartbeat(&self, wait: bool) -> Result<Option<Frame>> {
        let request = Request::new(Op::Heartbeat, None);
        if wait {
            self.conn.request(request).await.map(Some)
        } else {
            self.conn.send(request).await.map(|_| None)
        }
    }

    async fn set_value(&self, index: u32, value: DpValue) -> Result<()> {
        self.write(Op::SetValue {
            index,
            value: value.to_json(),
        })
        .await
    }

    async fn set_switch(&self, index: u32, on: bool) -> Result<()> {
        self.write(Op::SetSwitch { index, on }).await
    }

    async fn update_dps(&self, indices: &[u32]) -> Result<()> {
        self.conn
            .send(self.request(Op::UpdateDps {
                indices: indices.to_vec(),
            }))
            .await
    }

    async fn reconnect(&self) -> Result<()> {
        self.conn.reconnect().await
    }
}

/// Opens device sessions, sharing one connection per gateway.
///
/// The gateway connection is opened by whichever of its devices connects
/// first and reused by the rest. A failed open leaves nothing cached.
pub struct Connector {
    factory: Arc<dyn ConnectionFactory>,
    owners: HashMap<String, DeviceDescriptor>,
    cells: HashMap<String, OnceCell<Arc<dyn Connection>>>,
    receive_timeout: Duration,
}

impl Connector {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        devices: &[DeviceDescriptor],
        receive_timeout: Duration,
    ) -> Self {
        let owners: HashMap<String, DeviceDescriptor> = devices
            .iter()
            .filter(|d| !matches!(d.kind, DeviceKind::SubDevice { .. }))
            .map(|d| (d.id.clone(), d.clone()))
            .collect();
        let cells = owners.keys().map(|id| (id.clone(), OnceCell::new())).collect();
        Self {
            factory,
            owners,
            cells,
            receive_timeout,
        }
    }

    pub async fn connect(&self, device: &DeviceDescriptor) -> Result<DeviceSession> {
        let owner_id = device.connection_owner();
        let (Some(owner), Some(cell)) = (self.owners.get(owner_id), self.cells.get(owner_id)) else {
            return Err(BridgeError::UnknownDevice {
                id: owner_id.to_string(),
            });
        };

        let conn = cell
            .get_or_try_init(|| async {
                info!("Opening connection to {} ({})", owner.name, owner.address);
                self.factory.open(owner).await
            })
            .await?
            .clone();

        if let Some(cid) = device.cid() {
            debug!("{} bound to gateway {} as cid {cid}", device.name, owner.name);
        }
        Ok(DeviceSession::new(
            conn,
            device.cid().map(str::to_string),
            self.receive_timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceRecord, SubDeviceRecord};
    use crate::registry::Registry;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every request; answers waited requests with `Frame::Empty`.
    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<(Request, bool)>>,
        channels: Mutex<Vec<Option<String>>>,
        reject_writes: bool,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn request(&self, request: Request) -> Result<Frame> {
            let write = matches!(request.op, Op::SetValue { .. } | Op::SetSwitch { .. });
            self.sent.lock().unwrap().push((request, true));
            if write && self.reject_writes {
                Ok(Frame::error("bad dps"))
            } else {
                Ok(Frame::Empty)
            }
        }

        async fn send(&self, request: Request) -> Result<()> {
            self.sent.lock().unwrap().push((request, false));
            Ok(())
        }

        async fn receive(&self, channel: Option<&str>, _wait: Duration) -> Result<Option<Frame>> {
            self.channels.lock().unwrap().push(channel.map(str::to_string));
            Ok(None)
        }

        async fn reconnect(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn open(&self, _owner: &DeviceDescriptor) -> Result<Arc<dyn Connection>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(RecordingConnection::default()))
        }
    }

    fn registry() -> Registry {
        let gateway = DeviceRecord {
            name: "Hub".into(),
            id: "gw1".into(),
            ip: "10.0.0.2".into(),
            key: "k".into(),
            version: "3.3".into(),
            sub_devices: Some(
                ["Lamp", "Fan", "Heater"]
                    .iter()
                    .enumerate()
                    .map(|(i, name)| SubDeviceRecord {
                        name: (*name).into(),
                        id: format!("sub{i}"),
                        cid: format!("c{i}"),
                    })
                    .collect(),
            ),
            refresh_dps: None,
        };
        let plug = DeviceRecord {
            name: "Plug".into(),
            id: "plug1".into(),
            ip: "10.0.0.3".into(),
            key: "k".into(),
            version: "3.3".into(),
            sub_devices: None,
            refresh_dps: None,
        };
        Registry::from_inventory(vec![gateway, plug]).unwrap()
    }

    #[tokio::test]
    async fn test_gateway_connection_shared() {
        let registry = registry();
        let factory = Arc::new(CountingFactory::default());
        let connector = Connector::new(factory.clone(), registry.devices(), Duration::from_millis(10));

        let gateway = connector.connect(registry.get("gw1").unwrap()).await.unwrap();
        let mut subs = Vec::new();
        for id in ["sub0", "sub1", "sub2"] {
            subs.push(connector.connect(registry.get(id).unwrap()).await.unwrap());
        }
        let plug = connector.connect(registry.get("plug1").unwrap()).await.unwrap();

        for sub in &subs {
            assert!(Arc::ptr_eq(sub.connection(), gateway.connection()));
        }
        assert!(!Arc::ptr_eq(plug.connection(), gateway.connection()));
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
        assert_eq!(subs[1].cid(), Some("c1"));
        assert_eq!(gateway.cid(), None);
    }

    #[tokio::test]
    async fn test_sub_device_heartbeat_untagged() {
        let conn = Arc::new(RecordingConnection::default());
        let session = DeviceSession::new(conn.clone(), Some("c1".into()), Duration::from_millis(10));

        session.heartbeat(false).await.unwrap();
        session.request_status(false).await.unwrap();
        session.update_dps(&[20]).await.unwrap();
        session.receive().await.unwrap();

        // Receives are scoped to the sub-device's channel.
        assert_eq!(*conn.channels.lock().unwrap(), vec![Some("c1".to_string())]);

        let sent = conn.sent.lock().unwrap();
        assert_eq!(sent[0], (Request::new(Op::Heartbeat, None), false));
        assert_eq!(sent[1], (Request::new(Op::Status, Some("c1")), false));
        assert_eq!(
            sent[2],
            (Request::new(Op::UpdateDps { indices: vec![20] }, Some("c1")), false)
        );
    }

    #[tokio::test]
    async fn test_rejected_write() {
        let conn = Arc::new(RecordingConnection {
            reject_writes: true,
            ..Default::default()
        });
        let session = DeviceSession::new(conn.clone(), None, Duration::from_millis(10));

        let err = session.set_switch(1, true).await.unwrap_err();
        assert!(matches!(err, BridgeError::Device(ref m) if m.contains("bad dps")));
        assert!(!err.is_retryable());

        // Refresh requests are not acknowledged, so nothing to reject.
        session.update_dps(&[1]).await.unwrap();
        assert_eq!(conn.sent.lock().unwrap().len(), 2);
    }
}
