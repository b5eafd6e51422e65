use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::rdb::Rdb;
use crate::replica::ReplicaLink;
use crate::store::Store;
use crate::utils;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const PROPAGATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// Primary-side replication state: the fan-out channel plus per-replica
/// acknowledgement accounting.
#[derive(Debug)]
pub struct Replication {
    pub id: String,
    /// Cumulative bytes of write frames fanned out so far.
    offset: AtomicU64,
    /// Acknowledged offset per registered replica, keyed by peer address.
    acks: RwLock<HashMap<SocketAddr, u64>>,
    sender: broadcast::Sender<Bytes>,
}

impl Replication {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(PROPAGATION_CAPACITY);
        Self {
            id: utils::generate_replication_id(),
            offset: AtomicU64::new(0),
            acks: RwLock::new(HashMap::new()),
            sender,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Queues a raw frame for every registered replica. Write frames also
    /// advance the replication offset; GETACK probes do not.
    pub fn propagate_write(&self, frame: Bytes) {
        self.offset.fetch_add(frame.len() as u64, Ordering::Release);
        let _ = self.sender.send(frame);
    }

    pub fn send_frame(&self, frame: Bytes) {
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.sender.subscribe()
    }

    pub async fn register(&self, addr: SocketAddr) {
        self.acks.write().await.insert(addr, 0);
    }

    pub async fn unregister(&self, addr: SocketAddr) {
        self.acks.write().await.remove(&addr);
    }

    pub async fn record_ack(&self, addr: SocketAddr, offset: u64) {
        if let Some(acked) = self.acks.write().await.get_mut(&addr) {
            *acked = offset;
        } else {
            debug!(%addr, "ack from unregistered replica");
        }
    }

    pub async fn replica_count(&self) -> usize {
        self.acks.read().await.len()
    }

    /// Replicas whose acknowledged offset has reached `offset`.
    pub async fn caught_up(&self, offset: u64) -> usize {
        self.acks
            .read()
            .await
            .values()
            .filter(|acked| **acked >= offset)
            .count()
    }
}

/// State owned by the server and shared with every connection task.
#[derive(Debug)]
pub struct Shared {
    pub config: Config,
    pub role: Role,
    pub store: RwLock<Store>,
    pub replication: Replication,
    /// Woken on every XADD so blocked XREAD clients re-check their streams.
    pub stream_activity: Notify,
}

impl Shared {
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }
}

pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let role = if config.is_replica() {
            Role::Replica
        } else {
            Role::Primary
        };
        let shared = Arc::new(Shared {
            config,
            role,
            store: RwLock::new(Store::new()),
            replication: Replication::new(),
            stream_activity: Notify::new(),
        });
        Self { shared }
    }

    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Loads the snapshot and starts the background tasks (expiry sweeper,
    /// and the link to the primary when running as a replica).
    pub async fn initialize(&self) {
        self.load_rdb().await;
        self.spawn_sweeper();
        if self.shared.role == Role::Replica {
            self.spawn_replica_link();
        }
    }

    async fn load_rdb(&self) {
        let Some(path) = self.shared.config.rdb_path() else {
            return;
        };
        match Rdb::load(&path).await {
            Ok(rdb) => {
                let now = utils::now_ms();
                let mut store = self.shared.store.write().await;
                for entry in rdb.entries {
                    store.set(entry.key, entry.value, entry.expires_at, now);
                }
                info!(keys = store.len(), path = %path.display(), "loaded snapshot");
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "snapshot load failed, starting empty");
            }
        }
    }

    fn spawn_sweeper(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                shared.store.write().await.sweep(utils::now_ms());
            }
        });
    }

    fn spawn_replica_link(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(err) = ReplicaLink::new(shared).run().await {
                error!(%err, "replication link failed");
                std::process::exit(1);
            }
        });
    }

    pub async fn listen(&self) -> anyhow::Result<TcpListener> {
        let addr = format!("127.0.0.1:{}", self.shared.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("can not listen on {addr}"))?;
        info!(port = self.shared.config.port, "listening");
        Ok(listener)
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (tcp, addr) = listener.accept().await.context("accept failed")?;
            debug!(%addr, "accepted connection");
            let connection = Connection::new(tcp, addr, self.shared.clone());
            tokio::spawn(connection.run());
        }
    }
}
