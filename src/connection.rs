use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandError, ReplConf, SetArgs, XAddArgs, XReadArgs};
use crate::command::xread::XReadId;
use crate::data::stream::{Fields, IdRequest, StreamError, StreamId};
use crate::rdb::EMPTY_RDB;
use crate::resp::{Resp, RespError};
use crate::server::Shared;
use crate::utils;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error")]
    Io(#[from] tokio::io::Error),

    #[error(transparent)]
    Protocol(#[from] RespError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("replication handshake failed: {0}")]
    Handshake(String),
}

pub fn getack_frame() -> Bytes {
    Resp::Array(vec![
        Resp::bulk(&b"REPLCONF"[..]),
        Resp::bulk(&b"GETACK"[..]),
        Resp::bulk(&b"*"[..]),
    ])
    .to_bytes()
}

/// An XADD frame carrying the assigned identifier, for replica fan-out.
fn xadd_frame(args: &XAddArgs, id: StreamId) -> Bytes {
    let mut parts = vec![
        Resp::bulk(&b"XADD"[..]),
        Resp::Bulk(args.key.clone()),
        Resp::bulk(id.to_string()),
    ];
    for (field, value) in &args.fields {
        parts.push(Resp::Bulk(field.clone()));
        parts.push(Resp::Bulk(value.clone()));
    }
    Resp::Array(parts).to_bytes()
}

/// Reply fragment for a list of stream entries:
/// `[[id, [f1, v1, …]], …]`.
pub fn entries_reply(entries: &[(StreamId, Fields)]) -> Resp {
    Resp::Array(
        entries
            .iter()
            .map(|(id, fields)| {
                let mut flat = Vec::with_capacity(fields.len() * 2);
                for (field, value) in fields {
                    flat.push(Resp::Bulk(field.clone()));
                    flat.push(Resp::Bulk(value.clone()));
                }
                Resp::Array(vec![Resp::bulk(id.to_string()), Resp::Array(flat)])
            })
            .collect(),
    )
}

/// One accepted socket: serves the client dispatcher until (and unless) a
/// PSYNC promotes it into a replica link.
pub struct Connection {
    tcp: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
}

enum Disposition {
    Continue,
    /// PSYNC answered; the connection becomes a replica link fed from this
    /// subscription (taken out before the FULLRESYNC reply so no write
    /// frame can slip between the snapshot and the fan-out).
    Promote(broadcast::Receiver<Bytes>),
}

impl Connection {
    pub fn new(tcp: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Self {
        Self { tcp, addr, shared }
    }

    pub async fn run(mut self) {
        match self.handle().await {
            Ok(()) => debug!(addr = %self.addr, "connection closed"),
            Err(err) => warn!(addr = %self.addr, %err, "connection failed"),
        }
    }

    async fn handle(&mut self) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            while let Some((frame, span)) = Resp::decode(&buf)? {
                let raw = buf.split_to(span).freeze();
                match Command::from_frame(frame) {
                    Ok(command) => match self.dispatch(command, &raw).await? {
                        Disposition::Continue => {}
                        Disposition::Promote(rx) => return self.serve_replica(rx, buf).await,
                    },
                    Err(CommandError::Unknown(name)) => {
                        debug!(addr = %self.addr, name, "unknown command");
                        self.reply(&Resp::bulk(&b"Unknown command"[..])).await?;
                    }
                    Err(err) if err.is_recoverable() => {
                        self.reply(&Resp::error(err.to_string())).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if self.tcp.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn reply(&mut self, resp: &Resp) -> Result<(), ConnectionError> {
        self.tcp.write_all(&resp.to_bytes()).await?;
        Ok(())
    }

    /// Queues a write frame for every replica and probes them for an ack so
    /// WAIT accounting stays current.
    fn fan_out(&self, raw: &Bytes) {
        if !self.shared.is_primary() {
            return;
        }
        let replication = &self.shared.replication;
        replication.propagate_write(raw.clone());
        replication.send_frame(getack_frame());
    }

    async fn dispatch(
        &mut self,
        command: Command,
        raw: &Bytes,
    ) -> Result<Disposition, ConnectionError> {
        let reply = match command {
            Command::Ping => Some(Resp::bulk(&b"PONG"[..])),
            Command::Echo(parts) => {
                let mut joined = Vec::new();
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        joined.push(b' ');
                    }
                    joined.extend_from_slice(part);
                }
                Some(Resp::bulk(joined))
            }
            Command::Set(args) => {
                self.apply_set(&args, raw).await;
                Some(Resp::simple("OK"))
            }
            Command::Get(key) => {
                let value = self.shared.store.read().await.get(&key, utils::now_ms());
                Some(match value {
                    Some(value) => Resp::Bulk(value),
                    None => Resp::NullBulk,
                })
            }
            Command::Info(section) => Some(self.info_reply(section.as_deref())),
            Command::ConfigGet(item) => Some(self.config_reply(&item)),
            Command::Keys(pattern) => {
                let keys = if pattern.as_ref() == b"*" {
                    self.shared.store.read().await.keys(utils::now_ms())
                } else {
                    Vec::new()
                };
                Some(Resp::Array(keys.into_iter().map(Resp::Bulk).collect()))
            }
            Command::Type(key) => {
                let name = self
                    .shared
                    .store
                    .read()
                    .await
                    .type_name(&key, utils::now_ms());
                Some(Resp::bulk(name))
            }
            Command::XAdd(args) => match self.apply_xadd(&args).await {
                Ok(id) => Some(Resp::simple(id.to_string())),
                Err(err) => Some(Resp::error(err.to_string())),
            },
            Command::XRange(args) => {
                let entries = self.shared.store.read().await.xrange(
                    &args.key,
                    args.start,
                    args.end,
                    utils::now_ms(),
                );
                Some(entries_reply(&entries))
            }
            Command::XRead(args) => Some(self.handle_xread(args).await),
            Command::Wait {
                min_replicas,
                timeout_ms,
            } => Some(self.handle_wait(min_replicas, timeout_ms).await),
            Command::ReplConf(ReplConf::Ack(offset)) => {
                self.shared
                    .replication
                    .record_ack(self.addr, offset)
                    .await;
                None
            }
            Command::ReplConf(ReplConf::ListeningPort(port)) => {
                debug!(addr = %self.addr, port, "replica announced its listening port");
                Some(Resp::simple("OK"))
            }
            Command::ReplConf(ReplConf::Capa(capa)) => {
                debug!(addr = %self.addr, ?capa, "replica capabilities");
                Some(Resp::simple("OK"))
            }
            Command::ReplConf(_) => Some(Resp::simple("OK")),
            Command::Psync => {
                let rx = self.start_full_resync().await?;
                return Ok(Disposition::Promote(rx));
            }
            // Stray handshake replies are absorbed without an answer.
            Command::Ok | Command::Pong | Command::FullResync { .. } | Command::RdbFile(_) => {
                None
            }
        };
        if let Some(reply) = reply {
            self.reply(&reply).await?;
        }
        Ok(Disposition::Continue)
    }

    /// Fan-out happens under the store lock so replicas observe writes in
    /// the order the keyspace committed them.
    async fn apply_set(&self, args: &SetArgs, raw: &Bytes) {
        let now = utils::now_ms();
        let expires_at = args.expire_ms.map(|ms| now + ms);
        let mut store = self.shared.store.write().await;
        store.set(args.key.clone(), args.value.clone(), expires_at, now);
        self.fan_out(raw);
    }

    async fn apply_xadd(&self, args: &XAddArgs) -> Result<StreamId, StreamError> {
        let request = IdRequest::parse(&args.id)?;
        let now = utils::now_ms();
        let mut store = self.shared.store.write().await;
        let id = store.xadd(args.key.clone(), request, args.fields.clone(), now)?;
        // Replicas get the concrete identifier, never the client's
        // wildcard, so they apply it verbatim.
        self.fan_out(&xadd_frame(args, id));
        drop(store);
        self.shared.stream_activity.notify_waiters();
        Ok(id)
    }

    fn info_reply(&self, section: Option<&str>) -> Resp {
        match section {
            None | Some("REPLICATION") => {
                let mut lines = vec![format!(
                    "role:{}",
                    if self.shared.is_primary() {
                        "master"
                    } else {
                        "slave"
                    }
                )];
                if self.shared.is_primary() {
                    let replication = &self.shared.replication;
                    lines.push(format!("master_replid:{}", replication.id));
                    lines.push(format!("master_repl_offset:{}", replication.offset()));
                }
                Resp::bulk(lines.join("\n"))
            }
            Some(_) => Resp::bulk(&b"redis_version:0.0.1"[..]),
        }
    }

    fn config_reply(&self, item: &str) -> Resp {
        let config = &self.shared.config;
        let (name, value) = match item {
            "DIR" => ("dir", config.dir.clone()),
            "DBFILENAME" => ("dbfilename", config.dbfilename.clone()),
            _ => return Resp::Array(Vec::new()),
        };
        Resp::Array(vec![
            Resp::bulk(name),
            Resp::bulk(value.unwrap_or_default()),
        ])
    }

    async fn handle_xread(&self, args: XReadArgs) -> Resp {
        let now = utils::now_ms();
        let thresholds: Vec<StreamId> = {
            let store = self.shared.store.read().await;
            args.keys
                .iter()
                .zip(&args.ids)
                .map(|(key, id)| match id {
                    XReadId::Latest => store.last_stream_id(key, now),
                    XReadId::After(id) => *id,
                })
                .collect()
        };

        let deadline = args
            .block_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            let notified = self.shared.stream_activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reply) = self.collect_xread(&args.keys, &thresholds).await {
                return reply;
            }
            let Some(block_ms) = args.block_ms else {
                return Resp::NullBulk;
            };
            match deadline {
                None => {
                    debug_assert_eq!(block_ms, 0);
                    notified.await;
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || tokio::time::timeout(remaining, notified).await.is_err()
                    {
                        return Resp::NullBulk;
                    }
                }
            }
        }
    }

    async fn collect_xread(&self, keys: &[Bytes], thresholds: &[StreamId]) -> Option<Resp> {
        let now = utils::now_ms();
        let store = self.shared.store.read().await;
        let mut replies = Vec::new();
        for (key, after) in keys.iter().zip(thresholds) {
            let entries = store.entries_after(key, *after, now);
            if !entries.is_empty() {
                replies.push(Resp::Array(vec![
                    Resp::Bulk(key.clone()),
                    entries_reply(&entries),
                ]));
            }
        }
        (!replies.is_empty()).then(|| Resp::Array(replies))
    }

    async fn handle_wait(&self, min_replicas: usize, timeout_ms: u64) -> Resp {
        let replication = &self.shared.replication;
        let target = replication.offset();
        if target == 0 {
            return Resp::Integer(replication.replica_count().await as i64);
        }
        let mut caught_up = replication.caught_up(target).await;
        if caught_up < min_replicas {
            replication.send_frame(getack_frame());
            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            while caught_up < min_replicas && Instant::now() < deadline {
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
                caught_up = replication.caught_up(target).await;
            }
        }
        Resp::Integer(caught_up as i64)
    }

    /// PSYNC: `+FULLRESYNC <replid> <offset>` followed by the RDB payload —
    /// the on-disk snapshot when one is configured, the built-in empty
    /// snapshot otherwise.
    async fn start_full_resync(
        &mut self,
    ) -> Result<broadcast::Receiver<Bytes>, ConnectionError> {
        let replication = &self.shared.replication;
        let rx = replication.subscribe();
        let header = Resp::simple(format!(
            "FULLRESYNC {} {}",
            replication.id,
            replication.offset()
        ));
        self.tcp.write_all(&header.to_bytes()).await?;

        let snapshot = match self.shared.config.rdb_path() {
            Some(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .unwrap_or_else(|_| Bytes::from_static(EMPTY_RDB)),
            None => Bytes::from_static(EMPTY_RDB),
        };
        self.tcp
            .write_all(&Resp::File(snapshot).to_bytes())
            .await?;
        Ok(rx)
    }

    /// Fan-out loop for a promoted connection: forward propagated frames,
    /// read `REPLCONF ACK` updates back.
    async fn serve_replica(
        &mut self,
        mut rx: broadcast::Receiver<Bytes>,
        mut buf: BytesMut,
    ) -> Result<(), ConnectionError> {
        info!(addr = %self.addr, "connection promoted to replica");
        self.shared.replication.register(self.addr).await;
        // Kick the replica into offset recording right away so later WAIT
        // probes see an up-to-date ack.
        let started = self.tcp.write_all(&getack_frame()).await;

        let result = match started {
            Ok(()) => self.replica_loop(&mut rx, &mut buf).await,
            Err(err) => Err(err.into()),
        };
        self.shared.replication.unregister(self.addr).await;
        result
    }

    async fn replica_loop(
        &mut self,
        rx: &mut broadcast::Receiver<Bytes>,
        buf: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        let addr = self.addr;
        let shared = self.shared.clone();
        let (mut reader, mut writer) = self.tcp.split();
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Ok(frame) => writer.write_all(&frame).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%addr, skipped, "replica fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                read = reader.read_buf(buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    while let Some((frame, span)) = Resp::decode(buf)? {
                        buf.advance(span);
                        if let Ok(Command::ReplConf(ReplConf::Ack(offset))) =
                            Command::from_frame(frame)
                        {
                            shared.replication.record_ack(addr, offset).await;
                        }
                    }
                }
            }
        }
    }
}
