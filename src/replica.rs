use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::command::{Command, ReplConf};
use crate::connection::ConnectionError;
use crate::data::stream::IdRequest;
use crate::rdb::Rdb;
use crate::resp::Resp;
use crate::server::Shared;
use crate::utils;

fn command_frame(parts: &[&[u8]]) -> Bytes {
    Resp::Array(parts.iter().map(|p| Resp::bulk(p.to_vec())).collect()).to_bytes()
}

/// The link from a replica to its primary: the linear handshake, the RDB
/// ingestion, then the silent apply loop with offset accounting.
pub struct ReplicaLink {
    shared: Arc<Shared>,
    /// Wire bytes of array-framed commands applied since offset recording
    /// started; reported back in `REPLCONF ACK`.
    bytes_processed: u64,
    /// Set by the first `REPLCONF GETACK *`.
    recording: bool,
}

impl ReplicaLink {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            bytes_processed: 0,
            recording: false,
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let addr = self
            .shared
            .config
            .primary_addr()
            .ok_or_else(|| ConnectionError::Handshake("no primary address configured".into()))?;
        let mut tcp = TcpStream::connect(&addr).await?;
        info!(primary = %addr, "connected to primary");

        let mut buf = BytesMut::with_capacity(8192);
        self.handshake(&mut tcp, &mut buf).await?;
        self.apply_loop(&mut tcp, &mut buf).await
    }

    /// PING → PONG, `REPLCONF listening-port` → OK, `REPLCONF capa psync2`
    /// → OK, `PSYNC ? -1` → FULLRESYNC, then the snapshot payload. Any
    /// unexpected answer aborts the link.
    async fn handshake(
        &mut self,
        tcp: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        tcp.write_all(&command_frame(&[b"PING"])).await?;
        self.expect(tcp, buf, Command::Pong, "PONG").await?;

        let port = self.shared.config.port.to_string();
        tcp.write_all(&command_frame(&[
            b"REPLCONF",
            b"listening-port",
            port.as_bytes(),
        ]))
        .await?;
        self.expect(tcp, buf, Command::Ok, "OK").await?;

        tcp.write_all(&command_frame(&[b"REPLCONF", b"capa", b"psync2"]))
            .await?;
        self.expect(tcp, buf, Command::Ok, "OK").await?;

        tcp.write_all(&command_frame(&[b"PSYNC", b"?", b"-1"])).await?;
        match self.read_command(tcp, buf).await? {
            Command::FullResync { replid, offset } => {
                info!(%replid, offset, "full resync started");
            }
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "expected FULLRESYNC, got {other:?}"
                )))
            }
        }

        match self.read_command(tcp, buf).await? {
            Command::RdbFile(payload) => self.load_snapshot(&payload).await,
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "expected the RDB payload, got {other:?}"
                )))
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self, payload: &[u8]) {
        match Rdb::decode(payload) {
            Ok(rdb) => {
                let now = utils::now_ms();
                let mut store = self.shared.store.write().await;
                for entry in rdb.entries {
                    store.set(entry.key, entry.value, entry.expires_at, now);
                }
                info!(keys = store.len(), "loaded snapshot from primary");
            }
            Err(err) => warn!(%err, "snapshot from primary did not decode, starting empty"),
        }
    }

    async fn expect(
        &mut self,
        tcp: &mut TcpStream,
        buf: &mut BytesMut,
        expected: Command,
        name: &str,
    ) -> Result<(), ConnectionError> {
        let got = self.read_command(tcp, buf).await?;
        if got != expected {
            return Err(ConnectionError::Handshake(format!(
                "expected {name}, got {got:?}"
            )));
        }
        Ok(())
    }

    async fn read_command(
        &mut self,
        tcp: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<Command, ConnectionError> {
        loop {
            match Command::parse(buf) {
                Ok(Some((command, span))) => {
                    buf.advance(span);
                    return Ok(command);
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(ConnectionError::Handshake(format!("unexpected reply: {err}")))
                }
            }
            if tcp.read_buf(buf).await? == 0 {
                return Err(ConnectionError::Handshake(
                    "primary closed the connection".into(),
                ));
            }
        }
    }

    /// Steady state: apply writes silently, answer GETACK probes, track the
    /// exact wire span of every accounted command.
    async fn apply_loop(
        &mut self,
        tcp: &mut TcpStream,
        buf: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        loop {
            while let Some((frame, span)) = Resp::decode(buf)? {
                buf.advance(span);
                match Command::from_frame(frame) {
                    Ok(command) => self.apply(command, span, tcp).await?,
                    Err(err) if err.is_recoverable() => {
                        debug!(%err, "ignoring unsupported frame from primary");
                        if self.recording {
                            self.bytes_processed += span as u64;
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if tcp.read_buf(buf).await? == 0 {
                info!("primary closed the link");
                return Ok(());
            }
        }
    }

    async fn apply(
        &mut self,
        command: Command,
        span: usize,
        tcp: &mut TcpStream,
    ) -> Result<(), ConnectionError> {
        let accounted = command.should_account();
        match command {
            Command::Set(args) => {
                let now = utils::now_ms();
                let expires_at = args.expire_ms.map(|ms| now + ms);
                self.shared
                    .store
                    .write()
                    .await
                    .set(args.key, args.value, expires_at, now);
            }
            Command::XAdd(args) => match IdRequest::parse(&args.id) {
                Ok(request) => {
                    let appended = self.shared.store.write().await.xadd(
                        args.key,
                        request,
                        args.fields,
                        utils::now_ms(),
                    );
                    match appended {
                        Ok(_) => self.shared.stream_activity.notify_waiters(),
                        Err(err) => debug!(%err, "replicated XADD rejected"),
                    }
                }
                Err(err) => debug!(%err, "replicated XADD had a malformed id"),
            },
            Command::ReplConf(ReplConf::GetAck) => {
                let ack = command_frame(&[
                    b"REPLCONF",
                    b"ACK",
                    self.bytes_processed.to_string().as_bytes(),
                ]);
                tcp.write_all(&ack).await?;
                self.recording = true;
            }
            Command::Ping => {}
            // Reads and stray handshake frames are not for the apply path.
            other => debug!(command = ?other, "ignoring frame on the replica link"),
        }
        if self.recording && accounted {
            self.bytes_processed += span as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::rdb::EMPTY_RDB;
    use crate::server::Server;
    use tokio::net::TcpListener;

    async fn expect(sock: &mut TcpStream, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        sock.read_exact(&mut got).await.unwrap();
        assert_eq!(
            got,
            expected,
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&got)
        );
    }

    /// Drives the whole handshake from a scripted primary, then checks that
    /// propagated writes are applied silently and acked with exact spans.
    #[tokio::test]
    async fn handshake_apply_and_offset_accounting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let primary_port = listener.local_addr().unwrap().port();

        let config = Config {
            port: 6380,
            replicaof: Some(format!("127.0.0.1 {primary_port}")),
            ..Default::default()
        };
        let server = Server::new(config);
        let shared = server.shared();
        tokio::spawn(ReplicaLink::new(shared.clone()).run());

        let (mut primary, _) = listener.accept().await.unwrap();
        expect(&mut primary, b"*1\r\n$4\r\nPING\r\n").await;
        primary.write_all(b"+PONG\r\n").await.unwrap();

        expect(
            &mut primary,
            b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n",
        )
        .await;
        primary.write_all(b"+OK\r\n").await.unwrap();

        expect(&mut primary, b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n").await;
        primary.write_all(b"+OK\r\n").await.unwrap();

        expect(&mut primary, b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n").await;
        primary
            .write_all(b"+FULLRESYNC 8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb 0\r\n")
            .await
            .unwrap();
        let mut transfer = format!("${}\r\n", EMPTY_RDB.len()).into_bytes();
        transfer.extend_from_slice(EMPTY_RDB);
        primary.write_all(&transfer).await.unwrap();

        // A write before the first GETACK is applied but not yet counted.
        let set_foo = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        primary.write_all(set_foo).await.unwrap();
        let getack = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";
        primary.write_all(getack).await.unwrap();
        expect(&mut primary, b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$1\r\n0\r\n").await;

        // From here on every array-framed command counts: the GETACK above
        // (37 bytes) plus the next SET (31 bytes).
        let set_baz = b"*3\r\n$3\r\nSET\r\n$3\r\nbaz\r\n$3\r\n789\r\n";
        primary.write_all(set_baz).await.unwrap();
        primary.write_all(getack).await.unwrap();
        expect(&mut primary, b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n68\r\n").await;

        // Writes were applied silently.
        let store = shared.store.read().await;
        assert_eq!(store.get(b"foo", 0), Some(Bytes::from_static(b"bar")));
        assert_eq!(store.get(b"baz", 0), Some(Bytes::from_static(b"789")));
    }

    #[tokio::test]
    async fn unexpected_handshake_reply_aborts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let primary_port = listener.local_addr().unwrap().port();
        let config = Config {
            port: 6380,
            replicaof: Some(format!("127.0.0.1 {primary_port}")),
            ..Default::default()
        };
        let server = Server::new(config);
        let link = tokio::spawn(ReplicaLink::new(server.shared()).run());

        let (mut primary, _) = listener.accept().await.unwrap();
        expect(&mut primary, b"*1\r\n$4\r\nPING\r\n").await;
        primary.write_all(b"-ERR who are you\r\n").await.unwrap();

        let result = link.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Handshake(_))));
    }
}
