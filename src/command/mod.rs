use bytes::Bytes;
use thiserror::Error;

use crate::resp::{Resp, RespError};

pub mod set;
pub mod xadd;
pub mod xrange;
pub mod xread;

pub use set::SetArgs;
pub use xadd::XAddArgs;
pub use xrange::XRangeArgs;
pub use xread::XReadArgs;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] RespError),

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("frame is not a command")]
    NotACommand,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR Invalid stream ID specified as stream command argument")]
    InvalidStreamBound,

    #[error("ERR syntax error")]
    Syntax,
}

impl CommandError {
    /// Argument-level errors keep the connection open and reply `-ERR …`;
    /// everything else is a framing problem that closes it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CommandError::Unknown(_)
                | CommandError::WrongArity(_)
                | CommandError::NotAnInteger
                | CommandError::InvalidStreamBound
                | CommandError::Syntax
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplConf {
    ListeningPort(u16),
    Capa(Vec<String>),
    GetAck,
    Ack(u64),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Echo(Vec<Bytes>),
    Set(SetArgs),
    Get(Bytes),
    Info(Option<String>),
    ConfigGet(String),
    Keys(Bytes),
    Type(Bytes),
    XAdd(XAddArgs),
    XRange(XRangeArgs),
    XRead(XReadArgs),
    Wait {
        min_replicas: usize,
        timeout_ms: u64,
    },
    ReplConf(ReplConf),
    Psync,
    // Frames the replica link receives from the primary.
    Pong,
    Ok,
    FullResync {
        replid: String,
        offset: i64,
    },
    RdbFile(Bytes),
}

fn bulk_at(args: &[Resp], at: usize, command: &'static str) -> Result<Bytes, CommandError> {
    args.get(at)
        .and_then(Resp::as_bulk)
        .cloned()
        .ok_or(CommandError::WrongArity(command))
}

fn text_at<'a>(
    args: &'a [Resp],
    at: usize,
    command: &'static str,
) -> Result<&'a str, CommandError> {
    args.get(at)
        .and_then(Resp::as_text)
        .ok_or(CommandError::WrongArity(command))
}

impl Command {
    /// Decodes one command from the front of `input`. `Ok(None)` means the
    /// buffer holds only a partial frame; the span is the frame's exact
    /// byte count on the wire.
    pub fn parse(input: &[u8]) -> Result<Option<(Self, usize)>, CommandError> {
        match Resp::decode(input)? {
            Some((frame, span)) => Ok(Some((Self::from_frame(frame)?, span))),
            None => Ok(None),
        }
    }

    pub fn from_frame(frame: Resp) -> Result<Self, CommandError> {
        match frame {
            Resp::Array(items) => Self::from_array(&items),
            Resp::Simple(text) => Self::from_simple(&text),
            // A top-level bulk reply (`$4\r\nPONG\r\n`) reads like a simple
            // string for handshake purposes.
            Resp::Bulk(payload) => {
                let text = std::str::from_utf8(&payload).map_err(|_| CommandError::NotACommand)?;
                Self::from_simple(text)
            }
            Resp::File(payload) => Ok(Command::RdbFile(payload)),
            _ => Err(CommandError::NotACommand),
        }
    }

    /// Simple-string frames split on whitespace: first token is the command
    /// name, the rest are arguments. The replica link parses `PONG`, `OK`,
    /// and `FULLRESYNC <replid> <offset>` uniformly this way.
    fn from_simple(text: &str) -> Result<Self, CommandError> {
        let mut tokens = text.split_whitespace();
        let name = tokens.next().unwrap_or_default().to_ascii_uppercase();
        match name.as_str() {
            "PONG" => Ok(Command::Pong),
            "OK" => Ok(Command::Ok),
            "PING" => Ok(Command::Ping),
            "FULLRESYNC" => {
                let replid = tokens
                    .next()
                    .ok_or(CommandError::WrongArity("fullresync"))?
                    .to_string();
                let offset = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or(CommandError::WrongArity("fullresync"))?;
                Ok(Command::FullResync { replid, offset })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    fn from_array(items: &[Resp]) -> Result<Self, CommandError> {
        let name = items
            .first()
            .and_then(Resp::as_text)
            .ok_or(CommandError::NotACommand)?
            .to_ascii_uppercase();
        let args = &items[1..];
        match name.as_str() {
            "PING" => Ok(Command::Ping),
            "ECHO" => {
                if args.is_empty() {
                    return Err(CommandError::WrongArity("echo"));
                }
                let parts = args
                    .iter()
                    .map(|arg| arg.as_bulk().cloned().ok_or(CommandError::Syntax))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Command::Echo(parts))
            }
            "SET" => Ok(Command::Set(SetArgs::parse(args)?)),
            "GET" => Ok(Command::Get(bulk_at(args, 0, "get")?)),
            "INFO" => Ok(Command::Info(
                args.first()
                    .and_then(Resp::as_text)
                    .map(|s| s.to_ascii_uppercase()),
            )),
            "CONFIG" => {
                let sub = text_at(args, 0, "config")?;
                if !sub.eq_ignore_ascii_case("GET") {
                    return Err(CommandError::Syntax);
                }
                Ok(Command::ConfigGet(
                    text_at(args, 1, "config")?.to_ascii_uppercase(),
                ))
            }
            "KEYS" => Ok(Command::Keys(bulk_at(args, 0, "keys")?)),
            "TYPE" => Ok(Command::Type(bulk_at(args, 0, "type")?)),
            "XADD" => Ok(Command::XAdd(XAddArgs::parse(args)?)),
            "XRANGE" => Ok(Command::XRange(XRangeArgs::parse(args)?)),
            "XREAD" => Ok(Command::XRead(XReadArgs::parse(args)?)),
            "WAIT" => {
                let min_replicas = text_at(args, 0, "wait")?
                    .parse()
                    .map_err(|_| CommandError::NotAnInteger)?;
                let timeout_ms = text_at(args, 1, "wait")?
                    .parse()
                    .map_err(|_| CommandError::NotAnInteger)?;
                Ok(Command::Wait {
                    min_replicas,
                    timeout_ms,
                })
            }
            "REPLCONF" => {
                let sub = text_at(args, 0, "replconf")?.to_ascii_uppercase();
                let conf = match sub.as_str() {
                    "LISTENING-PORT" => {
                        let port = text_at(args, 1, "replconf")?
                            .parse()
                            .map_err(|_| CommandError::NotAnInteger)?;
                        ReplConf::ListeningPort(port)
                    }
                    "CAPA" => ReplConf::Capa(
                        args[1..]
                            .iter()
                            .filter_map(Resp::as_text)
                            .map(str::to_string)
                            .collect(),
                    ),
                    "GETACK" => ReplConf::GetAck,
                    "ACK" => {
                        let offset = text_at(args, 1, "replconf")?
                            .parse()
                            .map_err(|_| CommandError::NotAnInteger)?;
                        ReplConf::Ack(offset)
                    }
                    _ => ReplConf::Other,
                };
                Ok(Command::ReplConf(conf))
            }
            "PSYNC" => Ok(Command::Psync),
            "OK" => Ok(Command::Ok),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Writes are fanned out to replicas.
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set(_) | Command::XAdd(_))
    }

    /// Only array-framed commands count toward the replica's applied-bytes
    /// offset; handshake replies and the RDB payload do not.
    pub fn should_account(&self) -> bool {
        !matches!(
            self,
            Command::Pong | Command::Ok | Command::FullResync { .. } | Command::RdbFile(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(mut input: &[u8]) -> Vec<(Command, usize)> {
        let mut parsed = Vec::new();
        while let Some((command, span)) = Command::parse(input).unwrap() {
            parsed.push((command, span));
            input = &input[span..];
        }
        parsed
    }

    #[test]
    fn parses_set_from_wire_bytes() {
        let wire = b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n";
        let (command, span) = Command::parse(wire).unwrap().unwrap();
        assert_eq!(span, wire.len());
        let Command::Set(set) = command else {
            panic!("expected SET, got {command:?}");
        };
        assert_eq!(set.key, Bytes::from_static(b"mykey"));
        assert_eq!(set.value, Bytes::from_static(b"myvalue"));
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let wire = b"*2\r\n$3\r\nget\r\n$3\r\nfoo\r\n";
        let (command, _) = Command::parse(wire).unwrap().unwrap();
        assert_eq!(command, Command::Get(Bytes::from_static(b"foo")));
    }

    #[test]
    fn pipelined_commands_parse_with_exact_spans() {
        let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nbar\r\n$3\r\n456\r\n*3\r\n$3\r\nSET\r\n$3\r\nbaz\r\n$3\r\n789\r\n";
        let parsed = parse_all(wire);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1 + parsed[1].1, wire.len());
        assert!(parsed.iter().all(|(c, _)| c.is_write()));
    }

    #[test]
    fn simple_strings_split_into_name_and_arguments() {
        assert_eq!(
            Command::parse(b"+PONG\r\n").unwrap().unwrap().0,
            Command::Pong
        );
        assert_eq!(Command::parse(b"+OK\r\n").unwrap().unwrap().0, Command::Ok);
        let (command, _) = Command::parse(b"+FULLRESYNC 8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb 0\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::FullResync {
                replid: "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb".to_string(),
                offset: 0,
            }
        );
    }

    #[test]
    fn bulk_handshake_replies_read_like_simple_strings() {
        assert_eq!(
            Command::parse(b"$4\r\nPONG\r\n").unwrap().unwrap().0,
            Command::Pong
        );
        assert_eq!(
            Command::parse(b"$2\r\nOK\r\n").unwrap().unwrap().0,
            Command::Ok
        );
    }

    #[test]
    fn rdb_blob_followed_by_command_parses_as_two() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"$5\r\nREDIS");
        wire.extend_from_slice(b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n");
        let parsed = parse_all(&wire);
        assert_eq!(parsed[0].0, Command::RdbFile(Bytes::from_static(b"REDIS")));
        assert!(!parsed[0].0.should_account());
        assert_eq!(parsed[1].0, Command::ReplConf(ReplConf::GetAck));
        assert!(parsed[1].0.should_account());
        assert_eq!(parsed[1].1, 37);
    }

    #[test]
    fn replconf_subcommands() {
        let (command, _) = Command::parse(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(command, Command::ReplConf(ReplConf::ListeningPort(6380)));

        let (command, _) = Command::parse(b"*3\r\n$8\r\nREPLCONF\r\n$3\r\nACK\r\n$2\r\n37\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(command, Command::ReplConf(ReplConf::Ack(37)));
    }

    #[test]
    fn unknown_commands_are_recoverable() {
        let err = Command::parse(b"*1\r\n$5\r\nFLUSH\r\n").unwrap_err();
        assert!(matches!(err, CommandError::Unknown(ref name) if name == "FLUSH"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn framing_errors_are_not_recoverable() {
        let err = Command::parse(b"!bogus\r\n").unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn partial_input_asks_for_more() {
        assert!(Command::parse(b"*2\r\n$4\r\nECHO\r\n").unwrap().is_none());
    }

    #[test]
    fn wait_parses_its_two_integers() {
        let (command, _) = Command::parse(b"*3\r\n$4\r\nWAIT\r\n$1\r\n2\r\n$3\r\n500\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::Wait {
                min_replicas: 2,
                timeout_ms: 500,
            }
        );
    }
}
