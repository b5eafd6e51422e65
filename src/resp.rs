use std::str::{from_utf8, Utf8Error};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const CRLF: &[u8] = b"\r\n";

/// One RESP frame. Payloads are byte-strings; only frame text that the
/// protocol itself defines as ASCII (simple strings, errors) is `String`.
///
/// `File` is the FULLRESYNC RDB transfer: `$<len>\r\n<bytes>` with no
/// trailing CRLF. It only ever appears at the top level of a stream; a
/// top-level `$` frame that does carry a CRLF terminator (the bulk `PONG`
/// handshake reply, for instance) decodes as an ordinary bulk string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Resp>),
    File(Bytes),
}

#[derive(Debug, Error)]
pub enum RespError {
    #[error("unsupported frame leader: {0}")]
    UnsupportedLeader(char),

    #[error("frame text is not valid UTF-8")]
    NotUtf8(#[from] Utf8Error),

    #[error("malformed integer in frame")]
    NotAnInteger(#[from] std::num::ParseIntError),

    #[error("negative element count")]
    NegativeCount,

    #[error("bulk payload is not terminated with CRLF")]
    MissingCrlf,
}

/// Line up to the next CRLF, starting at `at`. `None` means the buffer does
/// not hold a complete line yet.
fn read_line(input: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let rel = input[at..].windows(2).position(|w| w == CRLF)?;
    Some((&input[at..at + rel], at + rel + 2))
}

fn read_integer(line: &[u8]) -> Result<i64, RespError> {
    Ok(from_utf8(line)?.parse()?)
}

impl Resp {
    /// Decodes one frame from the front of `input`.
    ///
    /// Returns the frame together with the exact number of bytes it occupied
    /// on the wire; the replica link reports that span back in
    /// `REPLCONF ACK`. `Ok(None)` means the buffer holds only a partial
    /// frame and more bytes are needed; errors mean the connection is
    /// unrecoverable.
    pub fn decode(input: &[u8]) -> Result<Option<(Self, usize)>, RespError> {
        if input.is_empty() {
            return Ok(None);
        }
        match input[0] {
            b'$' => {
                let Some((line, payload_at)) = read_line(input, 1) else {
                    return Ok(None);
                };
                let len = read_integer(line)?;
                if len < 0 {
                    return Ok(Some((Resp::NullBulk, payload_at)));
                }
                let end = payload_at + len as usize;
                if input.len() < end {
                    return Ok(None);
                }
                let payload = &input[payload_at..end];
                // The FULLRESYNC snapshot carries no trailing CRLF and is
                // recognized by its magic, so it is never held back waiting
                // for a terminator that will not come. Any other top-level
                // `$` frame is a bulk string when a CRLF follows.
                if payload.starts_with(b"REDIS") {
                    let payload = Bytes::copy_from_slice(payload);
                    return Ok(Some((Resp::File(payload), end)));
                }
                if input.len() < end + CRLF.len() {
                    return Ok(None);
                }
                let payload = Bytes::copy_from_slice(payload);
                if &input[end..end + CRLF.len()] == CRLF {
                    Ok(Some((Resp::Bulk(payload), end + CRLF.len())))
                } else {
                    Ok(Some((Resp::File(payload), end)))
                }
            }
            _ => Self::decode_element(input, 0),
        }
    }

    /// Decodes a frame in reply/element position, where `$` carries a
    /// CRLF-terminated bulk string. Returns the frame and the index one past
    /// its final byte.
    fn decode_element(input: &[u8], at: usize) -> Result<Option<(Self, usize)>, RespError> {
        let Some(&leader) = input.get(at) else {
            return Ok(None);
        };
        match leader {
            b'+' => {
                let Some((line, next)) = read_line(input, at + 1) else {
                    return Ok(None);
                };
                Ok(Some((Resp::Simple(from_utf8(line)?.to_string()), next)))
            }
            b'-' => {
                let Some((line, next)) = read_line(input, at + 1) else {
                    return Ok(None);
                };
                Ok(Some((Resp::Error(from_utf8(line)?.to_string()), next)))
            }
            b':' => {
                let Some((line, next)) = read_line(input, at + 1) else {
                    return Ok(None);
                };
                Ok(Some((Resp::Integer(read_integer(line)?), next)))
            }
            b'$' => {
                let Some((line, payload_at)) = read_line(input, at + 1) else {
                    return Ok(None);
                };
                let len = read_integer(line)?;
                if len < 0 {
                    return Ok(Some((Resp::NullBulk, payload_at)));
                }
                let end = payload_at + len as usize;
                if input.len() < end + CRLF.len() {
                    return Ok(None);
                }
                if &input[end..end + CRLF.len()] != CRLF {
                    return Err(RespError::MissingCrlf);
                }
                let payload = Bytes::copy_from_slice(&input[payload_at..end]);
                Ok(Some((Resp::Bulk(payload), end + CRLF.len())))
            }
            b'*' => {
                let Some((line, mut next)) = read_line(input, at + 1) else {
                    return Ok(None);
                };
                let count = read_integer(line)?;
                if count < 0 {
                    return Err(RespError::NegativeCount);
                }
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    match Self::decode_element(input, next)? {
                        Some((element, after)) => {
                            elements.push(element);
                            next = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Resp::Array(elements), next)))
            }
            other => Err(RespError::UnsupportedLeader(other as char)),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Resp::Simple(text) => {
                dst.put_u8(b'+');
                dst.put_slice(text.as_bytes());
                dst.put_slice(CRLF);
            }
            Resp::Error(text) => {
                dst.put_u8(b'-');
                dst.put_slice(text.as_bytes());
                dst.put_slice(CRLF);
            }
            Resp::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            Resp::Bulk(payload) => {
                dst.put_u8(b'$');
                dst.put_slice(payload.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(payload);
                dst.put_slice(CRLF);
            }
            Resp::NullBulk => dst.put_slice(b"$-1\r\n"),
            Resp::Array(elements) => {
                dst.put_u8(b'*');
                dst.put_slice(elements.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                for element in elements {
                    element.encode(dst);
                }
            }
            Resp::File(payload) => {
                dst.put_u8(b'$');
                dst.put_slice(payload.len().to_string().as_bytes());
                dst.put_slice(CRLF);
                dst.put_slice(payload);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn simple(text: impl Into<String>) -> Self {
        Resp::Simple(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Resp::Error(text.into())
    }

    pub fn bulk(payload: impl Into<Bytes>) -> Self {
        Resp::Bulk(payload.into())
    }

    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Resp::Bulk(payload) => Some(payload),
            _ => None,
        }
    }

    /// Bulk or simple payload as text, where a command argument is expected
    /// to be ASCII (command names, option words, integers on the wire).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Resp::Bulk(payload) => from_utf8(payload).ok(),
            Resp::Simple(text) => Some(text),
            _ => None,
        }
    }
}
