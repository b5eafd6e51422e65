use bytes::Bytes;

use crate::data::stream::Stream;

pub mod stream;

#[derive(Debug, Clone)]
pub enum Value {
    Str(Bytes),
    Stream(Stream),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Stream(_) => "stream",
        }
    }

    pub fn as_str(&self) -> Option<&Bytes> {
        match self {
            Value::Str(payload) => Some(payload),
            Value::Stream(_) => None,
        }
    }

    pub fn as_stream(&self) -> Option<&Stream> {
        match self {
            Value::Stream(stream) => Some(stream),
            Value::Str(_) => None,
        }
    }
}

/// A keyed record: payload plus optional absolute wall-clock expiry (epoch
/// milliseconds). A record past its expiry is observed as absent by every
/// read until the sweep removes it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: Value, expires_at: Option<u64>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}
