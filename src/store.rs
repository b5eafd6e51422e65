use std::collections::HashMap;

use bytes::Bytes;

use crate::data::stream::{Fields, IdRequest, Stream, StreamError, StreamId};
use crate::data::{Entry, Value};

/// The keyspace. Every operation that can observe expiry takes the current
/// wall-clock epoch in milliseconds, so callers (and tests) own the clock.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<Bytes, Entry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_entry(&self, key: &[u8], now_ms: u64) -> Option<&Entry> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now_ms))
    }

    /// String payload for `key`; `None` when the key is absent, expired, or
    /// holds a stream.
    pub fn get(&self, key: &[u8], now_ms: u64) -> Option<Bytes> {
        self.live_entry(key, now_ms)?.value.as_str().cloned()
    }

    /// Installs a string record. An already-expired instant is not
    /// installed at all (RDB loads pass absolute instants from the past).
    pub fn set(&mut self, key: Bytes, value: Bytes, expires_at: Option<u64>, now_ms: u64) {
        if matches!(expires_at, Some(at) if at <= now_ms) {
            self.entries.remove(&key);
            return;
        }
        self.entries
            .insert(key, Entry::new(Value::Str(value), expires_at));
    }

    pub fn keys(&self, now_ms: u64) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn type_name(&self, key: &[u8], now_ms: u64) -> &'static str {
        match self.live_entry(key, now_ms) {
            Some(entry) => entry.value.type_name(),
            None => "none",
        }
    }

    /// Appends to the stream at `key`, creating it if the key is absent (or
    /// expired). Fails on a key holding a string.
    pub fn xadd(
        &mut self,
        key: Bytes,
        request: IdRequest,
        fields: Fields,
        now_ms: u64,
    ) -> Result<StreamId, StreamError> {
        if self.entries.get(&key).is_some_and(|e| e.is_expired(now_ms)) {
            self.entries.remove(&key);
        }
        match self.entries.get_mut(&key) {
            Some(entry) => match &mut entry.value {
                Value::Stream(stream) => stream.append(request, fields, now_ms),
                Value::Str(_) => Err(StreamError::WrongType),
            },
            // A rejected identifier must not leave an empty stream behind.
            None => {
                let mut stream = Stream::new();
                let id = stream.append(request, fields, now_ms)?;
                self.entries
                    .insert(key, Entry::new(Value::Stream(stream), None));
                Ok(id)
            }
        }
    }

    /// Inclusive range over the stream at `key`; empty when the key is
    /// absent, expired, or not a stream.
    pub fn xrange(
        &self,
        key: &[u8],
        start: StreamId,
        end: StreamId,
        now_ms: u64,
    ) -> Vec<(StreamId, Fields)> {
        self.live_entry(key, now_ms)
            .and_then(|entry| entry.value.as_stream())
            .map(|stream| {
                stream
                    .range(start, end)
                    .into_iter()
                    .map(|(id, fields)| (id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries strictly after `after` in the stream at `key`.
    pub fn entries_after(
        &self,
        key: &[u8],
        after: StreamId,
        now_ms: u64,
    ) -> Vec<(StreamId, Fields)> {
        self.live_entry(key, now_ms)
            .and_then(|entry| entry.value.as_stream())
            .map(|stream| {
                stream
                    .entries_after(after)
                    .into_iter()
                    .map(|(id, fields)| (id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest identifier in the stream at `key`, for `XREAD … $`.
    pub fn last_stream_id(&self, key: &[u8], now_ms: u64) -> StreamId {
        self.live_entry(key, now_ms)
            .and_then(|entry| entry.value.as_stream())
            .and_then(|stream| stream.last_id())
            .unwrap_or_default()
    }

    /// Removes every record whose expiry instant has passed.
    pub fn sweep(&mut self, now_ms: u64) {
        self.entries.retain(|_, entry| !entry.is_expired(now_ms));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
