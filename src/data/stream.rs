use std::fmt;

use bytes::Bytes;
use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    ZeroIdentifier,

    /// Covers both a non-increasing identifier and a malformed one; the
    /// wire reply is the same for either.
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    InvalidIdentifier,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
}

/// `ms-seq` pair; the total order is lexicographic on the pair, which the
/// derived `Ord` over the field order provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn is_zero(&self) -> bool {
        self.ms == 0 && self.seq == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// An XADD identifier argument before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRequest {
    /// `*`: milliseconds from the clock, sequence picked by the stream.
    Auto,
    /// `<ms>-*`: fixed milliseconds, sequence picked by the stream.
    MsAuto(u64),
    /// `<ms>-<seq>`: used verbatim after validation.
    Explicit(StreamId),
}

impl IdRequest {
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        if text == "*" {
            return Ok(IdRequest::Auto);
        }
        let (ms, seq) = text.split_once('-').ok_or(StreamError::InvalidIdentifier)?;
        let ms: u64 = ms.parse().map_err(|_| StreamError::InvalidIdentifier)?;
        if seq == "*" {
            return Ok(IdRequest::MsAuto(ms));
        }
        let seq: u64 = seq.parse().map_err(|_| StreamError::InvalidIdentifier)?;
        Ok(IdRequest::Explicit(StreamId::new(ms, seq)))
    }
}

pub type Fields = Vec<(Bytes, Bytes)>;

/// Ordered stream entries plus the highest identifier observed so far.
/// Consecutive entries always carry strictly increasing identifiers.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: IndexMap<StreamId, Fields>,
    last_id: Option<StreamId>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_id(&self) -> Option<StreamId> {
        self.last_id
    }

    /// Normalizes, validates, and appends. Returns the assigned identifier.
    pub fn append(
        &mut self,
        request: IdRequest,
        fields: Fields,
        now_ms: u64,
    ) -> Result<StreamId, StreamError> {
        let id = self.normalize(request, now_ms);
        if id.is_zero() {
            return Err(StreamError::ZeroIdentifier);
        }
        if let Some(last) = self.last_id {
            if id <= last {
                return Err(StreamError::InvalidIdentifier);
            }
        }
        self.entries.insert(id, fields);
        self.last_id = Some(id);
        Ok(id)
    }

    fn normalize(&self, request: IdRequest, now_ms: u64) -> StreamId {
        match request {
            IdRequest::Explicit(id) => id,
            IdRequest::Auto => StreamId::new(now_ms, self.next_seq_for(now_ms, 0)),
            IdRequest::MsAuto(ms) => {
                let first = if ms == 0 { 1 } else { 0 };
                StreamId::new(ms, self.next_seq_for(ms, first))
            }
        }
    }

    fn next_seq_for(&self, ms: u64, first: u64) -> u64 {
        match self.last_id {
            Some(last) if last.ms == ms => last.seq + 1,
            _ => first,
        }
    }

    /// Entries with `start <= id <= end`, in identifier order.
    pub fn range(&self, start: StreamId, end: StreamId) -> Vec<(StreamId, &Fields)> {
        self.entries
            .iter()
            .filter(|(id, _)| start <= **id && **id <= end)
            .map(|(id, fields)| (*id, fields))
            .collect()
    }

    /// Entries with identifier strictly greater than `after`.
    pub fn entries_after(&self, after: StreamId) -> Vec<(StreamId, &Fields)> {
        self.entries
            .iter()
            .filter(|(id, _)| **id > after)
            .map(|(id, fields)| (*id, fields))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields<K: AsRef<[u8]>, V: AsRef<[u8]>>(pairs: &[(K, V)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    Bytes::copy_from_slice(k.as_ref()),
                    Bytes::copy_from_slice(v.as_ref()),
                )
            })
            .collect()
    }

    #[test]
    fn id_ordering_is_lexicographic_on_the_pair() {
        assert!(StreamId::new(1, 0) > StreamId::new(0, 99));
        assert!(StreamId::new(1, 2) > StreamId::new(1, 1));
        assert_eq!(StreamId::new(3, 4), StreamId::new(3, 4));
    }

    #[test]
    fn id_request_parses_all_three_forms() {
        assert_eq!(IdRequest::parse("*").unwrap(), IdRequest::Auto);
        assert_eq!(IdRequest::parse("5-*").unwrap(), IdRequest::MsAuto(5));
        assert_eq!(
            IdRequest::parse("5-3").unwrap(),
            IdRequest::Explicit(StreamId::new(5, 3))
        );
        assert!(IdRequest::parse("5").is_err());
        assert!(IdRequest::parse("abc-1").is_err());
        assert!(IdRequest::parse("*-*").is_err());
    }

    #[test]
    fn rejects_zero_identifier() {
        let mut stream = Stream::new();
        let err = stream
            .append(
                IdRequest::Explicit(StreamId::new(0, 0)),
                fields(&[(b"a", b"b")]),
                0,
            )
            .unwrap_err();
        assert_eq!(err, StreamError::ZeroIdentifier);
        assert_eq!(
            err.to_string(),
            "ERR The ID specified in XADD must be greater than 0-0"
        );
    }

    #[test]
    fn rejects_equal_or_smaller_identifier() {
        let mut stream = Stream::new();
        stream
            .append(
                IdRequest::Explicit(StreamId::new(5, 5)),
                fields(&[(b"a", b"b")]),
                0,
            )
            .unwrap();
        for id in [StreamId::new(5, 5), StreamId::new(5, 4), StreamId::new(4, 9)] {
            let err = stream
                .append(IdRequest::Explicit(id), fields(&[(b"a", b"b")]), 0)
                .unwrap_err();
            assert_eq!(err, StreamError::InvalidIdentifier);
            assert_eq!(
                err.to_string(),
                "ERR The ID specified in XADD is equal or smaller than the target stream top item"
            );
        }
    }

    #[test]
    fn wildcard_sequence_continues_the_current_millisecond() {
        let mut stream = Stream::new();
        assert_eq!(
            stream
                .append(IdRequest::MsAuto(5), fields(&[(b"a", b"1")]), 0)
                .unwrap(),
            StreamId::new(5, 0)
        );
        assert_eq!(
            stream
                .append(IdRequest::MsAuto(5), fields(&[(b"a", b"2")]), 0)
                .unwrap(),
            StreamId::new(5, 1)
        );
        // A different millisecond restarts the sequence.
        assert_eq!(
            stream
                .append(IdRequest::MsAuto(7), fields(&[(b"a", b"3")]), 0)
                .unwrap(),
            StreamId::new(7, 0)
        );
    }

    #[test]
    fn wildcard_sequence_at_millisecond_zero_starts_at_one() {
        let mut stream = Stream::new();
        assert_eq!(
            stream
                .append(IdRequest::MsAuto(0), fields(&[(b"a", b"1")]), 0)
                .unwrap(),
            StreamId::new(0, 1)
        );
    }

    #[test]
    fn full_wildcard_takes_milliseconds_from_the_clock() {
        let mut stream = Stream::new();
        assert_eq!(
            stream
                .append(IdRequest::Auto, fields(&[(b"a", b"1")]), 42)
                .unwrap(),
            StreamId::new(42, 0)
        );
        assert_eq!(
            stream
                .append(IdRequest::Auto, fields(&[(b"a", b"2")]), 42)
                .unwrap(),
            StreamId::new(42, 1)
        );
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let mut stream = Stream::new();
        for seq in 1..=3 {
            stream
                .append(
                    IdRequest::Explicit(StreamId::new(0, seq)),
                    fields(&[(b"n", seq.to_string().as_bytes())]),
                    0,
                )
                .unwrap();
        }
        let hits = stream.range(StreamId::new(0, 1), StreamId::new(0, 2));
        let ids: Vec<StreamId> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![StreamId::new(0, 1), StreamId::new(0, 2)]);
    }

    #[test]
    fn entries_after_is_strict() {
        let mut stream = Stream::new();
        for seq in 1..=3 {
            stream
                .append(
                    IdRequest::Explicit(StreamId::new(0, seq)),
                    fields(&[(b"n", b"x")]),
                    0,
                )
                .unwrap();
        }
        let ids: Vec<StreamId> = stream
            .entries_after(StreamId::new(0, 1))
            .iter()
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(ids, vec![StreamId::new(0, 2), StreamId::new(0, 3)]);
    }
}
