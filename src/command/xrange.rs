use bytes::Bytes;

use crate::command::{bulk_at, text_at, CommandError};
use crate::data::stream::StreamId;
use crate::resp::Resp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XRangeArgs {
    pub key: Bytes,
    pub start: StreamId,
    pub end: StreamId,
}

impl XRangeArgs {
    pub fn parse(args: &[Resp]) -> Result<Self, CommandError> {
        let key = bulk_at(args, 0, "xrange")?;
        let start = parse_bound(text_at(args, 1, "xrange")?, Bound::Start)?;
        let end = parse_bound(text_at(args, 2, "xrange")?, Bound::End)?;
        Ok(Self { key, start, end })
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

/// `-`/`+` cover the whole stream; a bare `<ms>` means the lowest sequence
/// at the start bound and the highest at the end bound.
fn parse_bound(text: &str, bound: Bound) -> Result<StreamId, CommandError> {
    match text {
        "-" => return Ok(StreamId::default()),
        "+" => return Ok(StreamId::MAX),
        _ => {}
    }
    let (ms, seq) = match text.split_once('-') {
        Some((ms, seq)) => {
            let seq = seq.parse().map_err(|_| CommandError::InvalidStreamBound)?;
            (ms, seq)
        }
        None => (
            text,
            match bound {
                Bound::Start => 0,
                Bound::End => u64::MAX,
            },
        ),
    };
    let ms = ms.parse().map_err(|_| CommandError::InvalidStreamBound)?;
    Ok(StreamId::new(ms, seq))
}
