use bytes::Bytes;

use crate::command::CommandError;
use crate::data::stream::StreamId;
use crate::resp::Resp;

/// Identifier threshold for one stream in an XREAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XReadId {
    /// `$`: whatever the stream's last identifier is when the read starts.
    Latest,
    /// Entries strictly greater than this identifier.
    After(StreamId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XReadArgs {
    /// `BLOCK <ms>`; 0 means no deadline.
    pub block_ms: Option<u64>,
    pub keys: Vec<Bytes>,
    pub ids: Vec<XReadId>,
}

impl XReadArgs {
    pub fn parse(args: &[Resp]) -> Result<Self, CommandError> {
        let mut rest = args;
        let mut block_ms = None;

        let keyword = rest
            .first()
            .and_then(Resp::as_text)
            .ok_or(CommandError::WrongArity("xread"))?;
        if keyword.eq_ignore_ascii_case("BLOCK") {
            let ms = rest
                .get(1)
                .and_then(Resp::as_text)
                .ok_or(CommandError::WrongArity("xread"))?;
            block_ms = Some(ms.parse().map_err(|_| CommandError::NotAnInteger)?);
            rest = &rest[2..];
        }

        let keyword = rest
            .first()
            .and_then(Resp::as_text)
            .ok_or(CommandError::WrongArity("xread"))?;
        if !keyword.eq_ignore_ascii_case("STREAMS") {
            return Err(CommandError::Syntax);
        }
        rest = &rest[1..];

        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(CommandError::WrongArity("xread"));
        }
        let (keys, ids) = rest.split_at(rest.len() / 2);
        let keys = keys
            .iter()
            .map(|key| key.as_bulk().cloned().ok_or(CommandError::Syntax))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = ids
            .iter()
            .map(|id| {
                let text = id.as_text().ok_or(CommandError::Syntax)?;
                parse_id(text)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { block_ms, keys, ids })
    }
}

fn parse_id(text: &str) -> Result<XReadId, CommandError> {
    if text == "$" {
        return Ok(XReadId::Latest);
    }
    let (ms, seq) = match text.split_once('-') {
        Some((ms, seq)) => (
            ms,
            seq.parse().map_err(|_| CommandError::InvalidStreamBound)?,
        ),
        None => (text, 0),
    };
    let ms = ms.parse().map_err(|_| CommandError::InvalidStreamBound)?;
    Ok(XReadId::After(StreamId::new(ms, seq)))
}
