use bytes::Bytes;

use crate::command::{bulk_at, text_at, CommandError};
use crate::data::stream::Fields;
use crate::resp::Resp;

/// `XADD key id field value [field value …]`. The identifier stays raw text
/// here; the handler normalizes it so identifier errors produce the stream
/// error replies rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAddArgs {
    pub key: Bytes,
    pub id: String,
    pub fields: Fields,
}

impl XAddArgs {
    pub fn parse(args: &[Resp]) -> Result<Self, CommandError> {
        let key = bulk_at(args, 0, "xadd")?;
        let id = text_at(args, 1, "xadd")?.to_string();
        let rest = &args[2..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return Err(CommandError::WrongArity("xadd"));
        }
        let mut fields = Fields::with_capacity(rest.len() / 2);
        for pair in rest.chunks(2) {
            let field = pair[0].as_bulk().ok_or(CommandError::Syntax)?.clone();
            let value = pair[1].as_bulk().ok_or(CommandError::Syntax)?.clone();
            fields.push((field, value));
        }
        Ok(Self { key, id, fields })
    }
}
