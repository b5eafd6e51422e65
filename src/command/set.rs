use bytes::Bytes;

use crate::command::{bulk_at, CommandError};
use crate::resp::Resp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetArgs {
    pub key: Bytes,
    pub value: Bytes,
    /// Relative time-to-live from the `PX` option, milliseconds.
    pub expire_ms: Option<u64>,
}

impl SetArgs {
    pub fn parse(args: &[Resp]) -> Result<Self, CommandError> {
        let key = bulk_at(args, 0, "set")?;
        let value = bulk_at(args, 1, "set")?;
        let mut expire_ms = None;
        let mut rest = &args[2..];
        while let Some(option) = rest.first() {
            let option = option.as_text().ok_or(CommandError::Syntax)?;
            if option.eq_ignore_ascii_case("PX") {
                let ms = rest
                    .get(1)
                    .and_then(Resp::as_text)
                    .ok_or(CommandError::WrongArity("set"))?;
                expire_ms = Some(ms.parse().map_err(|_| CommandError::NotAnInteger)?);
                rest = &rest[2..];
            } else {
                return Err(CommandError::Syntax);
            }
        }
        Ok(Self {
            key,
            value,
            expire_ms,
        })
    }
}
