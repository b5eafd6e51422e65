use std::path::Path;

use bytes::Bytes;
use thiserror::Error;

pub const OP_AUX: u8 = 0xFA;
pub const OP_RESIZEDB: u8 = 0xFB;
pub const OP_EXPIRE_MS: u8 = 0xFC;
pub const OP_EXPIRE_S: u8 = 0xFD;
pub const OP_SELECTDB: u8 = 0xFE;
pub const OP_EOF: u8 = 0xFF;

const STRING_TYPE: u8 = 0x00;

/// Minimal valid RDB (header, a few aux fields, end marker + checksum).
/// Sent as the FULLRESYNC payload when no on-disk snapshot is configured.
pub const EMPTY_RDB: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, 0xfa, 0x09, 0x72, 0x65, 0x64, 0x69,
    0x73, 0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32, 0x2e, 0x30, 0xfa, 0x0a, 0x72, 0x65,
    0x64, 0x69, 0x73, 0x2d, 0x62, 0x69, 0x74, 0x73, 0xc0, 0x40, 0xfa, 0x05, 0x63, 0x74, 0x69,
    0x6d, 0x65, 0xc2, 0x6d, 0x08, 0xbc, 0x65, 0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d,
    0x65, 0x6d, 0xc2, 0xb0, 0xc4, 0x10, 0x00, 0xfa, 0x08, 0x61, 0x6f, 0x66, 0x2d, 0x62, 0x61,
    0x73, 0x65, 0xc0, 0x00, 0xff, 0xf0, 0x6e, 0x3b, 0xfe, 0xc0, 0xff, 0x5a, 0xa2,
];

#[derive(Debug, Error)]
pub enum RdbError {
    #[error("not an RDB file: bad magic bytes")]
    InvalidMagic,

    #[error("malformed RDB version field")]
    InvalidVersion,

    #[error("truncated RDB record at byte {0}")]
    Truncated(usize),

    #[error("unsupported RDB value type {0:#04x}")]
    UnsupportedValueType(u8),

    #[error("unsupported RDB string encoding {0:#04x}")]
    UnsupportedEncoding(u8),

    #[error("failed to read RDB file")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdbEntry {
    pub key: Bytes,
    pub value: Bytes,
    /// Absolute wall-clock expiry, epoch milliseconds.
    pub expires_at: Option<u64>,
}

/// A decoded snapshot: string keys only, database boundaries flattened.
#[derive(Debug)]
pub struct Rdb {
    pub version: u32,
    pub entries: Vec<RdbEntry>,
}

impl Rdb {
    pub async fn load(path: &Path) -> Result<Self, RdbError> {
        let contents = tokio::fs::read(path).await?;
        Self::decode(&contents)
    }

    pub fn decode(input: &[u8]) -> Result<Self, RdbError> {
        let mut cursor = Cursor { input, at: 0 };
        if cursor.take(5)? != b"REDIS" {
            return Err(RdbError::InvalidMagic);
        }
        let version = std::str::from_utf8(cursor.take(4)?)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or(RdbError::InvalidVersion)?;

        let mut entries = Vec::new();
        loop {
            match cursor.u8()? {
                OP_AUX => {
                    cursor.string()?;
                    cursor.string()?;
                }
                OP_SELECTDB => {
                    cursor.length()?;
                }
                OP_RESIZEDB => {
                    cursor.length()?;
                    cursor.length()?;
                }
                OP_EXPIRE_MS => {
                    let expiry = u64::from_le_bytes(cursor.array()?);
                    let value_type = cursor.u8()?;
                    entries.push(cursor.record(value_type, Some(expiry))?);
                }
                OP_EXPIRE_S => {
                    let expiry = u32::from_le_bytes(cursor.array()?) as u64 * 1_000;
                    let value_type = cursor.u8()?;
                    entries.push(cursor.record(value_type, Some(expiry))?);
                }
                OP_EOF => break,
                value_type => entries.push(cursor.record(value_type, None)?),
            }
        }
        Ok(Self { version, entries })
    }
}

struct Cursor<'a> {
    input: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, RdbError> {
        let byte = *self
            .input
            .get(self.at)
            .ok_or(RdbError::Truncated(self.at))?;
        self.at += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RdbError> {
        let end = self.at + n;
        let slice = self
            .input
            .get(self.at..end)
            .ok_or(RdbError::Truncated(self.at))?;
        self.at = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], RdbError> {
        Ok(self.take(N)?.try_into().expect("take returned N bytes"))
    }

    /// Length field: the top two bits of the first byte select the format.
    fn length(&mut self) -> Result<usize, RdbError> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok((first & 0x3F) as usize),
            0b01 => {
                let next = self.u8()?;
                Ok((((first & 0x3F) as usize) << 8) | next as usize)
            }
            0b10 => {
                let raw = self.take(4)?;
                // Some writers emit the four bytes as ASCII digits; tolerate
                // that alongside the big-endian form.
                if raw.iter().all(u8::is_ascii_digit) {
                    let text = std::str::from_utf8(raw).expect("ascii digits");
                    Ok(text.parse().expect("ascii digits fit usize"))
                } else {
                    let raw: [u8; 4] = raw.try_into().expect("4 bytes");
                    Ok(u32::from_be_bytes(raw) as usize)
                }
            }
            _ => Err(RdbError::UnsupportedEncoding(first)),
        }
    }

    /// Length-prefixed string, or one of the integer-encoded specials
    /// (`0xC0`/`0xC1`/`0xC2`) rendered as its decimal text.
    fn string(&mut self) -> Result<Bytes, RdbError> {
        let first = *self
            .input
            .get(self.at)
            .ok_or(RdbError::Truncated(self.at))?;
        if first >> 6 == 0b11 {
            self.at += 1;
            let number: i64 = match first {
                0xC0 => self.u8()? as i8 as i64,
                0xC1 => i16::from_le_bytes(self.array()?) as i64,
                0xC2 => i32::from_le_bytes(self.array()?) as i64,
                other => return Err(RdbError::UnsupportedEncoding(other)),
            };
            return Ok(Bytes::from(number.to_string()));
        }
        let len = self.length()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn record(&mut self, value_type: u8, expires_at: Option<u64>) -> Result<RdbEntry, RdbError> {
        if value_type != STRING_TYPE {
            return Err(RdbError::UnsupportedValueType(value_type));
        }
        let key = self.string()?;
        let value = self.string()?;
        Ok(RdbEntry {
            key,
            value,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_prefixed(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }

    fn fixture() -> Vec<u8> {
        let mut file = b"REDIS0011".to_vec();
        // Aux field, skipped.
        file.push(OP_AUX);
        file.extend(length_prefixed(b"redis-ver"));
        file.extend(length_prefixed(b"7.2.0"));
        // Database selector and resize hints, skipped.
        file.push(OP_SELECTDB);
        file.push(0x00);
        file.push(OP_RESIZEDB);
        file.push(0x02);
        file.push(0x01);
        // Plain string record.
        file.push(STRING_TYPE);
        file.extend(length_prefixed(b"key1"));
        file.extend(length_prefixed(b"value1"));
        // Record with a millisecond expiry.
        file.push(OP_EXPIRE_MS);
        file.extend(1_713_000_000_000u64.to_le_bytes());
        file.push(STRING_TYPE);
        file.extend(length_prefixed(b"expired"));
        file.extend(length_prefixed(b"xxx"));
        // End marker plus checksum bytes the decoder never reads.
        file.push(OP_EOF);
        file.extend([0u8; 8]);
        file
    }

    #[test]
    fn decodes_records_and_expiries() {
        let rdb = Rdb::decode(&fixture()).unwrap();
        assert_eq!(rdb.version, 11);
        assert_eq!(rdb.entries.len(), 2);
        assert_eq!(
            rdb.entries[0],
            RdbEntry {
                key: Bytes::from_static(b"key1"),
                value: Bytes::from_static(b"value1"),
                expires_at: None,
            }
        );
        assert_eq!(
            rdb.entries[1],
            RdbEntry {
                key: Bytes::from_static(b"expired"),
                value: Bytes::from_static(b"xxx"),
                expires_at: Some(1_713_000_000_000),
            }
        );
    }

    #[test]
    fn second_expiry_is_scaled_to_milliseconds() {
        let mut file = b"REDIS0011".to_vec();
        file.push(OP_EXPIRE_S);
        file.extend(1_713_000_000u32.to_le_bytes());
        file.push(STRING_TYPE);
        file.extend(length_prefixed(b"k"));
        file.extend(length_prefixed(b"v"));
        file.push(OP_EOF);
        let rdb = Rdb::decode(&file).unwrap();
        assert_eq!(rdb.entries[0].expires_at, Some(1_713_000_000_000));
    }

    #[test]
    fn integer_encoded_strings_decode_to_decimal_text() {
        let mut file = b"REDIS0011".to_vec();
        file.push(STRING_TYPE);
        file.extend(length_prefixed(b"bits"));
        file.extend([0xC0, 0x40]);
        file.push(OP_EOF);
        let rdb = Rdb::decode(&file).unwrap();
        assert_eq!(rdb.entries[0].value, Bytes::from_static(b"64"));
    }

    #[test]
    fn fourteen_bit_lengths() {
        let payload = vec![b'x'; 300];
        let mut file = b"REDIS0011".to_vec();
        file.push(STRING_TYPE);
        file.extend(length_prefixed(b"big"));
        file.push(0b0100_0000 | (300u16 >> 8) as u8);
        file.push((300u16 & 0xFF) as u8);
        file.extend(&payload);
        file.push(OP_EOF);
        let rdb = Rdb::decode(&file).unwrap();
        assert_eq!(rdb.entries[0].value.len(), 300);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(
            Rdb::decode(b"RUBIS0011\xff"),
            Err(RdbError::InvalidMagic)
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut file = fixture();
        file.truncate(file.len() - 15);
        assert!(matches!(Rdb::decode(&file), Err(RdbError::Truncated(_))));
    }

    #[test]
    fn unsupported_value_type_is_rejected() {
        let mut file = b"REDIS0011".to_vec();
        file.push(0x04);
        assert!(matches!(
            Rdb::decode(&file),
            Err(RdbError::UnsupportedValueType(0x04))
        ));
    }

    #[test]
    fn the_hardcoded_empty_rdb_decodes_to_no_entries() {
        let rdb = Rdb::decode(EMPTY_RDB).unwrap();
        assert_eq!(rdb.version, 11);
        assert!(rdb.entries.is_empty());
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        tokio::fs::write(&path, fixture()).await.unwrap();
        let rdb = Rdb::load(&path).await.unwrap();
        assert_eq!(rdb.entries.len(), 2);
    }
}
