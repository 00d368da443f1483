use bytes::{Buf, BytesMut};

/// Largest accepted bulk string payload (512 MiB, the Redis limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest accepted array cardinality.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// +OK\r\n
    Simple(String),
    /// -ERR message\r\n
    Error(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n  or  $-1\r\n (null)
    Bulk(Option<Vec<u8>>),
    /// *2\r\n...
    Array(Vec<Value>),
}

impl Value {
    pub fn ok() -> Self {
        Value::Simple("OK".to_string())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        Value::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Value::Error(s.into())
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Value::Bulk(Some(data.into()))
    }

    pub fn null_bulk() -> Self {
        Value::Bulk(None)
    }

    /// Build the canonical request form: an array of bulk strings.
    pub fn command(parts: &[&str]) -> Self {
        Value::Array(
            parts
                .iter()
                .map(|p| Value::Bulk(Some(p.as_bytes().to_vec())))
                .collect(),
        )
    }

    /// Serialize this value to its canonical RESP byte form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::Bulk(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            Value::Bulk(Some(data)) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Value::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf);
                }
            }
        }
    }

    /// Reduce a value tree to a flat sequence of strings: arrays
    /// concatenate left-to-right, strings yield their content, integers
    /// their decimal form. This is the shape the command parser consumes.
    pub fn flatten(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<String>) {
        match self {
            Value::Simple(s) | Value::Error(s) => out.push(s.clone()),
            Value::Integer(n) => out.push(n.to_string()),
            Value::Bulk(Some(data)) => out.push(String::from_utf8_lossy(data).into_owned()),
            Value::Bulk(None) => {}
            Value::Array(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

/// Incremental RESP2 parser over an append-only byte buffer.
///
/// Call `parse()` repeatedly as data arrives. A complete value is
/// consumed from the buffer and returned; a partial trailing value
/// returns `Ok(None)` with the buffer left untouched so the caller can
/// append more bytes and retry.
pub struct Parser;

impl Parser {
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            b'+' => Self::parse_simple(buf),
            b'-' => Self::parse_err(buf),
            b':' => Self::parse_integer(buf),
            b'$' => Self::parse_bulk(buf),
            b'*' => Self::parse_array(buf),
            other => Err(RespError::BadType(other)),
        }
    }

    fn parse_simple(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        if let Some(end) = find_crlf(buf, 1) {
            let s = String::from_utf8_lossy(&buf[1..end]).into_owned();
            buf.advance(end + 2);
            Ok(Some(Value::Simple(s)))
        } else {
            Ok(None)
        }
    }

    fn parse_err(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        if let Some(end) = find_crlf(buf, 1) {
            let s = String::from_utf8_lossy(&buf[1..end]).into_owned();
            buf.advance(end + 2);
            Ok(Some(Value::Error(s)))
        } else {
            Ok(None)
        }
    }

    fn parse_integer(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        if let Some(end) = find_crlf(buf, 1) {
            let n = std::str::from_utf8(&buf[1..end])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(RespError::BadLength)?;
            buf.advance(end + 2);
            Ok(Some(Value::Integer(n)))
        } else {
            Ok(None)
        }
    }

    fn parse_bulk(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        let crlf = match find_crlf(buf, 1) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = parse_length(&buf[1..crlf])?;

        if len == -1 {
            buf.advance(crlf + 2);
            return Ok(Some(Value::Bulk(None)));
        }
        if len < -1 || len > MAX_BULK_LEN {
            return Err(RespError::BadLength);
        }

        let len = len as usize;
        let total = crlf + 2 + len + 2; // header + payload + trailing CRLF
        if buf.len() < total {
            return Ok(None);
        }

        if buf[crlf + 2 + len] != b'\r' || buf[crlf + 2 + len + 1] != b'\n' {
            return Err(RespError::BadFraming);
        }

        let data = buf[crlf + 2..crlf + 2 + len].to_vec();
        buf.advance(total);
        Ok(Some(Value::Bulk(Some(data))))
    }

    fn parse_array(buf: &mut BytesMut) -> Result<Option<Value>, RespError> {
        let crlf = match find_crlf(buf, 1) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = parse_length(&buf[1..crlf])?;
        if !(0..=MAX_ARRAY_LEN).contains(&len) {
            return Err(RespError::BadLength);
        }
        let len = len as usize;

        // Elements parse recursively; keep a restore point in case the
        // buffer holds only a prefix of them.
        let saved = buf.clone();
        buf.advance(crlf + 2);

        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            match Self::parse(buf) {
                Ok(Some(val)) => items.push(val),
                Ok(None) => {
                    *buf = saved;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Some(Value::Array(items)))
    }
}

fn parse_length(header: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(header)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(RespError::BadLength)
}

/// Find \r\n starting from the given position.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < start + 2 {
        return None;
    }
    (start..buf.len() - 1).find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
}

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("unknown RESP type byte '{}'", *.0 as char)]
    BadType(u8),

    #[error("invalid length header")]
    BadLength,

    #[error("malformed framing, missing CRLF terminator")]
    BadFraming,
}
