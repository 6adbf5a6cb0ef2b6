//! RESP2 framing for `tokio_util::codec::Framed`.
//!
//! The same codec serves both directions: commands are encoded as arrays of
//! bulk strings, and replies (including pub/sub pushes) are decoded into
//! [`RespValue`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BusError;

/// Largest bulk string accepted from the wire.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest array accepted from the wire.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// A decoded RESP2 value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`
    Bulk(Bytes),
    /// `$-1` or `*-1`
    Nil,
    /// `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Bulk string from text.
    pub fn bulk(s: impl AsRef<[u8]>) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_ref()))
    }

    /// Command as an array of bulk strings.
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self::Array(args.into_iter().map(Self::bulk).collect())
    }

    /// Text of a simple or bulk string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Simple(s) => Some(s),
            Self::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// RESP2 codec.
///
/// Decoding first scans for a complete frame, resuming where the previous
/// call stopped, and only then builds the value. A large reply arriving in
/// many reads is scanned once.
#[derive(Clone, Debug, Default)]
pub struct RespCodec {
    scan: Scan,
}

/// Progress through an incomplete frame.
#[derive(Clone, Debug, Default)]
struct Scan {
    /// Offset of the next unscanned element.
    pos: usize,
    /// Elements still expected by each enclosing array, innermost last.
    open: Vec<i64>,
}

impl Scan {
    /// Advance over complete elements. Returns the frame length once the
    /// outermost value is complete.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<usize>, BusError> {
        loop {
            let Some((header, next)) = header(buf, self.pos)? else {
                return Ok(None);
            };
            let element_end = match header {
                Header::Array(count) if count > 0 => {
                    self.open.push(count);
                    self.pos = next;
                    continue;
                }
                Header::Bulk(len) => {
                    let end = next + len;
                    if buf.len() < end + 2 {
                        return Ok(None);
                    }
                    end + 2
                }
                Header::Array(_) | Header::Line => next,
            };
            self.pos = element_end;
            if self.close_element() {
                return Ok(Some(element_end));
            }
        }
    }

    /// Count one finished element against the open arrays. Returns `true`
    /// when the outermost value is done.
    fn close_element(&mut self) -> bool {
        while let Some(remaining) = self.open.last_mut() {
            *remaining -= 1;
            if *remaining > 0 {
                return false;
            }
            let _ = self.open.pop();
        }
        true
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, BusError> {
        if self.scan.advance(src)?.is_none() {
            return Ok(None);
        }
        self.scan = Scan::default();
        match parse(src, 0)? {
            Some((value, end)) => {
                src.advance(end);
                Ok(Some(value))
            }
            None => Err(BusError::Protocol("frame ended early".into())),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = BusError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), BusError> {
        write_value(&item, dst);
        Ok(())
    }
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::Simple(s) => write_line(dst, b'+', s.as_bytes()),
        RespValue::Error(s) => write_line(dst, b'-', s.as_bytes()),
        RespValue::Integer(n) => write_line(dst, b':', n.to_string().as_bytes()),
        RespValue::Nil => dst.put_slice(b"$-1\r\n"),
        RespValue::Bulk(b) => {
            write_line(dst, b'$', b.len().to_string().as_bytes());
            dst.put_slice(b);
            dst.put_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            write_line(dst, b'*', items.len().to_string().as_bytes());
            for item in items {
                write_value(item, dst);
            }
        }
    }
}

fn write_line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

enum Header {
    /// Simple string, error or integer: complete with its line.
    Line,
    /// Bulk string of this many bytes, nil excluded.
    Bulk(usize),
    /// Array of this many elements; zero or negative is complete already.
    Array(i64),
}

/// Read the type byte and line at `pos`. Returns the header and the offset
/// just past the line, or `None` if more bytes are needed.
fn header(buf: &[u8], pos: usize) -> Result<Option<(Header, usize)>, BusError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    let next = line_end + 2;

    let header = match tag {
        b'+' | b'-' => Header::Line,
        b':' => {
            let _ = integer(line)?;
            Header::Line
        }
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                Header::Line
            } else if len > MAX_BULK_LEN {
                return Err(BusError::Protocol(format!("bulk length {len} too large")));
            } else {
                Header::Bulk(usize::try_from(len).map_err(|e| BusError::Protocol(e.to_string()))?)
            }
        }
        b'*' => {
            let count = integer(line)?;
            if count > MAX_ARRAY_LEN {
                return Err(BusError::Protocol(format!("array length {count} too large")));
            }
            Header::Array(count)
        }
        other => {
            return Err(BusError::Protocol(format!(
                "unexpected type byte {:?}",
                char::from(other)
            )));
        }
    };
    Ok(Some((header, next)))
}

/// Parse one value starting at `pos`. Returns the value and the offset just
/// past it, or `None` if more bytes are needed.
fn parse(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, BusError> {
    let Some((header, next)) = header(buf, pos)? else {
        return Ok(None);
    };
    let line = &buf[pos + 1..next - 2];

    match header {
        Header::Line => {
            let value = match buf[pos] {
                b'+' => RespValue::Simple(text(line)?),
                b'-' => RespValue::Error(text(line)?),
                b':' => RespValue::Integer(integer(line)?),
                _ => RespValue::Nil,
            };
            Ok(Some((value, next)))
        }
        Header::Bulk(len) => {
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(BusError::Protocol("bulk string not terminated".into()));
            }
            Ok(Some((
                RespValue::Bulk(Bytes::copy_from_slice(&buf[next..end])),
                end + 2,
            )))
        }
        Header::Array(count) if count < 0 => Ok(Some((RespValue::Nil, next))),
        Header::Array(count) => {
            let mut items = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
            let mut cursor = next;
            for _ in 0..count {
                match parse(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn text(line: &[u8]) -> Result<String, BusError> {
    String::from_utf8(line.to_vec()).map_err(|e| BusError::Protocol(e.to_string()))
}

fn integer(line: &[u8]) -> Result<i64, BusError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BusError::Protocol(format!("bad integer {:?}", String::from_utf8_lossy(line))))
}
