//! Streaming RESP2 reply parser.
//!
//! [`parse`] inspects the front of a buffer and either yields a complete
//! [`RespValue`] together with the number of bytes it occupied, or reports
//! [`ClientError::Incomplete`] so the caller reads more and retries. Any
//! other error means the byte stream itself is broken and the connection
//! that produced it cannot be trusted further.
//!
//! Bulk payloads are `Bytes::slice` views into the (ref-counted) input
//! buffer; nothing is copied out of it.

use crate::error::{ClientError, Result};
use crate::resp::types::RespValue;
use bytes::Bytes;
use memchr::memchr;

/// Refuse array headers that announce more elements than this. A hostile
/// `*2147483647\r\n` header must not translate into a huge allocation
/// before a single element has arrived.
const MAX_RESP_ELEMENTS: usize = 16_777_216;

/// Longest digit run accepted in an integer or length field; 19 digits is
/// enough for any `i64` and keeps the magnitude accumulator overflow-free.
const MAX_INT_DIGITS: usize = 19;

/// Parse one RESP value from the front of `buf`.
///
/// Returns `(value, bytes_consumed)` on success and `Err(Incomplete)` when
/// the frame is still partial.
pub fn parse(buf: &Bytes) -> Result<(RespValue, usize)> {
    value_at(buf, 0)
}

/// Convenience wrapper for byte slices (copies into `Bytes` first). The
/// [`parse`] entry point is the zero-copy path.
pub fn parse_slice(buf: &[u8]) -> Result<(RespValue, usize)> {
    parse(&Bytes::copy_from_slice(buf))
}

/// Parse the value whose tag byte sits at offset `at`. Returns the value
/// and the offset of the first byte after it.
fn value_at(buf: &Bytes, at: usize) -> Result<(RespValue, usize)> {
    let Some(&tag) = buf.get(at) else {
        return Err(ClientError::Incomplete);
    };
    let body = at + 1;
    match tag {
        b'+' => {
            let (line, next) = take_line(buf, body)?;
            Ok((RespValue::SimpleString(line_text(line, "status")?), next))
        }
        b'-' => {
            let (line, next) = take_line(buf, body)?;
            Ok((RespValue::Error(line_text(line, "error")?), next))
        }
        b':' => {
            let (line, next) = take_line(buf, body)?;
            Ok((RespValue::Integer(decimal_field(line)?), next))
        }
        b'$' => bulk_at(buf, body),
        b'*' => array_at(buf, body),
        other => Err(ClientError::Protocol(format!(
            "unexpected frame tag 0x{other:02x}"
        ))),
    }
}

/// `$<len>\r\n<payload>\r\n`, where a negative length is the RESP2 null.
fn bulk_at(buf: &Bytes, body: usize) -> Result<(RespValue, usize)> {
    let (header, payload_start) = take_line(buf, body)?;
    let declared = decimal_field(header)?;
    if declared < 0 {
        return Ok((RespValue::Null, payload_start));
    }

    let payload_end = payload_start + declared as usize;
    if buf.len() < payload_end + 2 {
        return Err(ClientError::Incomplete);
    }
    if &buf[payload_end..payload_end + 2] != b"\r\n" {
        return Err(ClientError::Protocol(
            "bulk payload missing CRLF terminator".into(),
        ));
    }
    // A ref-counted view into the read buffer, not a copy.
    let payload = buf.slice(payload_start..payload_end);
    Ok((RespValue::BulkString(payload), payload_end + 2))
}

/// `*<count>\r\n<elements…>`, where a negative count is the RESP2 null.
fn array_at(buf: &Bytes, body: usize) -> Result<(RespValue, usize)> {
    let (header, mut at) = take_line(buf, body)?;
    let declared = decimal_field(header)?;
    if declared < 0 {
        return Ok((RespValue::Null, at));
    }

    let count = declared as usize;
    if count > MAX_RESP_ELEMENTS {
        return Err(ClientError::Protocol(format!(
            "array of {count} elements refused"
        )));
    }
    let mut items = Vec::with_capacity(count.min(1024));
    while items.len() < count {
        let (item, next) = value_at(buf, at)?;
        items.push(item);
        at = next;
    }
    Ok((RespValue::Array(items), at))
}

// ── Line scanning ──────────────────────────────────────────────────

/// Take the CRLF-terminated line starting at `at`: scan for the line feed,
/// then insist on the carriage return just before it. Returns the line body
/// and the offset past the terminator.
fn take_line(buf: &[u8], at: usize) -> Result<(&[u8], usize)> {
    let Some(rel) = memchr(b'\n', &buf[at..]) else {
        return Err(ClientError::Incomplete);
    };
    let lf = at + rel;
    if lf == at || buf[lf - 1] != b'\r' {
        return Err(ClientError::Protocol(
            "line feed without carriage return".into(),
        ));
    }
    Ok((&buf[at..lf - 1], lf + 1))
}

fn line_text(line: &[u8], what: &str) -> Result<String> {
    match std::str::from_utf8(line) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => Err(ClientError::Protocol(format!("{what} line is not UTF-8"))),
    }
}

/// Parse a signed decimal from an integer reply or a length header. The
/// digit run is bounded up front, so the magnitude fits a `u64` without
/// any per-digit overflow checks; the sign is folded in at the end, which
/// also covers `i64::MIN`.
fn decimal_field(line: &[u8]) -> Result<i64> {
    let (negative, digits) = match line.first() {
        Some(b'-') => (true, &line[1..]),
        Some(b'+') => (false, &line[1..]),
        Some(_) => (false, line),
        None => return Err(ClientError::Protocol("empty integer field".into())),
    };
    if digits.is_empty() || digits.len() > MAX_INT_DIGITS {
        return Err(ClientError::Protocol("malformed integer field".into()));
    }

    let mut magnitude: u64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(ClientError::Protocol(format!(
                "non-digit 0x{byte:02x} in integer field"
            )));
        }
        magnitude = magnitude * 10 + u64::from(byte - b'0');
    }

    if negative {
        if magnitude > i64::MAX as u64 + 1 {
            return Err(ClientError::Protocol("integer field out of range".into()));
        }
        Ok((magnitude as i64).wrapping_neg())
    } else {
        i64::try_from(magnitude)
            .map_err(|_| ClientError::Protocol("integer field out of range".into()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(input: &[u8]) -> (RespValue, usize) {
        parse_slice(input).expect("parse failed")
    }

    // ── Simple strings ──

    #[test]
    fn simple_string_ok() {
        let (val, n) = parse_ok(b"+OK\r\n");
        assert_eq!(val, RespValue::SimpleString("OK".into()));
        assert_eq!(n, 5);
    }

    #[test]
    fn simple_string_pong() {
        let (val, _) = parse_ok(b"+PONG\r\n");
        assert_eq!(val, RespValue::SimpleString("PONG".into()));
    }

    #[test]
    fn simple_string_arbitrary() {
        let (val, _) = parse_ok(b"+hello world\r\n");
        assert_eq!(val, RespValue::SimpleString("hello world".into()));
    }

    #[test]
    fn simple_string_incomplete() {
        assert!(parse_slice(b"+OK").unwrap_err().is_incomplete());
        assert!(parse_slice(b"+OK\r").unwrap_err().is_incomplete());
    }

    #[test]
    fn bare_line_feed_rejected() {
        let result = parse_slice(b"+OK\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    // ── Errors ──

    #[test]
    fn simple_error() {
        let (val, _) = parse_ok(b"-ERR unknown command\r\n");
        assert_eq!(val, RespValue::Error("ERR unknown command".into()));
    }

    // ── Integers ──

    #[test]
    fn integer_positive() {
        let (val, n) = parse_ok(b":1000\r\n");
        assert_eq!(val, RespValue::Integer(1000));
        assert_eq!(n, 7);
    }

    #[test]
    fn integer_negative() {
        let (val, _) = parse_ok(b":-42\r\n");
        assert_eq!(val, RespValue::Integer(-42));
    }

    #[test]
    fn integer_min_max() {
        let (val, _) = parse_ok(b":9223372036854775807\r\n");
        assert_eq!(val, RespValue::Integer(i64::MAX));
        let (val, _) = parse_ok(b":-9223372036854775808\r\n");
        assert_eq!(val, RespValue::Integer(i64::MIN));
    }

    #[test]
    fn integer_overflow_rejected() {
        let result = parse_slice(b":9223372036854775808\r\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn integer_too_many_digits_rejected() {
        let result = parse_slice(b":99999999999999999999\r\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn integer_garbage_rejected() {
        let result = parse_slice(b":12a4\r\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    // ── Bulk strings ──

    #[test]
    fn bulk_string() {
        let (val, n) = parse_ok(b"$6\r\nfoobar\r\n");
        assert_eq!(val, RespValue::BulkString(Bytes::from_static(b"foobar")));
        assert_eq!(n, 12);
    }

    #[test]
    fn bulk_string_empty() {
        let (val, _) = parse_ok(b"$0\r\n\r\n");
        assert_eq!(val, RespValue::BulkString(Bytes::new()));
    }

    #[test]
    fn bulk_string_null() {
        let (val, n) = parse_ok(b"$-1\r\n");
        assert_eq!(val, RespValue::Null);
        assert_eq!(n, 5);
    }

    #[test]
    fn bulk_string_binary_safe() {
        let (val, _) = parse_ok(b"$7\r\nval\r\nue\r\n");
        assert_eq!(val, RespValue::BulkString(Bytes::from_static(b"val\r\nue")));
    }

    #[test]
    fn bulk_string_incomplete_payload() {
        assert!(parse_slice(b"$6\r\nfoo").unwrap_err().is_incomplete());
    }

    #[test]
    fn bulk_string_bad_terminator() {
        let result = parse_slice(b"$3\r\nfooXX");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    // ── Arrays ──

    #[test]
    fn array_of_bulk_strings() {
        let (val, n) = parse_ok(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        assert_eq!(
            val,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from_static(b"foo")),
                RespValue::BulkString(Bytes::from_static(b"bar")),
            ])
        );
        assert_eq!(n, 22);
    }

    #[test]
    fn array_empty() {
        let (val, _) = parse_ok(b"*0\r\n");
        assert_eq!(val, RespValue::Array(vec![]));
    }

    #[test]
    fn array_null() {
        let (val, _) = parse_ok(b"*-1\r\n");
        assert_eq!(val, RespValue::Null);
    }

    #[test]
    fn array_mixed() {
        let (val, _) = parse_ok(b"*3\r\n:1\r\n+OK\r\n$-1\r\n");
        assert_eq!(
            val,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::SimpleString("OK".into()),
                RespValue::Null,
            ])
        );
    }

    #[test]
    fn array_nested() {
        let (val, _) = parse_ok(b"*2\r\n*1\r\n:1\r\n*1\r\n:2\r\n");
        assert_eq!(
            val,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Integer(1)]),
                RespValue::Array(vec![RespValue::Integer(2)]),
            ])
        );
    }

    #[test]
    fn array_incomplete_elements() {
        assert!(parse_slice(b"*2\r\n$3\r\nfoo\r\n").unwrap_err().is_incomplete());
    }

    #[test]
    fn array_hostile_count_rejected() {
        let result = parse_slice(b"*2147483647\r\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    // ── Framing ──

    #[test]
    fn empty_buffer_incomplete() {
        assert!(parse_slice(b"").unwrap_err().is_incomplete());
    }

    #[test]
    fn unknown_type_byte() {
        let result = parse_slice(b"?what\r\n");
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn consumed_leaves_trailing_bytes() {
        let input = b"+OK\r\n:42\r\n";
        let (val, n) = parse_ok(input);
        assert_eq!(val, RespValue::SimpleString("OK".into()));
        let (val2, _) = parse_slice(&input[n..]).unwrap();
        assert_eq!(val2, RespValue::Integer(42));
    }

    #[test]
    fn pipelined_replies_parse_sequentially() {
        let mut input: &[u8] = b":1\r\n:2\r\n:3\r\n";
        let mut values = Vec::new();
        while !input.is_empty() {
            let (val, n) = parse_slice(input).unwrap();
            values.push(val);
            input = &input[n..];
        }
        assert_eq!(
            values,
            vec![
                RespValue::Integer(1),
                RespValue::Integer(2),
                RespValue::Integer(3),
            ]
        );
    }
}
