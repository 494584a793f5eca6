//! RESP parser for the pub/sub subset: arrays, bulk strings and integers.
//!
//! The parser is restartable rather than resumable. It keeps no state
//! between calls: given the bytes received so far it either decodes one
//! whole frame and reports how many bytes that frame occupied, or reports
//! `Incomplete` without consuming anything. The caller keeps the
//! unconsumed bytes and calls again once more data has arrived.

use super::frame::Frame;
use crate::error::ParseError;

/// Deepest array nesting accepted. Pub/sub replies nest one level.
pub const MAX_DEPTH: usize = 32;

/// Parse result
#[derive(Debug, PartialEq)]
pub enum ParseResult<'a> {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame<'a>, usize),
    /// Need more data
    Incomplete,
    /// Malformed input, the stream cannot be resynchronized
    Error(ParseError),
}

/// Outcome of a step that either produces a value or runs out of input.
enum Step<T> {
    Done(T, usize),
    Incomplete,
}

macro_rules! step {
    ($expr:expr) => {
        match $expr {
            Ok(Step::Done(value, next)) => (value, next),
            Ok(Step::Incomplete) => return Ok(Step::Incomplete),
            Err(e) => return Err(e),
        }
    };
}

/// Parse one RESP frame from the start of `buffer`.
pub fn parse(buffer: &[u8]) -> ParseResult<'_> {
    match parse_at(buffer, 0, 0) {
        Ok(Step::Done(frame, end)) => ParseResult::Complete(frame, end),
        Ok(Step::Incomplete) => ParseResult::Incomplete,
        Err(e) => ParseResult::Error(e),
    }
}

fn parse_at(buffer: &[u8], pos: usize, depth: usize) -> Result<Step<Frame<'_>>, ParseError> {
    let Some(&prefix) = buffer.get(pos) else {
        return Ok(Step::Incomplete);
    };

    match prefix {
        b':' => {
            let (n, next) = step!(read_decimal(buffer, pos + 1));
            Ok(Step::Done(Frame::Integer(n), next))
        }
        b'$' => parse_bulk_string(buffer, pos + 1),
        b'*' => parse_array(buffer, pos + 1, depth + 1),
        other => Err(ParseError::UnsupportedType(other)),
    }
}

/// Parse a bulk string body: 5\r\nhello\r\n
fn parse_bulk_string(buffer: &[u8], pos: usize) -> Result<Step<Frame<'_>>, ParseError> {
    let (len, data_start) = step!(read_length(buffer, pos));
    let Some(data_end) = data_start.checked_add(len).filter(|end| *end < usize::MAX - 2) else {
        return Err(ParseError::InvalidNumber(len.to_string()));
    };
    let total_len = data_end + 2; // +2 for trailing \r\n

    if buffer.len() < total_len {
        return Ok(Step::Incomplete);
    }

    if &buffer[data_end..total_len] != b"\r\n" {
        return Err(ParseError::MissingCrlf);
    }

    Ok(Step::Done(Frame::Bulk(&buffer[data_start..data_end]), total_len))
}

/// Parse an array body: 2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
fn parse_array(buffer: &[u8], pos: usize, depth: usize) -> Result<Step<Frame<'_>>, ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::NestingTooDeep(depth));
    }
    let (len, mut offset) = step!(read_length(buffer, pos));

    // The length prefix is untrusted; let the vector grow as items arrive.
    let mut frames = Vec::with_capacity(len.min(16));
    while frames.len() < len {
        let (frame, next) = step!(parse_at(buffer, offset, depth));
        frames.push(frame);
        offset = next;
    }

    Ok(Step::Done(Frame::Array(frames), offset))
}

fn read_length(buffer: &[u8], pos: usize) -> Result<Step<usize>, ParseError> {
    let (n, next) = step!(read_decimal(buffer, pos));
    if n < 0 {
        return Err(ParseError::NegativeLength(n));
    }
    let len = usize::try_from(n).map_err(|_| ParseError::InvalidNumber(n.to_string()))?;
    Ok(Step::Done(len, next))
}

/// Read a CRLF-terminated signed decimal starting at `pos`.
///
/// Bytes are validated as they are scanned, so a malformed field is
/// reported even before its terminator has arrived.
fn read_decimal(buffer: &[u8], pos: usize) -> Result<Step<i64>, ParseError> {
    let invalid = |end: usize| {
        let end = end.min(buffer.len());
        ParseError::InvalidNumber(String::from_utf8_lossy(&buffer[pos..end]).into_owned())
    };

    let mut idx = pos;
    let negative = buffer.get(idx) == Some(&b'-');
    if negative {
        idx += 1;
    }

    let digits_start = idx;
    let mut value: i64 = 0;
    loop {
        let Some(&b) = buffer.get(idx) else {
            return Ok(Step::Incomplete);
        };
        match b {
            b'0'..=b'9' => {
                let digit = i64::from(b - b'0');
                value = value
                    .checked_mul(10)
                    .and_then(|v| {
                        if negative {
                            v.checked_sub(digit)
                        } else {
                            v.checked_add(digit)
                        }
                    })
                    .ok_or_else(|| invalid(idx + 1))?;
                idx += 1;
            }
            b'\r' => {
                if idx == digits_start {
                    return Err(invalid(idx));
                }
                return match buffer.get(idx + 1) {
                    None => Ok(Step::Incomplete),
                    Some(b'\n') => Ok(Step::Done(value, idx + 2)),
                    Some(_) => Err(invalid(idx + 2)),
                };
            }
            _ => return Err(invalid(idx + 1)),
        }
    }
}
