//! RESP value model.
//!
//! Frames borrow from the receive buffer they were parsed from, so a frame
//! is only valid until that region of the buffer is released. Callers that
//! need to keep data around copy it out with `as_text`.

use crate::error::ProtocolError;
use std::fmt;

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    Bulk(&'a [u8]),
    /// Array: *2\r\n...
    Array(Vec<Frame<'a>>),
}

impl<'a> Frame<'a> {
    /// Name of the frame type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk string",
            Frame::Array(_) => "array",
        }
    }

    /// Bulk string contents as UTF-8 text.
    pub fn as_text(&self) -> Result<&'a str, ProtocolError> {
        match self {
            Frame::Bulk(data) => std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8),
            other => Err(ProtocolError::TypeMismatch {
                expected: "bulk string",
                found: other.type_name(),
            }),
        }
    }

    /// Raw bulk string bytes.
    pub fn as_bytes(&self) -> Result<&'a [u8], ProtocolError> {
        match self {
            Frame::Bulk(data) => Ok(data),
            other => Err(ProtocolError::TypeMismatch {
                expected: "bulk string",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_int(&self) -> Result<i64, ProtocolError> {
        match self {
            Frame::Integer(n) => Ok(*n),
            other => Err(ProtocolError::TypeMismatch {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_array(&self) -> Result<&[Frame<'a>], ProtocolError> {
        match self {
            Frame::Array(items) => Ok(items),
            other => Err(ProtocolError::TypeMismatch {
                expected: "array",
                found: other.type_name(),
            }),
        }
    }

    /// True if this is a bulk string equal to `literal`.
    pub fn is_bulk(&self, literal: &[u8]) -> bool {
        matches!(self, Frame::Bulk(data) if *data == literal)
    }
}

impl fmt::Display for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Integer(n) => write!(f, ":{n}"),
            Frame::Bulk(data) => write!(f, "{:?}", String::from_utf8_lossy(data)),
            Frame::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Frame::Bulk(b"topic").as_text().unwrap(), "topic");
        assert_eq!(Frame::Integer(-3).as_int().unwrap(), -3);
        assert_eq!(
            Frame::Array(vec![Frame::Integer(1)]).as_array().unwrap(),
            &[Frame::Integer(1)]
        );
    }

    #[test]
    fn test_accessor_type_mismatch() {
        match Frame::Integer(1).as_text() {
            Err(ProtocolError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "bulk string");
                assert_eq!(found, "integer");
            }
            other => panic!("Expected type mismatch, got {other:?}"),
        }
        assert!(Frame::Bulk(b"1").as_int().is_err());
        assert!(Frame::Bulk(b"x").as_array().is_err());
    }

    #[test]
    fn test_invalid_utf8_text() {
        assert_eq!(
            Frame::Bulk(&[0xff, 0xfe]).as_text(),
            Err(ProtocolError::InvalidUtf8)
        );
        assert_eq!(Frame::Bulk(&[0xff]).as_bytes().unwrap(), &[0xffu8]);
    }

    #[test]
    fn test_display() {
        let frame = Frame::Array(vec![Frame::Bulk(b"pong"), Frame::Integer(-1)]);
        assert_eq!(frame.to_string(), r#"["pong", :-1]"#);
    }

    #[test]
    fn test_is_bulk() {
        assert!(Frame::Bulk(b"message").is_bulk(b"message"));
        assert!(!Frame::Bulk(b"message").is_bulk(b"subscribe"));
        assert!(!Frame::Integer(0).is_bulk(b"0"));
    }
}
