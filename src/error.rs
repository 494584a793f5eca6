//! Error types for the pub/sub client.
//!
//! Wire-format failures (`ParseError`) and reply correlation failures
//! (`ProtocolError`) are both fatal for the socket they occur on. The
//! connection manager logs them and tears the socket down, which hands
//! control to the reconnect path.

use crate::command::CommandKind;
use std::time::Duration;

/// Malformed bytes on the wire.
///
/// Distinct from running out of input: a truncated message is reported as
/// `ParseResult::Incomplete`, never as an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported frame type: {:?}", *.0 as char)]
    UnsupportedType(u8),
    #[error("invalid decimal field: {0:?}")]
    InvalidNumber(String),
    #[error("negative length: {0}")]
    NegativeLength(i64),
    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,
    #[error("arrays nested {0} levels deep")]
    NestingTooDeep(usize),
}

/// Reply stream desynchronized from the commands that were sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("{reply} reply received with no pending command")]
    PendingUnderflow { reply: CommandKind },
    #[error("{reply} reply received but pending command is {pending}")]
    KindMismatch {
        reply: CommandKind,
        pending: CommandKind,
    },
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("bulk string is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors surfaced to callers of the client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type ClientResult<T> = Result<T, ClientError>;
