//! Outgoing commands and their wire encoding.
//!
//! Every command is sent as a RESP array of bulk strings:
//! `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument, where
//! `len` counts encoded bytes, not characters.

use crate::error::{ClientError, ClientResult};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// The kind of a command, used to validate replies against the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl CommandKind {
    /// Command name as written on the wire.
    pub fn name(self) -> &'static [u8] {
        match self {
            CommandKind::Publish => b"PUBLISH",
            CommandKind::Subscribe => b"SUBSCRIBE",
            CommandKind::Unsubscribe => b"UNSUBSCRIBE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Publish => write!(f, "publish"),
            CommandKind::Subscribe => write!(f, "subscribe"),
            CommandKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// An immutable request value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Publish { topic: String, payload: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl Request {
    pub fn kind(&self) -> CommandKind {
        match self {
            Request::Publish { .. } => CommandKind::Publish,
            Request::Subscribe { .. } => CommandKind::Subscribe,
            Request::Unsubscribe { .. } => CommandKind::Unsubscribe,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Request::Publish { topic, .. }
            | Request::Subscribe { topic }
            | Request::Unsubscribe { topic } => topic,
        }
    }

    fn args(&self) -> ([&[u8]; 3], usize) {
        let name = self.kind().name();
        match self {
            Request::Publish { topic, payload } => {
                ([name, topic.as_bytes(), payload.as_bytes()], 3)
            }
            Request::Subscribe { topic } | Request::Unsubscribe { topic } => {
                ([name, topic.as_bytes(), &[]], 2)
            }
        }
    }

    /// Exact number of bytes `encode_into` will write.
    pub fn encoded_len(&self) -> usize {
        let (args, argc) = self.args();
        let header = 1 + decimal_len(argc) + 2;
        args[..argc].iter().fold(header, |total, arg| {
            total + 1 + decimal_len(arg.len()) + 2 + arg.len() + 2
        })
    }

    /// Encode the command into `buf`, returning the number of bytes written.
    ///
    /// The buffer is grown once, up front, to fit the whole command.
    pub fn encode_into(&self, buf: &mut BytesMut) -> usize {
        let len = self.encoded_len();
        buf.reserve(len);
        let start = buf.len();

        let (args, argc) = self.args();
        buf.put_u8(b'*');
        put_decimal(buf, argc);
        buf.put_slice(b"\r\n");
        for arg in &args[..argc] {
            buf.put_u8(b'$');
            put_decimal(buf, arg.len());
            buf.put_slice(b"\r\n");
            buf.put_slice(arg);
            buf.put_slice(b"\r\n");
        }

        let written = buf.len() - start;
        debug_assert_eq!(written, len);
        written
    }
}

fn decimal_len(mut value: usize) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn put_decimal(buf: &mut BytesMut, mut value: usize) {
    // Digits are produced least significant first into a stack buffer.
    let mut digits = [0u8; 20];
    let mut len = 0;
    loop {
        digits[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    digits[..len].reverse();
    buf.put_slice(&digits[..len]);
}

/// Single-shot completion signal.
///
/// Set at most once; any number of clones may observe or wait on it.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Default)]
struct CompletionInner {
    done: AtomicBool,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the completion as done. Returns false if it already was.
    pub fn complete(&self) -> bool {
        let first = !self.inner.done.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_complete(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wait until the completion is set. Waits forever if it never is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent `complete`
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> ClientResult<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ClientError::Timeout(timeout))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_complete())
            .finish()
    }
}

/// A request paired with the completion its reply will set.
#[derive(Debug, Clone)]
pub struct Command {
    pub request: Request,
    pub completion: Completion,
}

impl Command {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            completion: Completion::new(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.request.kind()
    }
}
