//! Command pipeline: submission, dispatch and reply correlation.
//!
//! The protocol carries no request identifiers. Replies to solicited
//! commands come back in the order the commands were written, so every
//! command is pushed onto a FIFO pending queue as it is written and popped
//! when a reply of matching shape arrives. Each reply is checked against
//! the kind of the command it pops, which catches a desynchronized stream
//! instead of completing the wrong caller.

use crate::command::{Command, CommandKind, Completion, Request};
use crate::error::{ClientError, ClientResult, ProtocolError};
use crate::registry::{Message, SubscriptionRegistry};
use crate::resp::{parse, Frame, ParseResult};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

/// Write buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Commands written to the socket and still waiting for their reply.
#[derive(Default)]
pub struct PendingQueue {
    commands: Mutex<VecDeque<Command>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: Command) {
        self.lock().push_back(command);
    }

    pub fn pop(&self) -> Option<Command> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every pending command. Their completions are never set.
    pub fn clear(&self) -> usize {
        let mut commands = self.lock();
        let dropped = commands.len();
        commands.clear();
        dropped
    }

    /// Kinds of the pending commands, oldest first.
    pub fn kinds(&self) -> Vec<CommandKind> {
        self.lock().iter().map(Command::kind).collect()
    }

    /// Pop the oldest command, which must be of `kind`, and complete it.
    pub fn complete_next(&self, kind: CommandKind) -> Result<(), ProtocolError> {
        let command = self
            .pop()
            .ok_or(ProtocolError::PendingUnderflow { reply: kind })?;
        if command.kind() != kind {
            return Err(ProtocolError::KindMismatch {
                reply: kind,
                pending: command.kind(),
            });
        }
        trace!(%kind, topic = command.request.topic(), "Command acknowledged");
        command.completion.complete();
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Command>> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Receives classified replies from the decoder.
pub trait ReplyHandler {
    /// Unsolicited topic delivery. Never touches the pending queue.
    fn on_push(&self, topic: &str, payload: &str);

    fn on_subscribe_ack(&self, topic: &str) -> Result<(), ProtocolError>;

    fn on_unsubscribe_ack(&self, topic: &str) -> Result<(), ProtocolError>;

    /// `receivers` is the server's subscriber count, informational only.
    fn on_publish_ack(&self, receivers: i64) -> Result<(), ProtocolError>;
}

/// Classify one decoded frame and hand it to `handler`.
pub fn dispatch_reply<H>(frame: &Frame<'_>, handler: &H) -> Result<(), ProtocolError>
where
    H: ReplyHandler + ?Sized,
{
    match frame {
        Frame::Integer(receivers) => handler.on_publish_ack(*receivers),
        Frame::Array(items) => {
            let [kind, topic, last] = &items[..] else {
                return Err(ProtocolError::UnexpectedReply(frame.to_string()));
            };
            if kind.is_bulk(b"message") {
                match (topic.as_text(), last.as_text()) {
                    (Ok(topic), Ok(payload)) => handler.on_push(topic, payload),
                    _ => warn!(message = %frame, "Dropping message that is not valid UTF-8"),
                }
                Ok(())
            } else if kind.is_bulk(b"subscribe") {
                last.as_int()?;
                handler.on_subscribe_ack(topic.as_text()?)
            } else if kind.is_bulk(b"unsubscribe") {
                last.as_int()?;
                handler.on_unsubscribe_ack(topic.as_text()?)
            } else {
                Err(ProtocolError::UnexpectedReply(frame.to_string()))
            }
        }
        Frame::Bulk(_) => Err(ProtocolError::UnexpectedReply(frame.to_string())),
    }
}

/// Reply handler for one connection: acks complete pending commands,
/// pushes go to the subscription registry when there is one.
#[derive(Clone)]
pub struct Correlator {
    pending: Arc<PendingQueue>,
    registry: Option<SubscriptionRegistry>,
}

impl Correlator {
    pub fn new(
        pending: Arc<PendingQueue>,
        registry: Option<SubscriptionRegistry>,
    ) -> Self {
        Self { pending, registry }
    }
}

impl ReplyHandler for Correlator {
    fn on_push(&self, topic: &str, payload: &str) {
        let Some(registry) = &self.registry else {
            debug!(topic, "Ignoring message on connection without subscriptions");
            return;
        };
        let message = Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };
        let delivered = registry.publish_locally(&message);
        trace!(topic, delivered, "Message delivered");
    }

    fn on_subscribe_ack(&self, topic: &str) -> Result<(), ProtocolError> {
        trace!(topic, "Subscribe acknowledged");
        self.pending.complete_next(CommandKind::Subscribe)
    }

    fn on_unsubscribe_ack(&self, topic: &str) -> Result<(), ProtocolError> {
        trace!(topic, "Unsubscribe acknowledged");
        self.pending.complete_next(CommandKind::Unsubscribe)
    }

    fn on_publish_ack(&self, receivers: i64) -> Result<(), ProtocolError> {
        trace!(receivers, "Publish acknowledged");
        self.pending.complete_next(CommandKind::Publish)
    }
}

/// Decode and dispatch every complete frame at the front of `buffer`.
///
/// Consumed bytes are removed; a trailing partial frame stays in place for
/// the next call. Returns the number of frames dispatched.
pub fn drain_frames<H>(buffer: &mut BytesMut, handler: &H) -> ClientResult<usize>
where
    H: ReplyHandler + ?Sized,
{
    let mut frames = 0;
    loop {
        let consumed = match parse(buffer) {
            ParseResult::Complete(frame, consumed) => {
                trace!(%frame, "Received frame");
                dispatch_reply(&frame, handler)?;
                consumed
            }
            ParseResult::Incomplete => return Ok(frames),
            ParseResult::Error(e) => return Err(e.into()),
        };
        buffer.advance(consumed);
        frames += 1;
    }
}

/// Producer side of a connection's submission queue.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Enqueue a request and return its completion without waiting on I/O.
    pub fn submit(&self, request: Request) -> ClientResult<Completion> {
        let command = Command::new(request);
        let completion = command.completion.clone();
        self.tx
            .send(command)
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(completion)
    }
}

/// Write queued commands to `writer` until cancelled or the queue closes.
///
/// Everything already queued is encoded into one buffer and flushed
/// together. Each command is pushed onto `pending` as it is encoded, ahead
/// of the write, so a fast reply can never find the queue empty.
pub async fn run_dispatch<W>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    writer: &mut W,
    pending: &PendingQueue,
    mut cancel: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        if *cancel.borrow() {
            break;
        }

        let first = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        batch.clear();
        let mut count = 0;
        let mut next = Some(first);
        while let Some(command) = next {
            command.request.encode_into(&mut batch);
            trace!(kind = %command.kind(), topic = command.request.topic(), "Queued command");
            pending.push(command);
            count += 1;
            next = commands.try_recv().ok();
        }

        let write = async {
            writer.write_all(&batch).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            result = write => match result {
                Ok(()) => debug!(count, bytes = batch.len(), "Flushed commands"),
                Err(e) => error!(error = %e, count, "Failed to write commands"),
            },
        }
    }
}
