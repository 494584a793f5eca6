//! Connection manager: socket lifecycle and reconnection.
//!
//! Each manager owns one logical connection. A connected socket is split
//! into a receive loop and a dispatch loop that run as separate tasks and
//! share nothing but the pending queue and a cancellation signal scoped to
//! that socket (a "generation"). When the receive loop sees EOF, an I/O
//! error or a desynchronized stream, the supervisor task drops the
//! generation, which stops both loops, and reconnects under the retry
//! policy. On the subscribing side every registered topic is subscribed
//! again before the connection counts as connected.
//!
//! State transitions:
//! ```text
//! Closed -> Connected -> Closed -> Reconnecting -> Connected -> ...
//!                                       |
//!                                       +-> Closed (retry budget exhausted)
//! ```
//!
//! An unexpected close passes through `Closed` on its way to
//! `Reconnecting`. The state watch may coalesce the two; `state_changes`
//! reports both.

use crate::command::{Command, Completion, Request};
use crate::error::{ClientError, ClientResult};
use crate::pipeline::{drain_frames, run_dispatch, CommandSender, Correlator, PendingQueue};
use crate::registry::SubscriptionRegistry;
use crate::retry::RetryPolicy;
use crate::transport::{BoxedStream, Connector};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Buffered state changes per `state_changes` receiver
const TRANSITION_CAPACITY: usize = 16;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connected,
    Reconnecting,
}

/// Which of the client's two connections an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Publish,
    Subscribe,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Publish => write!(f, "publish"),
            Side::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Emitted each time a connection has been re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectEvent {
    pub side: Side,
    pub at: DateTime<Utc>,
}

/// Why a socket generation ended.
#[derive(Debug)]
enum CloseReason {
    /// Peer closed the stream.
    Eof,
    Io(io::Error),
    /// Malformed or unexpected data; the stream cannot be trusted.
    Desync(ClientError),
}

/// Where and how a manager connects.
#[derive(Clone)]
pub struct Endpoint {
    pub addr: String,
    pub password: Option<String>,
    pub connector: Arc<dyn Connector>,
}

/// Tasks and signals belonging to one connected socket.
///
/// Dropping a generation cancels both loops and releases the socket.
struct Generation {
    cancel: watch::Sender<bool>,
    closed: oneshot::Receiver<CloseReason>,
    tasks: Vec<JoinHandle<()>>,
}

impl Generation {
    async fn closed(&mut self) -> CloseReason {
        // A missing sender means the receive task was aborted, which only
        // happens during shutdown.
        (&mut self.closed).await.unwrap_or(CloseReason::Eof)
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One logical connection with automatic reconnection.
pub struct ConnectionManager {
    side: Side,
    endpoint: Endpoint,
    sender: CommandSender,
    commands: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>>,
    pending: Arc<PendingQueue>,
    /// Present on the subscribing side: receives pushes and drives resubscription.
    registry: Option<SubscriptionRegistry>,
    state: watch::Sender<ConnectionState>,
    /// Every state change, in order. `state` only keeps the latest one.
    transitions: broadcast::Sender<ConnectionState>,
    /// True from an unexpected close until the replacement socket is
    /// resubscribed or the retry budget runs out.
    recovering: watch::Sender<bool>,
    events: broadcast::Sender<ReconnectEvent>,
    retry: Mutex<Option<Box<dyn RetryPolicy>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        side: Side,
        endpoint: Endpoint,
        retry: Box<dyn RetryPolicy>,
        registry: Option<SubscriptionRegistry>,
        events: broadcast::Sender<ReconnectEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (recovering, _) = watch::channel(false);
        Arc::new(Self {
            side,
            endpoint,
            sender: CommandSender::new(tx),
            commands: Arc::new(tokio::sync::Mutex::new(rx)),
            pending: Arc::new(PendingQueue::new()),
            registry,
            state,
            transitions,
            recovering,
            events,
            retry: Mutex::new(Some(retry)),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every later state change, including a `Closed` that is immediately
    /// followed by `Reconnecting`.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Number of written commands still waiting for a reply.
    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Connect and start the supervisor that keeps the connection alive.
    ///
    /// Fails if the first connect fails; no retry is made in that case.
    pub async fn start(self: &Arc<Self>) -> ClientResult<()> {
        let mut retry = {
            let mut slot = self.retry.lock().unwrap_or_else(|e| e.into_inner());
            match slot.take() {
                Some(retry) => retry,
                None => return Ok(()),
            }
        };

        let generation = match self.establish().await {
            Ok(generation) => generation,
            Err(e) => {
                error!(side = %self.side, addr = %self.endpoint.addr, error = %e, "Connection failed");
                *self.retry.lock().unwrap_or_else(|e| e.into_inner()) = Some(retry);
                return Err(e);
            }
        };
        retry.reset();
        self.set_state(ConnectionState::Connected);
        info!(side = %self.side, addr = %self.endpoint.addr, "Connected");

        let supervisor = tokio::spawn(Arc::clone(self).supervise(generation, retry));
        *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);
        Ok(())
    }

    /// Stop the supervisor and both loops, and drop the socket.
    pub fn shutdown(&self) {
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            supervisor.abort();
            self.set_state(ConnectionState::Closed);
            self.recovering.send_replace(false);
            info!(side = %self.side, "Connection shut down");
        }
    }

    /// Enqueue a request without waiting for the connection.
    pub fn submit(&self, request: Request) -> ClientResult<Completion> {
        debug!(side = %self.side, kind = %request.kind(), topic = request.topic(), "Submitting command");
        self.sender.submit(request)
    }

    /// Wait until the connection is usable.
    ///
    /// After a reconnect this resolves only once resubscription is done.
    /// If the retry budget runs out it never resolves.
    pub async fn wait_connected(&self) -> ClientResult<()> {
        let mut state = self.state.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Wait until no reconnect is in progress.
    ///
    /// Resolves immediately while connected. After an unexpected close it
    /// resolves once the new socket is resubscribed, or once the retry
    /// budget is spent.
    pub async fn wait_recovered(&self) -> ClientResult<()> {
        let mut recovering = self.recovering.subscribe();
        recovering
            .wait_for(|recovering| !*recovering)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(side = %self.side, ?previous, current = ?state, "Connection state changed");
            let _ = self.transitions.send(state);
        }
    }

    /// Open a socket and start its receive and dispatch loops.
    async fn establish(&self) -> ClientResult<Generation> {
        let mut stream = self.endpoint.connector.connect(&self.endpoint.addr).await?;
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        if let Some(password) = &self.endpoint.password {
            authenticate(&mut stream, password, &mut buffer).await?;
        }

        // Replies for commands written to an earlier socket will never arrive.
        let dropped = self.pending.clear();
        if dropped > 0 {
            warn!(side = %self.side, dropped, "Dropping commands left unanswered by the previous connection");
        }

        let (reader, mut writer) = tokio::io::split(stream);
        let (cancel, cancel_rx) = watch::channel(false);
        let (closed_tx, closed) = oneshot::channel();

        let correlator = Correlator::new(Arc::clone(&self.pending), self.registry.clone());
        let receive = tokio::spawn({
            let cancel = cancel_rx.clone();
            let side = self.side;
            async move {
                let reason = receive_loop(reader, buffer, correlator, cancel, side).await;
                let _ = closed_tx.send(reason);
            }
        });

        let dispatch = tokio::spawn({
            let commands = Arc::clone(&self.commands);
            let pending = Arc::clone(&self.pending);
            async move {
                let mut commands = commands.lock().await;
                run_dispatch(&mut commands, &mut writer, &pending, cancel_rx).await;
            }
        });

        Ok(Generation {
            cancel,
            closed,
            tasks: vec![receive, dispatch],
        })
    }

    /// Watch the current socket and replace it whenever it closes.
    async fn supervise(self: Arc<Self>, mut generation: Generation, mut retry: Box<dyn RetryPolicy>) {
        loop {
            match generation.closed().await {
                CloseReason::Eof => info!(side = %self.side, "Connection closed by server"),
                CloseReason::Io(e) => warn!(side = %self.side, error = %e, "Connection lost"),
                CloseReason::Desync(e) => {
                    error!(side = %self.side, error = %e, "Protocol desynchronized, dropping connection")
                }
            }
            drop(generation);

            self.recovering.send_replace(true);
            self.set_state(ConnectionState::Closed);
            self.set_state(ConnectionState::Reconnecting);
            match self.reconnect(retry.as_mut()).await {
                Some(next) => {
                    generation = next;
                    self.recovering.send_replace(false);
                }
                None => {
                    self.set_state(ConnectionState::Closed);
                    self.recovering.send_replace(false);
                    error!(side = %self.side, addr = %self.endpoint.addr, "Maximum retry reached, giving up");
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, retry: &mut dyn RetryPolicy) -> Option<Generation> {
        info!(side = %self.side, addr = %self.endpoint.addr, "Trying to reconnect");
        let mut attempt = 0u32;

        while retry.should_retry() {
            attempt += 1;
            tokio::time::sleep(retry.next_retry_delay()).await;

            let mut generation = match self.establish().await {
                Ok(generation) => generation,
                Err(e) => {
                    warn!(side = %self.side, attempt, error = %e, "Reconnect attempt failed");
                    continue;
                }
            };
            retry.reset();

            if let Err(reason) = self.resubscribe(&mut generation).await {
                warn!(side = %self.side, attempt, ?reason, "Connection lost while resubscribing");
                continue;
            }

            self.set_state(ConnectionState::Connected);
            info!(side = %self.side, addr = %self.endpoint.addr, attempt, "Reconnected");
            let _ = self.events.send(ReconnectEvent {
                side: self.side,
                at: Utc::now(),
            });
            return Some(generation);
        }
        None
    }

    /// Subscribe every registered topic again and wait for all acks.
    async fn resubscribe(&self, generation: &mut Generation) -> Result<(), CloseReason> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };

        let topics = registry.topics();
        let mut completions = Vec::with_capacity(topics.len());
        for topic in topics {
            debug!(side = %self.side, %topic, "Resubscribing");
            let completion = self
                .submit(Request::Subscribe { topic })
                .map_err(CloseReason::Desync)?;
            completions.push(completion);
        }

        for completion in &completions {
            tokio::select! {
                _ = completion.wait() => {}
                reason = generation.closed() => return Err(reason),
            }
        }
        info!(side = %self.side, topics = completions.len(), "Resubscribed");
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("side", &self.side)
            .field("addr", &self.endpoint.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Send the AUTH greeting and discard the server's one-line status reply.
async fn authenticate(
    stream: &mut BoxedStream,
    password: &str,
    buffer: &mut BytesMut,
) -> io::Result<()> {
    stream
        .write_all(format!("AUTH {password}\r\n").as_bytes())
        .await?;
    stream.flush().await?;

    loop {
        if let Some(pos) = find_crlf(buffer) {
            let line = buffer.split_to(pos + 2);
            debug!(reply = %String::from_utf8_lossy(&line[..pos]), "Authentication reply");
            return Ok(());
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during authentication",
            ));
        }
    }
}

/// Find CRLF in buffer, return position of \r
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Read from the socket and dispatch every complete frame.
///
/// Partial frames stay in `buffer` across reads. Returns when the peer
/// closes, a read fails, the stream desynchronizes or the generation is
/// cancelled.
async fn receive_loop<R>(
    mut reader: R,
    mut buffer: BytesMut,
    correlator: Correlator,
    mut cancel: watch::Receiver<bool>,
    side: Side,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Err(e) = drain_frames(&mut buffer, &correlator) {
            return CloseReason::Desync(e);
        }

        let read = tokio::select! {
            biased;
            _ = cancel.changed() => return CloseReason::Eof,
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => return CloseReason::Eof,
            Ok(n) => trace!(%side, bytes = n, "Read from socket"),
            Err(e) => return CloseReason::Io(e),
        }
    }
}
