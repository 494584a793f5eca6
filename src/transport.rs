//! Duplex byte streams and the connectors that open them.
//!
//! The connection manager only sees a `BoxedStream`. Plain TCP is provided
//! here; an encrypted stream is plugged in through `TlsUpgrade`, which
//! receives the connected socket and hands back the upgraded stream.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Readable and writable byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens a new duplex stream to `addr` (`host:port`).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Upgrades a connected socket to an encrypted stream.
#[async_trait]
pub trait TlsUpgrade: Send + Sync + 'static {
    async fn upgrade(&self, host: &str, stream: TcpStream) -> io::Result<BoxedStream>;
}

/// TCP connector with optional TLS upgrade.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(tls: Arc<dyn TlsUpgrade>) -> Self {
        Self { tls: Some(tls) }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream> {
        let socket_addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {addr}"),
            )
        })?;
        debug!(%addr, resolved = %socket_addr, "Resolved server address");

        let stream = TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream).set_keepalive(true)?;

        match &self.tls {
            Some(tls) => tls.upgrade(host_of(addr), stream).await,
            None => Ok(Box::new(stream)),
        }
    }
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Host part of a `host:port` address, used as the TLS server name.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process servers for exercising the connection manager.

    use super::*;
    use crate::resp::{parse, ParseResult};
    use bytes::{Buf, BytesMut};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Server end of an accepted in-memory connection.
    pub struct FakeServer {
        stream: tokio::io::DuplexStream,
        buf: BytesMut,
    }

    impl FakeServer {
        /// Read one command and return its arguments as text.
        pub async fn read_command(&mut self) -> Vec<String> {
            loop {
                let parsed = match parse(&self.buf) {
                    ParseResult::Complete(frame, consumed) => {
                        let args = frame
                            .as_array()
                            .unwrap()
                            .iter()
                            .map(|arg| arg.as_text().unwrap().to_string())
                            .collect::<Vec<_>>();
                        Some((args, consumed))
                    }
                    ParseResult::Incomplete => None,
                    ParseResult::Error(e) => panic!("client sent malformed data: {e}"),
                };
                if let Some((args, consumed)) = parsed {
                    self.buf.advance(consumed);
                    return args;
                }
                self.fill().await;
            }
        }

        /// Read one raw CRLF-terminated line, without the terminator.
        pub async fn read_line(&mut self) -> String {
            loop {
                if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                    let line = self.buf.split_to(pos + 2);
                    return String::from_utf8_lossy(&line[..pos]).into_owned();
                }
                self.fill().await;
            }
        }

        pub async fn send(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        /// Assert the client writes nothing for a short while.
        pub async fn assert_idle(&mut self) {
            assert!(self.buf.is_empty(), "unread data: {:?}", self.buf);
            let read = tokio::time::timeout(
                Duration::from_millis(50),
                self.stream.read_buf(&mut self.buf),
            )
            .await;
            assert!(read.is_err(), "unexpected data: {:?}", self.buf);
        }

        async fn fill(&mut self) {
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for client data")
                .unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    /// Connector whose attempts succeed or fail according to a script.
    pub struct ScriptedConnector {
        outcomes: Mutex<VecDeque<bool>>,
        then: bool,
        attempts: AtomicUsize,
        servers: mpsc::UnboundedSender<FakeServer>,
    }

    impl ScriptedConnector {
        /// `outcomes` are consumed in order; `then` applies once they run out.
        pub fn new(
            outcomes: &[bool],
            then: bool,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServer>) {
            let (servers, accepted) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                then,
                attempts: AtomicUsize::new(0),
                servers,
            });
            (connector, accepted)
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _addr: &str) -> io::Result<BoxedStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let accept = self.outcomes.lock().unwrap().pop_front().unwrap_or(self.then);
            if !accept {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            let _ = self.servers.send(FakeServer {
                stream: server,
                buf: BytesMut::new(),
            });
            Ok(Box::new(client))
        }
    }

    pub async fn next_server(accepted: &mut mpsc::UnboundedReceiver<FakeServer>) -> FakeServer {
        tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}
