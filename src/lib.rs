//! pubsub-link: a reconnecting publish/subscribe client for RESP servers
//!
//! Features:
//! - Incremental decoder for the RESP subset used by pub/sub traffic
//! - Pipelined commands matched to replies in FIFO order
//! - Separate publishing and subscribing connections with automatic reconnect
//! - Topics resubscribed after a reconnect before publishing resumes
//! - Local fan-out of each message to every handler registered for its topic

pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod resp;
pub mod retry;
pub mod transport;

pub use client::{Client, ClientOptions, RetrySettings};
pub use connection::{ConnectionState, ReconnectEvent, Side};
pub use error::{ClientError, ClientResult, ParseError, ProtocolError};
pub use registry::{Message, MessageHandler, Subscription};
pub use retry::{LinearRetryPolicy, RetryPolicy};
pub use transport::{Connector, TcpConnector, TlsUpgrade};
