//! Application-facing client.
//!
//! A client holds two connections to the same server: one carries PUBLISH
//! commands, the other carries SUBSCRIBE/UNSUBSCRIBE and receives message
//! pushes. Both reconnect on their own. Publishing waits for the publishing
//! connection to be connected; subscribed topics live in a registry shared
//! with the subscribing connection so they survive reconnects.

use crate::command::Request;
use crate::connection::{ConnectionManager, ConnectionState, Endpoint, ReconnectEvent, Side};
use crate::error::{ClientError, ClientResult};
use crate::registry::{MessageHandler, Registration, Subscription, SubscriptionRegistry};
use crate::retry::LinearRetryPolicy;
use crate::transport::{Connector, TcpConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Reconnect budget shared by both connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts per outage; the budget is restored after each reconnect.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(10),
        }
    }
}

/// Connection settings for a [`Client`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Server address as `host:port`.
    pub addr: String,
    /// Sent as an `AUTH` greeting on every new socket.
    pub password: Option<String>,
    pub retry: RetrySettings,
    pub connector: Arc<dyn Connector>,
}

impl ClientOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = RetrySettings {
            max_attempts,
            delay,
        };
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            addr: self.addr.clone(),
            password: self.password.clone(),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            retry: RetrySettings::default(),
            connector: Arc::new(TcpConnector::new()),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("addr", &self.addr)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("retry", &self.retry)
            .finish()
    }
}

/// Publish/subscribe client over two reconnecting connections.
pub struct Client {
    publisher: Arc<ConnectionManager>,
    subscriber: Arc<ConnectionManager>,
    registry: SubscriptionRegistry,
    events: broadcast::Sender<ReconnectEvent>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        let registry = SubscriptionRegistry::new();
        let retry = || {
            Box::new(LinearRetryPolicy::new(
                options.retry.max_attempts,
                options.retry.delay,
            ))
        };

        let publisher = ConnectionManager::new(
            Side::Publish,
            options.endpoint(),
            retry(),
            None,
            events.clone(),
        );
        let subscriber = ConnectionManager::new(
            Side::Subscribe,
            options.endpoint(),
            retry(),
            Some(registry.clone()),
            events.clone(),
        );

        Self {
            publisher,
            subscriber,
            registry,
            events,
        }
    }

    /// Connect both sides. Fails if either first connect fails.
    pub async fn start(&self) -> ClientResult<()> {
        self.publisher.start().await?;
        self.subscriber.start().await?;
        info!("Client started");
        Ok(())
    }

    /// Publish `payload` to `topic` and wait for the server's ack.
    ///
    /// While the publishing connection is down this waits for it to come
    /// back, indefinitely if reconnecting never succeeds. While the
    /// subscribing connection is reconnecting it also waits until every
    /// topic is subscribed again.
    pub async fn publish(&self, topic: &str, payload: &str) -> ClientResult<()> {
        loop {
            if self.publisher.state() != ConnectionState::Connected {
                debug!(topic, "Publish waiting for connection");
            }
            self.publisher.wait_connected().await?;
            self.subscriber.wait_recovered().await?;
            if self.publisher.state() == ConnectionState::Connected {
                break;
            }
        }

        let completion = self.publisher.submit(Request::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })?;
        completion.wait().await;
        Ok(())
    }

    /// Like [`publish`](Self::publish), but gives up after `timeout`.
    ///
    /// The command may still reach the server after the timeout fires.
    pub async fn publish_timeout(
        &self,
        topic: &str,
        payload: &str,
        timeout: Duration,
    ) -> ClientResult<()> {
        tokio::time::timeout(timeout, self.publish(topic, payload))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    /// Register `handler` for messages on `topic`.
    ///
    /// Only the first local handler for a topic sends SUBSCRIBE and waits
    /// for its ack. Later handlers for the same topic are added locally and
    /// return at once. Dropping the returned [`Subscription`] removes the
    /// handler but keeps the topic subscribed on the server.
    pub async fn subscribe<H>(&self, topic: &str, handler: H) -> ClientResult<Subscription>
    where
        H: MessageHandler,
    {
        let Registration {
            subscription,
            first,
        } = self.registry.add(topic, handler);
        if !first {
            debug!(topic, "Added local handler");
            return Ok(subscription);
        }

        let completion = match self.subscriber.submit(Request::Subscribe {
            topic: topic.to_string(),
        }) {
            Ok(completion) => completion,
            Err(e) => {
                self.registry.remove_topic(topic);
                return Err(e);
            }
        };
        completion.wait().await;
        info!(topic, "Subscribed");
        Ok(subscription)
    }

    /// Unsubscribe `topic` on the server and drop all of its local handlers.
    pub async fn unsubscribe(&self, topic: &str) -> ClientResult<()> {
        // Removed first so a reconnect in between does not resubscribe it.
        self.registry.remove_topic(topic);
        let completion = self.subscriber.submit(Request::Unsubscribe {
            topic: topic.to_string(),
        })?;
        completion.wait().await;
        info!(topic, "Unsubscribed");
        Ok(())
    }

    /// Receiver of an event each time either connection reconnects.
    pub fn reconnects(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub fn state(&self, side: Side) -> ConnectionState {
        self.connection(side).state()
    }

    /// Every later state change of one connection, closes included.
    pub fn state_changes(&self, side: Side) -> broadcast::Receiver<ConnectionState> {
        self.connection(side).state_changes()
    }

    fn connection(&self, side: Side) -> &ConnectionManager {
        match side {
            Side::Publish => &self.publisher,
            Side::Subscribe => &self.subscriber,
        }
    }

    /// Topics currently registered for resubscription.
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    /// Close both connections and stop reconnecting.
    pub fn shutdown(&self) {
        self.publisher.shutdown();
        self.subscriber.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("publisher", &self.publisher)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Message;
    use crate::transport::testing::{next_server, FakeServer, ScriptedConnector};
    use tokio::sync::mpsc;

    const SUB_ACK_T: &[u8] = b"*3\r\n$9\r\nsubscribe\r\n$1\r\nt\r\n:1\r\n";
    const UNSUB_ACK_T: &[u8] = b"*3\r\n$11\r\nunsubscribe\r\n$1\r\nt\r\n:0\r\n";

    fn push(topic: &str, payload: &str) -> Vec<u8> {
        format!(
            "*3\r\n$7\r\nmessage\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
            topic.len(),
            topic,
            payload.len(),
            payload
        )
        .into_bytes()
    }

    struct Harness {
        client: Arc<Client>,
        publisher: FakeServer,
        subscriber: FakeServer,
        accepted: mpsc::UnboundedReceiver<FakeServer>,
        connector: Arc<ScriptedConnector>,
    }

    async fn started(delay: Duration) -> Harness {
        let (connector, mut accepted) = ScriptedConnector::new(&[], true);
        let options = ClientOptions::new("fake:6379")
            .retry(3, delay)
            .connector(connector.clone());
        let client = Arc::new(Client::new(options));
        client.start().await.unwrap();
        let publisher = next_server(&mut accepted).await;
        let subscriber = next_server(&mut accepted).await;
        Harness {
            client,
            publisher,
            subscriber,
            accepted,
            connector,
        }
    }

    fn collector(
        label: &'static str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> impl Fn(&Message) + Send + Sync + 'static {
        let tx = tx.clone();
        move |m: &Message| {
            let _ = tx.send(format!("{label}:{}", m.payload));
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.addr, "127.0.0.1:6379");
        assert_eq!(options.password, None);
        assert_eq!(options.retry.max_attempts, 10);
        assert_eq!(options.retry.delay, Duration::from_secs(10));
    }

    #[test]
    fn test_options_debug_hides_password() {
        let options = ClientOptions::new("h:1").password("hunter2");
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("h:1"));
    }

    #[tokio::test]
    async fn test_start_connects_both_sides() {
        let Harness {
            client,
            publisher: _publisher,
            subscriber: _subscriber,
            connector,
            ..
        } = started(Duration::from_millis(1)).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(client.state(Side::Publish), ConnectionState::Connected);
        assert_eq!(client.state(Side::Subscribe), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_start_fails_when_unreachable() {
        let (connector, _accepted) = ScriptedConnector::new(&[], false);
        let client = Client::new(ClientOptions::new("fake:6379").connector(connector));
        assert!(client.start().await.is_err());
        assert_eq!(client.state(Side::Publish), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_publish_waits_for_ack() {
        let Harness {
            client,
            mut publisher,
            mut subscriber,
            accepted: _accepted,
            ..
        } = started(Duration::from_millis(1)).await;

        let publish = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.publish("news", "hello world").await }
        });
        assert_eq!(
            publisher.read_command().await,
            vec!["PUBLISH", "news", "hello world"]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        publisher.send(b":0\r\n").await;
        publish.await.unwrap().unwrap();
        subscriber.assert_idle().await;
    }

    #[tokio::test]
    async fn test_publish_timeout() {
        let Harness {
            client,
            mut publisher,
            subscriber: _subscriber,
            accepted: _accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let result = client
            .publish_timeout("news", "x", Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert_eq!(publisher.read_command().await, vec!["PUBLISH", "news", "x"]);
    }

    #[tokio::test]
    async fn test_subscribe_fan_out() {
        let Harness {
            client,
            publisher: _publisher,
            mut subscriber,
            accepted: _accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (first, _) = tokio::join!(client.subscribe("t", collector("h1", &tx)), async {
            assert_eq!(subscriber.read_command().await, vec!["SUBSCRIBE", "t"]);
            subscriber.send(SUB_ACK_T).await;
        });
        let first = first.unwrap();

        // Second local handler: no wire traffic.
        let second = client.subscribe("t", collector("h2", &tx)).await.unwrap();
        subscriber.assert_idle().await;

        subscriber.send(&push("t", "one")).await;
        assert_eq!(recv(&mut rx).await, "h1:one");
        assert_eq!(recv(&mut rx).await, "h2:one");

        first.dispose();
        subscriber.send(&push("t", "two")).await;
        assert_eq!(recv(&mut rx).await, "h2:two");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        // Disposing every handler keeps the topic subscribed.
        drop(second);
        assert_eq!(client.topics(), vec!["t".to_string()]);
        subscriber.assert_idle().await;
    }

    #[tokio::test]
    async fn test_message_for_unknown_topic_dropped() {
        let Harness {
            client,
            publisher: _publisher,
            mut subscriber,
            accepted: _accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sub, _) = tokio::join!(client.subscribe("t", collector("h", &tx)), async {
            subscriber.read_command().await;
            subscriber.send(SUB_ACK_T).await;
        });
        let _sub = sub.unwrap();

        subscriber.send(&push("other", "lost")).await;
        subscriber.send(&push("t", "kept")).await;
        assert_eq!(recv(&mut rx).await, "h:kept");
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let Harness {
            client,
            publisher: _publisher,
            mut subscriber,
            accepted: _accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (sub, _) = tokio::join!(client.subscribe("t", collector("h", &tx)), async {
            subscriber.read_command().await;
            subscriber.send(SUB_ACK_T).await;
        });
        let _sub = sub.unwrap();

        let (result, _) = tokio::join!(client.unsubscribe("t"), async {
            assert_eq!(subscriber.read_command().await, vec!["UNSUBSCRIBE", "t"]);
            subscriber.send(UNSUB_ACK_T).await;
        });
        result.unwrap();
        assert!(client.topics().is_empty());

        subscriber.send(&push("t", "late")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_gated_during_reconnect() {
        let Harness {
            client,
            publisher,
            subscriber: _subscriber,
            mut accepted,
            ..
        } = started(Duration::from_millis(100)).await;
        let mut events = client.reconnects();
        let mut changes = client.state_changes(Side::Publish);

        drop(publisher);
        assert_eq!(changes.recv().await.unwrap(), ConnectionState::Closed);
        let mut state = client.publisher.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        let publish = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.publish("news", "queued").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        let mut publisher = next_server(&mut accepted).await;
        assert_eq!(
            publisher.read_command().await,
            vec!["PUBLISH", "news", "queued"]
        );
        publisher.send(b":1\r\n").await;
        publish.await.unwrap().unwrap();

        assert_eq!(events.recv().await.unwrap().side, Side::Publish);
        assert_eq!(client.state(Side::Subscribe), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_publish_waits_for_resubscription() {
        let Harness {
            client,
            publisher,
            mut subscriber,
            mut accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let (sub, _) = tokio::join!(client.subscribe("t", |_: &Message| {}), async {
            subscriber.read_command().await;
            subscriber.send(SUB_ACK_T).await;
        });
        let _sub = sub.unwrap();

        // Lose both sockets. The publisher comes back first.
        drop(publisher);
        let mut publisher = next_server(&mut accepted).await;
        let mut state = client.publisher.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        drop(subscriber);
        let mut subscriber = next_server(&mut accepted).await;
        assert_eq!(subscriber.read_command().await, vec!["SUBSCRIBE", "t"]);

        // SUBSCRIBE is not acked yet, so nothing may be published.
        let publish = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.publish("t", "held").await }
        });
        publisher.assert_idle().await;
        assert!(!publish.is_finished());
        assert_eq!(client.state(Side::Subscribe), ConnectionState::Reconnecting);

        subscriber.send(SUB_ACK_T).await;
        assert_eq!(publisher.read_command().await, vec!["PUBLISH", "t", "held"]);
        publisher.send(b":1\r\n").await;
        tokio::time::timeout(Duration::from_secs(5), publish)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_reconnect_resubscribes() {
        let Harness {
            client,
            publisher: _publisher,
            mut subscriber,
            mut accepted,
            ..
        } = started(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut events = client.reconnects();
        let (sub, _) = tokio::join!(client.subscribe("t", collector("h", &tx)), async {
            subscriber.read_command().await;
            subscriber.send(SUB_ACK_T).await;
        });
        let _sub = sub.unwrap();

        drop(subscriber);
        let mut subscriber = next_server(&mut accepted).await;
        assert_eq!(subscriber.read_command().await, vec!["SUBSCRIBE", "t"]);
        subscriber.send(SUB_ACK_T).await;
        assert_eq!(events.recv().await.unwrap().side, Side::Subscribe);

        subscriber.send(&push("t", "after")).await;
        assert_eq!(recv(&mut rx).await, "h:after");
    }
}
