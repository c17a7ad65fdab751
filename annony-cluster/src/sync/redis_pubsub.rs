use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::Client as RedisClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{MessageBus, Subscription, SUBSCRIPTION_CAPACITY};
use crate::{Error, Result};


/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// A payload waiting for the publisher task
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
}

/// Redis PUBLISH/SUBSCRIBE bus.
///
/// All publishes go through one task on one multiplexed connection, so this
/// instance's payloads reach Redis in the order they were published. Each
/// subscription owns a dedicated Pub/Sub connection.
///
/// Redis Pub/Sub keeps nothing for absent subscribers: payloads published
/// while a subscription is reconnecting are lost. Payloads queued while the
/// publisher is reconnecting are sent after it recovers, up to
/// [`PUBLISH_CHANNEL_CAPACITY`](Self::PUBLISH_CHANNEL_CAPACITY); the rest are
/// dropped.
pub struct RedisBus {
    redis_client: RedisClient,
    op_timeout: Duration,
    publish_tx: mpsc::Sender<PublishRequest>,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl RedisBus {
    /// Capacity for the publish channel. Payloads are dropped with a warning
    /// when full (e.g., during a prolonged Redis outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    /// Timeout for connecting and for each Redis operation
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connect and verify the server answers `PING`.
    ///
    /// Failure here is [`Error::BusUnavailable`]; later disconnects are
    /// retried in the background with exponential backoff. `op_timeout`
    /// bounds connecting as well as every later Redis command.
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)
            .map_err(|e| Error::BusUnavailable(format!("invalid Redis URL: {e}")))?;

        let mut conn = connect_publisher(&redis_client, op_timeout)
            .await
            .map_err(Error::BusUnavailable)?;
        match timeout(
            op_timeout,
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Error::BusUnavailable(format!("Redis PING failed: {e}"))),
            Err(_) => return Err(Error::BusUnavailable("Timed out waiting for Redis PING".to_string())),
        }

        info!("Connected to Redis message bus");

        let (publish_tx, publish_rx) = mpsc::channel(Self::PUBLISH_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let cancel_token = CancellationToken::new();

        tokio::spawn(run_publisher(
            redis_client.clone(),
            conn,
            op_timeout,
            publish_rx,
            Arc::clone(&connected),
            cancel_token.clone(),
        ));

        Ok(Self {
            redis_client,
            op_timeout,
            publish_tx,
            connected,
            cancel_token,
        })
    }

    /// Whether the publisher currently holds a working connection
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Stop the publisher and every subscription task
    pub fn shutdown(&self) {
        info!("Shutting down Redis message bus");
        self.cancel_token.cancel();
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let request = PublishRequest {
            topic: topic.to_string(),
            payload,
        };
        match self.publish_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %topic, "Redis publish queue full, message lost");
                Err(Error::BusDisconnected("publish queue full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::BusDisconnected("publisher stopped".to_string()))
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let pubsub = open_subscription(&self.redis_client, topic, self.op_timeout)
            .await
            .map_err(Error::BusUnavailable)?;

        info!(topic = %topic, "Subscribed to Redis channel");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        tokio::spawn(run_subscriber(
            self.redis_client.clone(),
            topic.to_string(),
            pubsub,
            self.op_timeout,
            tx,
            self.cancel_token.clone(),
        ));
        Ok(rx)
    }
}

async fn connect_publisher(
    client: &RedisClient,
    op_timeout: Duration,
) -> std::result::Result<MultiplexedConnection, String> {
    match timeout(
        op_timeout,
        client.get_multiplexed_async_connection(),
    )
    .await
    {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(format!("Failed to connect to Redis: {e}")),
        Err(_) => Err("Timed out connecting to Redis".to_string()),
    }
}

async fn open_subscription(
    client: &RedisClient,
    topic: &str,
    op_timeout: Duration,
) -> std::result::Result<PubSub, String> {
    let mut pubsub = match timeout(
        op_timeout,
        client.get_async_pubsub(),
    )
    .await
    {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => return Err(format!("Failed to get Redis Pub/Sub connection: {e}")),
        Err(_) => return Err("Timed out getting Redis Pub/Sub connection".to_string()),
    };

    match timeout(op_timeout, pubsub.subscribe(topic)).await {
        Ok(Ok(())) => Ok(pubsub),
        Ok(Err(e)) => Err(format!("Failed to subscribe to {topic}: {e}")),
        Err(_) => Err(format!("Timed out subscribing to {topic}")),
    }
}

/// Sleep for the backoff delay. Returns `true` if cancelled meanwhile.
async fn backoff_or_cancel(cancel: &CancellationToken, backoff_secs: u64) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => false,
    }
}

async fn run_publisher(
    client: RedisClient,
    initial: MultiplexedConnection,
    op_timeout: Duration,
    mut publish_rx: mpsc::Receiver<PublishRequest>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut conn = Some(initial);
    // A publish that failed mid-flight is retried once the connection is back
    let mut retry_request: Option<PublishRequest> = None;

    loop {
        let mut active = if let Some(c) = conn.take() {
            c
        } else {
            match connect_publisher(&client, op_timeout).await {
                Ok(c) => {
                    info!("Redis publisher reconnected");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    c
                }
                Err(e) => {
                    error!(error = %e, backoff_secs = backoff_secs, "Redis publisher reconnect failed, retrying");
                    if backoff_or_cancel(&cancel, backoff_secs).await {
                        return;
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            }
        };
        connected.store(true, Ordering::Relaxed);

        if let Some(req) = retry_request.take() {
            if let Err(e) = publish_one(&mut active, &req, op_timeout).await {
                warn!(error = %e, topic = %req.topic, "Retry publish failed, will retry after next reconnect");
                retry_request = Some(req);
                connected.store(false, Ordering::Relaxed);
                if backoff_or_cancel(&cancel, backoff_secs).await {
                    return;
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
        }

        loop {
            let req = tokio::select! {
                () = cancel.cancelled() => {
                    info!("Redis publisher task cancelled");
                    return;
                }
                req = publish_rx.recv() => req,
            };
            let Some(req) = req else {
                debug!("Redis publisher channel closed, exiting");
                return;
            };

            match publish_one(&mut active, &req, op_timeout).await {
                Ok(receivers) => {
                    debug!(topic = %req.topic, receivers = receivers, "Published to Redis");
                }
                Err(e) => {
                    error!(
                        error = %e,
                        topic = %req.topic,
                        "Redis publish failed, reconnecting; messages published during the outage may be lost"
                    );
                    retry_request = Some(req);
                    break;
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        if backoff_or_cancel(&cancel, backoff_secs).await {
            return;
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn publish_one(
    conn: &mut MultiplexedConnection,
    req: &PublishRequest,
    op_timeout: Duration,
) -> std::result::Result<i64, String> {
    match timeout(
        op_timeout,
        redis::cmd("PUBLISH")
            .arg(&req.topic)
            .arg(req.payload.as_ref())
            .query_async::<i64>(conn),
    )
    .await
    {
        Ok(Ok(receivers)) => Ok(receivers),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("Timed out publishing to Redis".to_string()),
    }
}

enum SubscriberExit {
    /// The connection was up and then dropped
    Disconnected,
    /// Could not (re)establish the subscription
    ConnectFailed(String),
    /// Shut down or the subscription receiver was dropped
    Stopped,
}

async fn run_subscriber(
    client: RedisClient,
    topic: String,
    initial: PubSub,
    op_timeout: Duration,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut pubsub = Some(initial);

    loop {
        let exit = match pubsub.take() {
            Some(ps) => forward_messages(ps, &topic, &tx, &cancel).await,
            None => match open_subscription(&client, &topic, op_timeout).await {
                Ok(ps) => {
                    warn!(
                        topic = %topic,
                        "Redis subscription restored; messages published while disconnected were not received"
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    forward_messages(ps, &topic, &tx, &cancel).await
                }
                Err(e) => SubscriberExit::ConnectFailed(e),
            },
        };

        match exit {
            SubscriberExit::Stopped => {
                info!(topic = %topic, "Redis subscriber task stopped");
                return;
            }
            SubscriberExit::Disconnected => {
                error!(
                    topic = %topic,
                    "Redis subscription lost, reconnecting after {}s",
                    INITIAL_BACKOFF_SECS
                );
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            SubscriberExit::ConnectFailed(e) => {
                error!(
                    error = %e,
                    topic = %topic,
                    backoff_secs = backoff_secs,
                    "Redis subscriber failed to connect, retrying after backoff"
                );
            }
        }

        if backoff_or_cancel(&cancel, backoff_secs).await {
            info!(topic = %topic, "Redis subscriber task cancelled during backoff");
            return;
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn forward_messages(
    mut pubsub: PubSub,
    topic: &str,
    tx: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> SubscriberExit {
    let mut stream = pubsub.on_message();

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return SubscriberExit::Stopped,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            return SubscriberExit::Disconnected;
        };

        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
        if tx.send(payload).await.is_err() {
            debug!(topic = %topic, "Subscription receiver dropped");
            return SubscriberExit::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_unreachable_is_bus_unavailable() {
        // Port 1 is reserved and refuses connections
        let result = RedisBus::connect("redis://127.0.0.1:1", RedisBus::DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(Error::BusUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_configured_timeout() {
        // Non-routable address: the attempt either hangs or fails fast
        let started = tokio::time::Instant::now();
        let result = RedisBus::connect("redis://10.255.255.1:6379", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Error::BusUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invalid_url_is_bus_unavailable() {
        let result = RedisBus::connect("not-a-redis-url", RedisBus::DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(Error::BusUnavailable(_))));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_subscribe_roundtrip() {
        let bus = RedisBus::connect("redis://127.0.0.1:6379", RedisBus::DEFAULT_TIMEOUT).await.unwrap();
        let mut sub = bus.subscribe("annony:test").await.unwrap();

        for i in 0..5u8 {
            bus.publish("annony:test", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            let payload = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
            assert_eq!(payload.as_ref(), &[i]);
        }

        bus.shutdown();
    }
}
