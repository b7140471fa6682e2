//! Redis Pub/Sub support.

use futures::{Stream, StreamExt, stream};
use redis::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{RedisError, Result};

/// Keyevent channel on which Redis publishes the keys it expired in
/// `database`.
pub fn expired_events_channel(database: u8) -> String {
    format!("__keyevent@{}__:expired", database)
}

/// A Redis Pub/Sub message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Channel name.
    pub channel: String,
    /// Message payload.
    pub payload: String,
    /// Pattern (for pattern subscriptions).
    pub pattern: Option<String>,
}

impl Message {
    /// Whether this message is a keyevent expiry notification.
    pub fn is_expiry_event(&self) -> bool {
        self.channel.starts_with("__keyevent@") && self.channel.ends_with("__:expired")
    }
}

/// A subscription handle.
pub struct Subscription {
    /// Receiver for messages.
    receiver: mpsc::Receiver<Message>,
    /// Channel name or pattern.
    channel: String,
}

impl Subscription {
    fn new(receiver: mpsc::Receiver<Message>, channel: String) -> Self {
        Self { receiver, channel }
    }

    /// Get the channel name or pattern.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Turn the subscription into a stream of messages.
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        stream::unfold(self.receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (message, receiver))
        })
    }
}

/// Redis Pub/Sub client.
pub struct PubSub {
    client: Client,
    connect_timeout: Duration,
}

impl PubSub {
    /// Create a new Pub/Sub client.
    pub fn new(client: Client, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }

    async fn open(&self) -> Result<redis::aio::PubSub> {
        tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| RedisError::Timeout(self.connect_timeout))?
            .map_err(|e| RedisError::Connection(e.to_string()))
    }

    /// Subscribe to a channel.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.open().await?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(channel = %channel, "Subscribed to Redis channel");
        Ok(Self::forward(pubsub, channel.to_string(), None))
    }

    /// Subscribe to a pattern.
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        let mut pubsub = self.open().await?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| RedisError::PubSub(e.to_string()))?;

        info!(pattern = %pattern, "Subscribed to Redis pattern");
        Ok(Self::forward(pubsub, pattern.to_string(), Some(pattern.to_string())))
    }

    /// Subscribe to the keys expired in `database`.
    ///
    /// Events of other databases on the same server are not received. The
    /// server only publishes them when `notify-keyspace-events` includes
    /// `Ex`; see [`enable_expiry_events`](Self::enable_expiry_events).
    pub async fn expired_keys(&self, database: u8) -> Result<Subscription> {
        self.subscribe(&expired_events_channel(database)).await
    }

    /// Ask the server to publish expiry events. Requires admin rights.
    pub async fn enable_expiry_events(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::Command(e.to_string()))?;

        debug!("Enabled keyspace expiry notifications");
        Ok(())
    }

    /// Publish a message to a channel.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u32> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let receivers: u32 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::Command(e.to_string()))?;

        debug!(channel = %channel, receivers = receivers, "Published message");

        Ok(receivers)
    }

    fn forward(
        mut pubsub: redis::aio::PubSub,
        name: String,
        pattern: Option<String>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(100);

        let task_name = name.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to get message payload");
                        continue;
                    }
                };

                let message = Message {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                    pattern: pattern.clone(),
                };

                if tx.send(message).await.is_err() {
                    debug!(channel = %task_name, "Subscription receiver dropped");
                    break;
                }
            }
        });

        Subscription::new(rx, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_event_detection() {
        let message = Message {
            channel: "__keyevent@0__:expired".to_string(),
            payload: "User:1".to_string(),
            pattern: None,
        };
        assert!(message.is_expiry_event());

        let message = Message {
            channel: "__keyevent@0__:del".to_string(),
            ..message
        };
        assert!(!message.is_expiry_event());

        let message = Message {
            channel: "orders:unexpired".to_string(),
            ..message
        };
        assert!(!message.is_expiry_event());
    }

    #[test]
    fn test_expired_events_channel_is_per_database() {
        assert_eq!(expired_events_channel(0), "__keyevent@0__:expired");
        assert_eq!(expired_events_channel(15), "__keyevent@15__:expired");
        assert_ne!(expired_events_channel(0), expired_events_channel(15));
    }

    #[tokio::test]
    async fn test_subscription_stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let subscription = Subscription::new(rx, "test".to_string());
        assert_eq!(subscription.channel(), "test");

        tx.send(Message {
            channel: "c".to_string(),
            payload: "p".to_string(),
            pattern: None,
        })
        .await
        .unwrap();
        drop(tx);

        let messages: Vec<Message> = subscription.into_stream().collect().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "p");
    }
}
