//! Publish/subscribe primitive for background jobs.
//!
//! Uploads publish a [`ThumbnailJob`] after a new original is stored; the
//! thumbnail worker subscribes to the same topic. [`LocalQueue`] keeps one
//! multi-consumer channel per topic inside the process, so subscribers on a
//! topic compete for messages and each message is delivered at most once.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::MediaId;

/// Header carrying the payload encoding
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// A queued message
#[derive(Debug, Clone)]
pub struct Message {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

/// Payload of a thumbnail generation request: `{"media_id": "<id>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailJob {
    pub media_id: MediaId,
}

impl ThumbnailJob {
    pub fn new(media_id: MediaId) -> Self {
        Self { media_id }
    }

    pub fn to_message(&self) -> Result<Message> {
        let mut headers = HashMap::new();
        headers.insert(CONTENT_TYPE_HEADER.to_string(), "application/json".to_string());
        Ok(Message {
            headers,
            payload: Bytes::from(serde_json::to_vec(self)?),
        })
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(serde_json::from_slice(&message.payload)?)
    }
}

/// Receiving end of a topic
#[derive(Debug, Clone)]
pub struct Subscription {
    topic: String,
    receiver: async_channel::Receiver<Message>,
}

impl Subscription {
    /// Wait for the next message; `None` once the topic is closed
    pub async fn recv(&self) -> Option<Message> {
        self.receiver.recv().await.ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Topic-based message queue
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publish a message; returns once it is enqueued
    async fn publish(&self, topic: &str, message: Message) -> Result<()>;

    /// Join the consumer group of `topic`
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

type Channel = (
    async_channel::Sender<Message>,
    async_channel::Receiver<Message>,
);

/// In-process queue backed by one unbounded channel per topic
#[derive(Debug, Default)]
pub struct LocalQueue {
    topics: DashMap<String, Channel>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, topic: &str) -> Channel {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(async_channel::unbounded)
            .clone()
    }

    /// Messages waiting on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|c| c.value().0.len())
            .unwrap_or(0)
    }

    /// Close every topic, waking all subscribers with `None`
    pub fn close(&self) {
        for entry in self.topics.iter() {
            entry.value().0.close();
        }
    }
}

#[async_trait]
impl MessageQueue for LocalQueue {
    async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        let (sender, _) = self.channel(topic);
        sender
            .send(message)
            .await
            .map_err(|_| AppError::internal(format!("Topic {} is closed", topic)))?;
        debug!(topic = %topic, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (_, receiver) = self.channel(topic);
        Ok(Subscription {
            topic: topic.to_string(),
            receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_payload_shape() {
        let id = MediaId::parse("abc123").unwrap();
        let message = ThumbnailJob::new(id.clone()).to_message().unwrap();

        assert_eq!(&message.payload[..], br#"{"media_id":"abc123"}"#);
        assert_eq!(ThumbnailJob::from_message(&message).unwrap().media_id, id);
    }

    #[test]
    fn test_job_rejects_bad_payload() {
        let message = Message {
            headers: HashMap::new(),
            payload: Bytes::from_static(b"{\"media_id\": 5}"),
        };
        assert!(ThumbnailJob::from_message(&message).is_err());

        let message = Message {
            headers: HashMap::new(),
            payload: Bytes::from_static(br#"{"media_id":"../escape"}"#),
        };
        assert!(ThumbnailJob::from_message(&message).is_err());
    }

    #[tokio::test]
    async fn test_publish_then_receive() {
        let queue = LocalQueue::new();
        let sub = queue.subscribe("jobs").await.unwrap();

        let job = ThumbnailJob::new(MediaId::generate());
        queue.publish("jobs", job.to_message().unwrap()).await.unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(ThumbnailJob::from_message(&received).unwrap(), job);
    }

    #[tokio::test]
    async fn test_messages_buffer_before_subscribe() {
        let queue = LocalQueue::new();
        let job = ThumbnailJob::new(MediaId::generate());
        queue.publish("jobs", job.to_message().unwrap()).await.unwrap();
        assert_eq!(queue.pending("jobs"), 1);

        let sub = queue.subscribe("jobs").await.unwrap();
        assert!(sub.recv().await.is_some());
        assert_eq!(queue.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_competing_consumers_each_message_once() {
        let queue = LocalQueue::new();
        let a = queue.subscribe("jobs").await.unwrap();
        let b = queue.subscribe("jobs").await.unwrap();

        for _ in 0..2 {
            let job = ThumbnailJob::new(MediaId::generate());
            queue.publish("jobs", job.to_message().unwrap()).await.unwrap();
        }

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert_eq!(queue.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_subscribers() {
        let queue = LocalQueue::new();
        let sub = queue.subscribe("jobs").await.unwrap();
        queue.close();
        assert!(sub.recv().await.is_none());
    }
}
