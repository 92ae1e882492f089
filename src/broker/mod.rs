use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::{BrokerEvent, MemoryBroker};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Deliveries in broker order. Ends when the broker closes the subscription.
pub type Subscription = BoxStream<'static, BrokerResult<Delivery>>;

pub const CONTENT_TYPE: &str = "text/plain";

/// Queue declaration shared by both engines so producer and consumer agree
/// on the queue's properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Non-durable and auto-deleted: load-test queues are throwaway.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub body: Bytes,
    pub content_type: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Stamps the message with the current time.
    pub fn now(body: Bytes) -> Self {
        Self {
            body,
            content_type: CONTENT_TYPE,
            timestamp: Utc::now(),
        }
    }
}

/// Identifies one delivery for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle(pub u64);

#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Bytes,
    pub ack: AckHandle,
}

/// The broker operations the load engines need. Implementations must allow
/// concurrent `publish` calls from several workers.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Idempotent: succeeds if the queue already exists with the same properties.
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;
    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message)
    -> BrokerResult<()>;
    async fn set_qos(&self, prefetch: u16) -> BrokerResult<()>;
    async fn subscribe(&self, queue: &str, auto_ack: bool) -> BrokerResult<Subscription>;
    /// Acknowledges exactly one delivery.
    async fn ack(&self, handle: AckHandle) -> BrokerResult<()>;
}
