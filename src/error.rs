use thiserror::Error;

/// Failures reported by a [`BrokerClient`](crate::BrokerClient) implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("queue declare `{queue}`: {reason}")]
    Declare { queue: String, reason: String },
    #[error("precondition failed on queue `{0}`: declared with different properties")]
    PreconditionFailed(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("qos: {0}")]
    Qos(String),
    #[error("subscribe `{queue}`: {reason}")]
    Subscribe { queue: String, reason: String },
    #[error("ack delivery tag {tag}: {reason}")]
    Ack { tag: u64, reason: String },
    #[error("delivery: {0}")]
    Delivery(String),
    #[error("broker closed")]
    Closed,
}

/// Outcome of a failed produce or consume run.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Declare, QoS or subscribe failed before any message moved.
    #[error("setup: {0}")]
    Setup(#[source] BrokerError),
    #[error("publish worker {worker} idx {index}: {source}")]
    Publish {
        worker: usize,
        index: u64,
        #[source]
        source: BrokerError,
    },
    #[error("consume after {received} messages: {source}")]
    Consume {
        received: u64,
        #[source]
        source: BrokerError,
    },
    #[error("ack message {received}: {source}")]
    Ack {
        received: u64,
        #[source]
        source: BrokerError,
    },
    #[error("{missing} worker(s) exited without reporting")]
    WorkerLost { missing: usize },
    #[error("cancelled after {processed} messages")]
    Cancelled { processed: u64 },
}

impl LoadError {
    /// Worker index of a publish failure, if this is one.
    pub fn worker(&self) -> Option<usize> {
        match self {
            LoadError::Publish { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}
