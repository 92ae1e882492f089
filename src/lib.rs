pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod payload;
pub mod producer;
pub mod report;

pub use broker::{AckHandle, BrokerClient, Delivery, Message, QueueSpec, Subscription};
pub use config::{AckMode, EnvOverrides, LoadJob, Mode};
pub use consumer::ConsumerEngine;
pub use error::{BrokerError, LoadError};
pub use payload::PayloadGenerator;
pub use producer::{plan_assignments, ProducerEngine, WorkAssignment};
pub use report::{RunResult, ThroughputReporter};
