//! In-process broker.
//!
//! Backs the test suite and `--broker memory` dry runs. It models the parts of
//! AMQP the load engines depend on:
//! - the default exchange routes by routing key to the queue of that name,
//!   named exchanges route through explicit [`MemoryBroker::bind`] bindings,
//!   and unroutable messages are dropped;
//! - messages wait in the queue until a consumer takes them;
//! - `set_qos(n)` caps unacknowledged manual-ack deliveries at `n`;
//! - each delivery tag can be acknowledged exactly once;
//! - a queue has at most one active consumer. Dropping a subscription frees
//!   the queue and puts its unacknowledged deliveries back at the head;
//! - after [`MemoryBroker::close_queue`] a subscription ends once the backlog
//!   is drained.
//!
//! Every operation is appended to a journal so tests can assert ordering.
use super::{AckHandle, BrokerClient, BrokerResult, Delivery, Message, QueueSpec, Subscription};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Declared(QueueSpec),
    Published {
        exchange: String,
        routing_key: String,
        body: Bytes,
    },
    Qos(u16),
    Subscribed {
        queue: String,
        auto_ack: bool,
    },
    Delivered(u64),
    Acked(u64),
    /// An unacknowledged delivery went back to its queue when its consumer left.
    Requeued(u64),
}

type PublishFault = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Queue {
    spec: QueueSpec,
    backlog: VecDeque<Bytes>,
    closed: bool,
    consumer: Option<u64>,
    ready: Arc<Notify>,
}

struct Unacked {
    queue: String,
    consumer: u64,
    body: Bytes,
    gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    bindings: HashMap<(String, String), Vec<String>>,
    prefetch: u16,
    next_tag: u64,
    next_consumer: u64,
    unacked: HashMap<u64, Unacked>,
    fault: Option<PublishFault>,
    events: Vec<BrokerEvent>,
}

impl State {
    fn routes(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_string()];
        }
        self.bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Pops the next message for `consumer`. `None` once the queue is closed
    /// and empty, `Some(None)` while it is merely empty.
    fn take(&mut self, consumer: &Consumer) -> Option<Option<Delivery>> {
        let queue = self.queues.get_mut(&consumer.queue)?;
        let Some(body) = queue.backlog.pop_front() else {
            return if queue.closed { None } else { Some(None) };
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        if !consumer.auto_ack {
            self.unacked.insert(
                tag,
                Unacked {
                    queue: consumer.queue.clone(),
                    consumer: consumer.id,
                    body: body.clone(),
                    gate: consumer.gate.clone(),
                },
            );
        }
        self.events.push(BrokerEvent::Delivered(tag));
        Some(Some(Delivery {
            body,
            ack: AckHandle(tag),
        }))
    }

    /// Frees the queue held by consumer `id` and requeues its unacked
    /// deliveries ahead of the backlog, oldest first.
    fn release(&mut self, queue: &str, id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            let Some(unacked) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(q) = self.queues.get_mut(&unacked.queue) {
                q.backlog.push_front(unacked.body);
            }
            self.events.push(BrokerEvent::Requeued(tag));
        }
        if let Some(q) = self.queues.get_mut(queue) {
            if q.consumer == Some(id) {
                q.consumer = None;
            }
            q.ready.notify_one();
        }
    }
}

/// One live subscription. Dropping it releases the queue.
struct Consumer {
    state: Arc<Mutex<State>>,
    queue: String,
    id: u64,
    auto_ack: bool,
    gate: Option<Arc<Semaphore>>,
    ready: Arc<Notify>,
}

impl Consumer {
    async fn next_delivery(&self) -> Option<BrokerResult<Delivery>> {
        if let Some(gate) = &self.gate {
            match gate.clone().acquire_owned().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Some(Err(BrokerError::Closed)),
            }
        }
        loop {
            let ready = self.ready.notified();
            let next = self.state.lock().take(self)?;
            match next {
                Some(delivery) => return Some(Ok(delivery)),
                None => ready.await,
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.state.lock().release(&self.queue, self.id);
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `(exchange, routing_key)` to `queue`. The queue must be declared
    /// before messages arrive or they are dropped.
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        self.state
            .lock()
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .push(queue.to_string());
    }

    /// Makes every publish whose body matches `fault` fail.
    pub fn fail_publish_if(&self, fault: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        self.state.lock().fault = Some(Arc::new(fault));
    }

    /// Stops accepting messages for `queue`; its subscription ends after the
    /// backlog is delivered.
    pub fn close_queue(&self, queue: &str) {
        if let Some(q) = self.state.lock().queues.get_mut(queue) {
            q.closed = true;
            q.ready.notify_one();
        }
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    /// Bodies accepted by `publish`, in acceptance order.
    pub fn published(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Published { body, .. } => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages waiting in `queue`, not counting unacked deliveries.
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let existing = state.queues.get(&spec.name).map(|q| q.spec.clone());
        match existing {
            Some(existing) if existing != *spec => {
                return Err(BrokerError::PreconditionFailed(spec.name.clone()));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    Queue {
                        spec: spec.clone(),
                        backlog: VecDeque::new(),
                        closed: false,
                        consumer: None,
                        ready: Arc::new(Notify::new()),
                    },
                );
            }
        }
        state.events.push(BrokerEvent::Declared(spec.clone()));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(fault) = &state.fault {
            if fault(&message.body) {
                return Err(BrokerError::Publish(format!(
                    "rejected {} byte message",
                    message.body.len()
                )));
            }
        }
        for queue in state.routes(exchange, routing_key) {
            if let Some(q) = state.queues.get_mut(&queue).filter(|q| !q.closed) {
                q.backlog.push_back(message.body.clone());
                q.ready.notify_one();
            }
        }
        state.events.push(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body.clone(),
        });
        Ok(())
    }

    async fn set_qos(&self, prefetch: u16) -> BrokerResult<()> {
        let mut state = self.state.lock();
        state.prefetch = prefetch;
        state.events.push(BrokerEvent::Qos(prefetch));
        Ok(())
    }

    async fn subscribe(&self, queue: &str, auto_ack: bool) -> BrokerResult<Subscription> {
        let consumer = {
            let mut state = self.state.lock();
            state.next_consumer += 1;
            let id = state.next_consumer;
            let prefetch = state.prefetch;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Subscribe {
                    queue: queue.to_string(),
                    reason: "no such queue".into(),
                })?;
            if q.consumer.is_some() {
                return Err(BrokerError::Subscribe {
                    queue: queue.to_string(),
                    reason: "queue already has a consumer".into(),
                });
            }
            q.consumer = Some(id);
            let ready = q.ready.clone();
            state.events.push(BrokerEvent::Subscribed {
                queue: queue.to_string(),
                auto_ack,
            });
            Consumer {
                state: self.state.clone(),
                queue: queue.to_string(),
                id,
                auto_ack,
                gate: (!auto_ack && prefetch > 0)
                    .then(|| Arc::new(Semaphore::new(prefetch as usize))),
                ready,
            }
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((delivery, consumer))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, handle: AckHandle) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let unacked = state
            .unacked
            .remove(&handle.0)
            .ok_or_else(|| BrokerError::Ack {
                tag: handle.0,
                reason: "unknown delivery tag".into(),
            })?;
        if let Some(gate) = unacked.gate {
            gate.add_permits(1);
        }
        state.events.push(BrokerEvent::Acked(handle.0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(body: &'static str) -> Message {
        Message::now(Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_but_checks_properties() {
        let broker = MemoryBroker::new();
        let spec = QueueSpec::transient("q");
        broker.declare_queue(&spec).await.unwrap();
        broker.declare_queue(&spec).await.unwrap();

        let durable = QueueSpec {
            durable: true,
            ..spec
        };
        assert!(matches!(
            broker.declare_queue(&durable).await,
            Err(BrokerError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn named_exchange_routes_through_bindings() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        broker.bind("events", "k", "q");

        broker.publish("events", "k", &msg("bound")).await.unwrap();
        broker.publish("events", "other", &msg("dropped")).await.unwrap();
        broker.close_queue("q");

        let bodies: Vec<Bytes> = broker
            .subscribe("q", true)
            .await
            .unwrap()
            .map(|d| d.unwrap().body)
            .collect()
            .await;
        assert_eq!(bodies, vec![Bytes::from_static(b"bound")]);
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        broker.publish("", "q", &msg("a")).await.unwrap();

        let mut sub = broker.subscribe("q", false).await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();
        broker.ack(delivery.ack).await.unwrap();
        assert!(matches!(
            broker.ack(delivery.ack).await,
            Err(BrokerError::Ack { .. })
        ));
    }

    #[tokio::test]
    async fn prefetch_holds_back_unacked_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        broker.set_qos(1).await.unwrap();
        broker.publish("", "q", &msg("a")).await.unwrap();
        broker.publish("", "q", &msg("b")).await.unwrap();

        let mut sub = broker.subscribe("q", false).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err());

        broker.ack(first.ack).await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(&second.body[..], b"b");
    }

    #[tokio::test]
    async fn second_consumer_is_refused() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        let _sub = broker.subscribe("q", true).await.unwrap();
        assert!(broker.subscribe("q", true).await.is_err());
    }

    #[tokio::test]
    async fn dropped_subscription_frees_the_queue() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        for body in ["a", "b", "c"] {
            broker.publish("", "q", &msg(body)).await.unwrap();
        }

        let mut sub = broker.subscribe("q", true).await.unwrap();
        assert_eq!(&sub.next().await.unwrap().unwrap().body[..], b"a");
        drop(sub);
        assert_eq!(broker.depth("q"), 2);

        let mut sub = broker.subscribe("q", true).await.unwrap();
        assert_eq!(&sub.next().await.unwrap().unwrap().body[..], b"b");
    }

    #[tokio::test]
    async fn unacked_deliveries_are_requeued_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();
        for body in ["a", "b", "c"] {
            broker.publish("", "q", &msg(body)).await.unwrap();
        }

        let mut sub = broker.subscribe("q", false).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        broker.ack(first.ack).await.unwrap();
        sub.next().await.unwrap().unwrap();
        sub.next().await.unwrap().unwrap();
        drop(sub);

        assert_eq!(broker.unacked(), 0);
        assert!(broker.events().contains(&BrokerEvent::Requeued(2)));
        assert!(broker.events().contains(&BrokerEvent::Requeued(3)));

        broker.close_queue("q");
        let bodies: Vec<Bytes> = broker
            .subscribe("q", true)
            .await
            .unwrap()
            .map(|d| d.unwrap().body)
            .collect()
            .await;
        assert_eq!(bodies, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[tokio::test]
    async fn messages_wait_for_a_late_consumer() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueSpec::transient("q")).await.unwrap();

        let mut sub = broker.subscribe("q", true).await.unwrap();
        let pending = tokio::spawn(async move { sub.next().await.unwrap().unwrap().body });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("", "q", &msg("late")).await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&body[..], b"late");
    }
}
