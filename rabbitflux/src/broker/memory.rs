//! In-process broker.
//!
//! Implements the subset of AMQP 0-9-1 the service engine relies on: the
//! default exchange, durable topic exchanges, mandatory returns, exclusive and
//! auto-delete queues, per-channel prefetch, ack/reject with requeue, message
//! expiration and requeue of unacknowledged messages when a channel closes.
//! Selected with a `memory://<name>` broker address.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Broker, BrokerChannel, Delivery, DeliveryStream, PublishOutcome, QueueOptions, DEFAULT_EXCHANGE};
use crate::error::{FluxError, Result};
use crate::message::Envelope;
use crate::router::topic_matches;

/// Broker living entirely inside the process
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    next_channel: AtomicU64,
    connected: AtomicBool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    /// topic exchange name -> bindings
    exchanges: HashMap<String, Vec<Binding>>,
    channels: HashMap<u64, ChannelState>,
}

struct Binding {
    queue: String,
    pattern: String,
}

struct QueueState {
    options: QueueOptions,
    owner: u64,
    ready: VecDeque<Queued>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Queued {
    envelope: Envelope,
    expires_at: Option<Instant>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    envelope: Envelope,
    expires_at: Option<Instant>,
}

impl MemoryBroker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                next_channel: AtomicU64::new(0),
                connected: AtomicBool::new(true),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of messages waiting in `queue`, `None` when the queue does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state.lock().queues.get(queue).map(|q| q.ready.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(FluxError::broker_error("connection is closed"));
        }
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.lock().channels.insert(id, ChannelState::default());
        debug!(broker = %self.inner.name, channel_id = id, "Opened channel");
        Ok(Arc::new(MemoryChannel {
            id,
            inner: self.inner.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        // dropping every consumer sender ends all delivery streams
        *self.inner.state.lock() = State::default();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    id: u64,
    inner: Arc<Inner>,
}

impl State {
    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| FluxError::broker_error(format!("channel {id} is closed")))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| FluxError::broker_error(format!("no exchange '{exchange}'")))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in bindings {
            if topic_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for bindings in self.exchanges.values_mut() {
                bindings.retain(|binding| binding.queue != name);
            }
            debug!("Deleted queue: {}", name);
        }
    }

    /// Remove a consumer, deleting its queue when it was the last consumer of an auto-delete queue
    fn remove_consumer(&mut self, channel: u64, consumer_tag: &str) {
        let mut emptied = None;
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|consumer| !(consumer.channel == channel && consumer.tag == consumer_tag));
            if queue.consumers.len() != before {
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            self.delete_queue(&name);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(Queued {
                envelope: unacked.envelope,
                expires_at: unacked.expires_at,
                redelivered: true,
            });
        }
    }

    fn pump_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.pump(&name);
        }
    }

    /// Hand ready messages to consumers that have prefetch capacity, round-robin
    fn pump(&mut self, queue_name: &str) {
        let State { queues, channels, .. } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        let now = Instant::now();
        while let Some(front) = queue.ready.front() {
            if front.expires_at.is_some_and(|at| at <= now) {
                queue.ready.pop_front();
                continue;
            }

            queue.consumers.retain(|consumer| !consumer.sender.is_closed());
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    consumer.no_ack
                        || channels.get(&consumer.channel).is_some_and(|channel| {
                            channel.prefetch == 0 || channel.unacked.len() < usize::from(channel.prefetch)
                        })
                });
            let Some(index) = chosen else {
                break;
            };
            let Some(queued) = queue.ready.pop_front() else {
                break;
            };
            queue.next_consumer = (index + 1) % count;

            let consumer = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                break;
            };
            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        envelope: queued.envelope.clone(),
                        expires_at: queued.expires_at,
                    },
                );
            }

            let delivery = Delivery {
                delivery_tag,
                redelivered: queued.redelivered,
                envelope: queued.envelope,
            };
            if let Err(mpsc::error::SendError(delivery)) = consumer.sender.send(delivery) {
                // consumer went away between the liveness check and the send
                channel.unacked.remove(&delivery_tag);
                queue.ready.push_front(Queued {
                    envelope: delivery.envelope,
                    expires_at: queued.expires_at,
                    redelivered: delivery.redelivered,
                });
            }
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?.prefetch = count;
        state.pump_all();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.options.exclusive && existing.owner != self.id {
                return Err(FluxError::broker_error(format!(
                    "queue '{name}' is exclusive to another channel"
                )));
            }
            return Ok(());
        }

        state.queues.insert(
            name.to_string(),
            QueueState {
                options,
                owner: self.id,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        debug!("Declared queue: {}", name);
        Ok(())
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?;
        state.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(FluxError::broker_error(format!("no queue '{queue}'")));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| FluxError::broker_error(format!("no exchange '{exchange}'")))?;
        if !bindings.iter().any(|b| b.queue == queue && b.pattern == routing_key) {
            bindings.push(Binding {
                queue: queue.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        debug!("Bound {} to {} with {}", queue, exchange, routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            state.channel(self.id)?;
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| FluxError::broker_error(format!("no queue '{queue}'")))?;
            if target.options.exclusive && target.owner != self.id {
                return Err(FluxError::broker_error(format!(
                    "queue '{queue}' is exclusive to another channel"
                )));
            }
            target.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                channel: self.id,
                no_ack,
                sender,
            });
            state.pump(queue);
        }

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?;
        state.remove_consumer(self.id, consumer_tag);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<PublishOutcome> {
        let mut state = self.inner.state.lock();
        state.channel(self.id)?;

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            return Ok(if envelope.mandatory {
                PublishOutcome::Returned
            } else {
                PublishOutcome::Routed
            });
        }

        let expires_at = envelope.expiration.map(|ttl| Instant::now() + ttl);
        for target in &targets {
            if let Some(queue) = state.queues.get_mut(target) {
                queue.ready.push_back(Queued {
                    envelope: envelope.clone(),
                    expires_at,
                    redelivered: false,
                });
            }
            state.pump(target);
        }
        Ok(PublishOutcome::Routed)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        state
            .channel(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| FluxError::broker_error(format!("unknown delivery tag {delivery_tag}")))?;
        state.pump_all();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        let unacked = state
            .channel(self.id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| FluxError::broker_error(format!("unknown delivery tag {delivery_tag}")))?;
        if requeue {
            state.requeue(unacked);
        }
        state.pump_all();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(channel) = state.channels.remove(&self.id) else {
            return Ok(());
        };

        let tags: Vec<String> = state
            .queues
            .values()
            .flat_map(|queue| queue.consumers.iter())
            .filter(|consumer| consumer.channel == self.id)
            .map(|consumer| consumer.tag.clone())
            .collect();
        for tag in tags {
            state.remove_consumer(self.id, &tag);
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.options.exclusive && queue.owner == self.id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.delete_queue(&name);
        }

        for (_, unacked) in channel.unacked {
            state.requeue(unacked);
        }
        state.pump_all();
        debug!(channel_id = self.id, "Closed channel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{binding_key, path_to_routing_key};
    use std::time::Duration;

    fn envelope(id: &str) -> Envelope {
        Envelope::new_request(id, None, Duration::from_secs(5), b"{}".to_vec())
    }

    async fn next(deliveries: &mut DeliveryStream) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(100), deliveries.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();
        let mut deliveries = channel.consume("svc", "c1", false).await.unwrap();

        let outcome = channel.publish(DEFAULT_EXCHANGE, "svc", envelope("m1")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Routed);
        assert_eq!(next(&mut deliveries).await.unwrap().envelope.message_id, "m1");

        let outcome = channel.publish(DEFAULT_EXCHANGE, "nobody", envelope("m2")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Returned);
    }

    #[tokio::test]
    async fn test_unroutable_without_mandatory_is_dropped() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        let mut message = envelope("m1");
        message.mandatory = false;
        let outcome = channel.publish(DEFAULT_EXCHANGE, "nobody", message).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Routed);
    }

    #[tokio::test]
    async fn test_topic_exchange_routes_sub_paths() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();
        channel.declare_topic_exchange("resources.exchange").await.unwrap();
        channel
            .bind_queue("svc", "resources.exchange", &binding_key("/a/b"))
            .await
            .unwrap();
        let mut deliveries = channel.consume("svc", "c1", true).await.unwrap();

        for path in ["/a/b", "/a/b/c"] {
            let outcome = channel
                .publish("resources.exchange", &path_to_routing_key(path), envelope(path))
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Routed);
            assert_eq!(next(&mut deliveries).await.unwrap().envelope.message_id, path);
        }

        let outcome = channel
            .publish("resources.exchange", &path_to_routing_key("/a/c"), envelope("/a/c"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Returned);
        assert!(channel.publish("missing.exchange", "a", envelope("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();
        let mut deliveries = channel.consume("svc", "c1", false).await.unwrap();

        channel.publish(DEFAULT_EXCHANGE, "svc", envelope("m1")).await.unwrap();
        channel.publish(DEFAULT_EXCHANGE, "svc", envelope("m2")).await.unwrap();

        let first = next(&mut deliveries).await.unwrap();
        assert_eq!(first.envelope.message_id, "m1");
        assert!(next(&mut deliveries).await.is_none());
        assert_eq!(broker.queue_depth("svc"), Some(1));

        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(next(&mut deliveries).await.unwrap().envelope.message_id, "m2");
        assert!(channel.ack(first.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();
        let mut deliveries = channel.consume("svc", "c1", false).await.unwrap();

        channel.publish(DEFAULT_EXCHANGE, "svc", envelope("m1")).await.unwrap();
        let first = next(&mut deliveries).await.unwrap();
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = next(&mut deliveries).await.unwrap();
        assert_eq!(again.envelope.message_id, "m1");
        assert!(again.redelivered);

        channel.nack(again.delivery_tag, false).await.unwrap();
        assert!(next(&mut deliveries).await.is_none());
        assert_eq!(broker.queue_depth("svc"), Some(0));
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer_until_expired() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();

        let short = Envelope::new_request("short", None, Duration::from_millis(10), vec![]);
        channel.publish(DEFAULT_EXCHANGE, "svc", short).await.unwrap();
        channel.publish(DEFAULT_EXCHANGE, "svc", envelope("long")).await.unwrap();
        assert_eq!(broker.queue_depth("svc"), Some(2));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut deliveries = channel.consume("svc", "c1", true).await.unwrap();
        assert_eq!(next(&mut deliveries).await.unwrap().envelope.message_id, "long");
        assert!(next(&mut deliveries).await.is_none());
    }

    #[tokio::test]
    async fn test_private_queue_removed_with_its_consumer() {
        let broker = MemoryBroker::new("test");
        let owner = broker.open_channel().await.unwrap();
        let other = broker.open_channel().await.unwrap();
        owner.declare_queue("svc.abc", QueueOptions::private()).await.unwrap();
        assert!(other.declare_queue("svc.abc", QueueOptions::private()).await.is_err());

        let mut deliveries = owner.consume("svc.abc", "c1", true).await.unwrap();
        owner.cancel("c1").await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("svc.abc"), None);

        let outcome = other.publish(DEFAULT_EXCHANGE, "svc.abc", envelope("m1")).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Returned);
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked() {
        let broker = MemoryBroker::new("test");
        let first = broker.open_channel().await.unwrap();
        let second = broker.open_channel().await.unwrap();
        first.declare_queue("svc", QueueOptions::durable()).await.unwrap();

        let mut held = first.consume("svc", "c1", false).await.unwrap();
        first.publish(DEFAULT_EXCHANGE, "svc", envelope("m1")).await.unwrap();
        assert!(next(&mut held).await.is_some());

        let mut takeover = second.consume("svc", "c2", false).await.unwrap();
        first.close().await.unwrap();
        assert!(held.next().await.is_none());

        let redelivered = next(&mut takeover).await.unwrap();
        assert_eq!(redelivered.envelope.message_id, "m1");
        assert!(redelivered.redelivered);
        assert!(first.publish(DEFAULT_EXCHANGE, "svc", envelope("m2")).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_channels() {
        let broker = MemoryBroker::new("test");
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("svc", QueueOptions::durable()).await.unwrap();
        let mut deliveries = channel.consume("svc", "c1", true).await.unwrap();

        broker.close().await.unwrap();
        assert!(!broker.is_connected());
        assert!(deliveries.next().await.is_none());
        assert!(broker.open_channel().await.is_err());
    }
}
