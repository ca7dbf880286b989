// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Models just enough AMQP: declare with mismatch detection, default-exchange,
//! topic and fan-out routing, manual ack/nack with dead-lettering through the
//! queue's `x-dead-letter-routing-key`, flow blocking and connection loss.

use crate::{
    channel::{
        Acknowledger, AmqpChannel, BrokerLink, Connector, DeliveryStream, InboundDelivery,
        PublishStatus, QueueStats,
    },
    envelope::Envelope,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

struct Subscriber {
    channel_id: u64,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

struct FakeQueue {
    def: QueueDefinition,
    ready: VecDeque<Envelope>,
    subscribers: Vec<Subscriber>,
    next: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, FakeQueue>,
    exchanges: HashMap<String, ExchangeDefinition>,
    bindings: Vec<QueueBinding>,
    channels: Vec<Arc<FakeChannel>>,
    acked: Vec<(String, Envelope)>,
    nacked: Vec<(String, Envelope)>,
    published: Vec<(String, String, Envelope)>,
    qos: Vec<u16>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
    saturated: Arc<AtomicBool>,
    next_channel: Arc<AtomicU64>,
    next_tag: Arc<AtomicU64>,
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    go(&p, &k)
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    /// Opens a channel that is not tracked by any connection manager.
    pub(crate) fn channel(&self) -> Arc<FakeChannel> {
        let (tx, _rx) = mpsc::unbounded_channel();
        self.open_channel(tx)
    }

    fn open_channel(&self, lost: mpsc::UnboundedSender<AmqpError>) -> Arc<FakeChannel> {
        let channel = Arc::new(FakeChannel {
            id: self.next_channel.fetch_add(1, Ordering::SeqCst),
            broker: self.clone(),
            open: AtomicBool::new(true),
            lost: Mutex::new(Some(lost)),
        });
        self.state.lock().unwrap().channels.push(channel.clone());
        channel
    }

    pub(crate) fn set_saturated(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::SeqCst);
    }

    /// Closes every open channel as a broker-side failure would.
    pub(crate) fn drop_connections(&self) {
        let channels: Vec<Arc<FakeChannel>> = {
            let mut state = self.state.lock().unwrap();
            for queue in state.queues.values_mut() {
                queue.subscribers.clear();
            }
            state.channels.drain(..).collect()
        };

        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
            if let Some(lost) = channel.lost.lock().unwrap().take() {
                let _ = lost.send(AmqpError::ChannelClosed("connection reset".to_owned()));
            }
        }
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.state.lock().unwrap().queues.keys().cloned().collect()
    }

    pub(crate) fn exchange_names(&self) -> Vec<String> {
        self.state.lock().unwrap().exchanges.keys().cloned().collect()
    }

    pub(crate) fn queue_definition(&self, queue: &str) -> Option<QueueDefinition> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.def.clone())
    }

    /// Ready (undelivered) messages of `queue`.
    pub(crate) fn messages(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn acked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .acked
            .iter()
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub(crate) fn nacked(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .nacked
            .iter()
            .filter(|(q, _)| q == queue)
            .count()
    }

    /// Every accepted publish as `(exchange, routing_key, envelope)`.
    pub(crate) fn published(&self) -> Vec<(String, String, Envelope)> {
        self.state.lock().unwrap().published.clone()
    }

    pub(crate) fn qos_calls(&self) -> Vec<u16> {
        self.state.lock().unwrap().qos.clone()
    }

    fn enqueue(&self, state: &mut State, queue: &str, envelope: Envelope) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        let mut pending = Some(envelope);
        while let Some(envelope) = pending.take() {
            if q.subscribers.is_empty() {
                q.ready.push_back(envelope);
                break;
            }

            let idx = q.next % q.subscribers.len();
            q.next = q.next.wrapping_add(1);
            let delivery = self.delivery(queue, envelope);
            if let Err(mpsc::error::SendError(returned)) = q.subscribers[idx].tx.send(delivery) {
                q.subscribers.remove(idx);
                pending = Some(returned.envelope);
            }
        }
    }

    fn delivery(&self, queue: &str, envelope: Envelope) -> InboundDelivery {
        InboundDelivery {
            envelope: envelope.clone(),
            delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
            redelivered: false,
            acker: Box::new(FakeAcker {
                broker: self.clone(),
                queue: queue.to_owned(),
                envelope,
                settled: AtomicBool::new(false),
            }),
        }
    }

    fn route(&self, state: &mut State, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_owned()];
        }

        let Some(kind) = state.exchanges.get(exchange).map(|e| e.exchange_kind()) else {
            return vec![];
        };

        state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue_name.clone())
            .collect()
    }
}

pub(crate) struct FakeChannel {
    id: u64,
    broker: FakeBroker,
    open: AtomicBool,
    lost: Mutex<Option<mpsc::UnboundedSender<AmqpError>>>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    FakeQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        subscribers: vec![],
                        next: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PublishStatus, AmqpError> {
        self.ensure_open()?;
        if self.broker.saturated.load(Ordering::SeqCst) {
            return Ok(PublishStatus::Saturated);
        }

        let mut state = self.broker.state.lock().unwrap();
        state.published.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            envelope.clone(),
        ));
        for queue in self.broker.route(&mut state, exchange, routing_key) {
            self.broker.enqueue(&mut state, &queue, envelope.clone());
        }
        Ok(PublishStatus::Accepted)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state.lock().unwrap().qos.push(prefetch);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.broker.state.lock().unwrap();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };
            let backlog: Vec<Envelope> = q.ready.drain(..).collect();
            for envelope in backlog {
                let _ = tx.send(self.broker.delivery(queue, envelope));
            }
            q.subscribers.push(Subscriber {
                channel_id: self.id,
                tx,
            });
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError> {
        self.ensure_open()?;
        let state = self.broker.state.lock().unwrap();
        state
            .queues
            .get(queue)
            .map(|q| QueueStats {
                message_count: q.ready.len() as u32,
                consumer_count: q.subscribers.len() as u32,
            })
            .ok_or_else(|| AmqpError::QueueInspectError(queue.to_owned()))
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::PurgeQueueError(queue.to_owned()))?;
        let purged = q.ready.len() as u32;
        q.ready.clear();
        Ok(purged)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.lost.lock().unwrap().take();

        let mut state = self.broker.state.lock().unwrap();
        for q in state.queues.values_mut() {
            q.subscribers.retain(|s| s.channel_id != self.id);
        }
        state.channels.retain(|c| c.id != self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct FakeAcker {
    broker: FakeBroker,
    queue: String,
    envelope: Envelope,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        assert!(!self.settled.swap(true, Ordering::SeqCst), "delivery settled twice");
        let mut state = self.broker.state.lock().unwrap();
        state.acked.push((self.queue.clone(), self.envelope.clone()));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        assert!(!self.settled.swap(true, Ordering::SeqCst), "delivery settled twice");
        let mut state = self.broker.state.lock().unwrap();
        state.nacked.push((self.queue.clone(), self.envelope.clone()));

        let target = if requeue {
            Some(self.queue.clone())
        } else {
            state
                .queues
                .get(&self.queue)
                .and_then(|q| q.def.dead_letter_queue().map(str::to_owned))
        };

        if let Some(target) = target {
            self.broker.enqueue(&mut state, &target, self.envelope.clone());
        }
        Ok(())
    }
}

/// Connector handing out channels of a `FakeBroker`; fails while `failures` > 0.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    broker: FakeBroker,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub(crate) fn new(broker: &FakeBroker) -> FakeConnector {
        FakeConnector {
            broker: broker.clone(),
            failures: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<BrokerLink, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AmqpError::ConnectionError);
        }

        let (tx, lost) = mpsc::unbounded_channel();
        Ok(BrokerLink {
            channel: self.broker.open_channel(tx),
            lost,
        })
    }
}

#[test]
fn topic_patterns() {
    assert!(topic_matches("payment.#", "payment.created"));
    assert!(topic_matches("payment.#", "payment.card.captured"));
    assert!(topic_matches("payment.#", "payment"));
    assert!(topic_matches("payment.*", "payment.created"));
    assert!(!topic_matches("payment.*", "payment.card.captured"));
    assert!(!topic_matches("payment.#", "refund.created"));
}
