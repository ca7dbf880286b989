// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology
//!
//! A static declaration of the exchanges, queues and bindings the payment
//! backend relies on. The descriptor holds no runtime state; it is installed
//! once per connection establishment and broker declarations make repeated
//! installs no-ops. A mismatched redeclaration is rejected by the broker and
//! surfaces as a setup error.
//!
//! Installation order:
//! 1. the dead-letter queue (terminal, with a message TTL)
//! 2. every other queue, dead-letter wired to the DLQ
//! 3. exchanges
//! 4. queue bindings

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// Queue names of the payment topology.
pub mod queues {
    pub const PAYMENT_PROCESSING: &str = "payment.processing";
    pub const PAYMENT_RETRY: &str = "payment.retry";
    pub const PAYMENT_DLQ: &str = "payment.dlq";
    pub const SETTLEMENT_CALCULATION: &str = "settlement.calculation";
    pub const FRAUD_DETECTION: &str = "fraud.detection";
    pub const WEBHOOK_DELIVERY: &str = "webhook.delivery";
    pub const SUBSCRIPTION_BILLING: &str = "subscription.billing";
    pub const CURRENCY_UPDATE: &str = "currency.update";
    pub const CHARGEBACK_NOTIFICATION: &str = "chargeback.notification";

    /// Every work queue, i.e. all queues except the DLQ.
    pub const WORK_QUEUES: [&str; 8] = [
        PAYMENT_PROCESSING,
        PAYMENT_RETRY,
        SETTLEMENT_CALCULATION,
        FRAUD_DETECTION,
        WEBHOOK_DELIVERY,
        SUBSCRIPTION_BILLING,
        CURRENCY_UPDATE,
        CHARGEBACK_NOTIFICATION,
    ];
}

/// Exchange names of the payment topology.
pub mod exchanges {
    pub const PAYMENT: &str = "payment.exchange";
    pub const NOTIFICATION: &str = "notification.exchange";
}

/// Time-to-live of dead letters awaiting operator review: 24 hours.
pub const DLQ_MESSAGE_TTL_MS: i32 = 86_400_000;

/// Routing pattern binding `payment.processing` to `payment.exchange`.
pub const PAYMENT_ROUTING_PATTERN: &str = "payment.#";

/// Declarative topology with a single terminal dead-letter queue.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) dlq: Option<QueueDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// The fixed topology of the payment backend.
    pub fn payments() -> AmqpTopology {
        let mut topology = AmqpTopology::new().dead_letter_queue(
            QueueDefinition::new(queues::PAYMENT_DLQ)
                .durable()
                .ttl(DLQ_MESSAGE_TTL_MS),
        );

        for name in queues::WORK_QUEUES {
            topology = topology.queue(QueueDefinition::new(name).durable());
        }

        topology
            .exchange(ExchangeDefinition::new(exchanges::PAYMENT).topic().durable())
            .exchange(
                ExchangeDefinition::new(exchanges::NOTIFICATION)
                    .fanout()
                    .durable(),
            )
            .queue_binding(
                QueueBinding::new(queues::PAYMENT_PROCESSING)
                    .exchange(exchanges::PAYMENT)
                    .routing_key(PAYMENT_ROUTING_PATTERN),
            )
            .queue_binding(
                QueueBinding::new(queues::WEBHOOK_DELIVERY).exchange(exchanges::NOTIFICATION),
            )
    }

    /// Sets the terminal queue. Any dead-letter wiring on `def` is dropped.
    pub fn dead_letter_queue(mut self, def: QueueDefinition) -> Self {
        self.dlq = Some(def.without_dead_letter());
        self
    }

    /// Adds a work queue. When a DLQ is set, the queue is wired to it at install.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq.as_ref().map(|d| d.name())
    }

    /// Work queue definitions as they are declared, dead-letter wiring included.
    pub fn work_queues(&self) -> Vec<QueueDefinition> {
        self.queues
            .iter()
            .filter(|def| Some(def.name()) != self.dlq_name())
            .map(|def| match self.dlq_name() {
                Some(dlq) => def.clone().dead_letter_to(dlq),
                None => def.clone(),
            })
            .collect()
    }

    /// Applies the topology to the broker.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        self.install_dlq(channel).await?;
        self.install_queues(channel).await?;
        self.install_exchanges(channel).await?;
        self.binding_queues(channel).await?;

        debug!("rabbitmq topology installed");
        Ok(())
    }

    async fn install_dlq(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        if let Some(dlq) = &self.dlq {
            debug!("creating dead letter queue: {}", dlq.name);
            channel.declare_queue(dlq).await?;
        }
        Ok(())
    }

    async fn install_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for def in self.work_queues() {
            debug!("creating queue: {}", def.name);
            channel.declare_queue(&def).await?;
            debug!("queue: {} was created", def.name);
        }
        Ok(())
    }

    async fn install_exchanges(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }
        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            channel.bind_queue(binding).await?;
        }
        Ok(())
    }
}
