// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Subscribes handlers to queues. Each subscription sets the channel prefetch,
//! registers a manual-ack consumer and drives its deliveries on a spawned task
//! with at most `prefetch` handlers in flight.
//!
//! Subscriptions are bound to the channel they were created on: when that
//! connection is lost the delivery stream ends and the subscription finishes.

use crate::{
    configs::RabbitMQConfigs,
    connection::ConnectionManager,
    consumer::{consume, ConsumerContext},
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::RabbitMQPublisher,
    retry::{RetryPolicy, RetryScheduler, TokioRetryScheduler},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Unacknowledged deliveries the broker may push, which is also the
    /// number of handlers running at once
    pub prefetch: u16,
    /// Total attempts before a failing message is dead-lettered
    pub max_retries: u32,
    /// Hold the delivery until the retry copy is re-published and acknowledge
    /// only if the broker accepted it
    pub confirm_retry: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: 1,
            max_retries: 3,
            confirm_retry: false,
        }
    }
}

impl ConsumeOptions {
    pub fn from_configs(cfg: &RabbitMQConfigs) -> ConsumeOptions {
        ConsumeOptions {
            prefetch: cfg.prefetch,
            max_retries: cfg.max_retries,
            ..Default::default()
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn confirm_retry(mut self) -> Self {
        self.confirm_retry = true;
        self
    }
}

/// A running subscription.
///
/// Dropping the handle leaves the subscription running.
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops taking new deliveries. Handlers already running finish and settle
    /// their deliveries; those not yet taken stay unacknowledged on the broker.
    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Waits until the subscription has finished.
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), queue = %self.queue, "consumer task failure");
            AmqpError::InternalError
        })
    }
}

/// RabbitMQ consumer front-end.
pub struct RabbitMQDispatcher {
    manager: Arc<ConnectionManager>,
    publisher: Arc<RabbitMQPublisher>,
    scheduler: Arc<dyn RetryScheduler>,
    // basic.qos applies to consumers registered after it on the shared channel
    setup: Mutex<()>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher that retries through `publisher`.
    pub fn new(manager: Arc<ConnectionManager>, publisher: Arc<RabbitMQPublisher>) -> Self {
        RabbitMQDispatcher {
            manager,
            publisher,
            scheduler: Arc::new(TokioRetryScheduler),
            setup: Mutex::new(()),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// Returns once the consumer is registered. Connection, QoS and consumer
    /// registration failures are returned here; handler failures never are.
    /// Concurrent calls register one at a time so each consumer gets its own
    /// prefetch.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<SubscriptionHandle, AmqpError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let deliveries = {
            let _setup = self.setup.lock().await;
            let channel = self.manager.connect().await?;
            channel.qos(options.prefetch).await?;
            channel.consume(queue, &consumer_tag).await?
        };

        let cx = Arc::new(ConsumerContext {
            queue: queue.to_owned(),
            handler,
            policy: RetryPolicy::new(options.max_retries),
            confirm_retry: options.confirm_retry,
            publisher: self.publisher.clone(),
            scheduler: self.scheduler.clone(),
        });

        let (stop, stopped) = oneshot::channel::<()>();
        let stopped = async move {
            // a dropped handle is not a cancellation
            if stopped.await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let limit = usize::from(options.prefetch.max(1));
        let task = tokio::spawn({
            let queue = queue.to_owned();
            async move {
                let tracer = global::tracer("amqp consumer");
                deliveries
                    .take_until(stopped)
                    .for_each_concurrent(limit, |result| {
                        let cx = cx.clone();
                        let tracer = &tracer;
                        async move {
                            match result {
                                Ok(delivery) => {
                                    if let Err(err) = consume(tracer, delivery, &cx).await {
                                        error!(error = err.to_string(), queue = %cx.queue, "error consume msg");
                                    }
                                }
                                Err(err) => error!(error = err.to_string(), "errors consume msg"),
                            }
                        }
                    })
                    .await;

                warn!(queue = %queue, "consumer stopped");
            }
        });

        info!(queue, consumer_tag = %consumer_tag, prefetch = options.prefetch, "consumer registered");

        Ok(SubscriptionHandle {
            queue: queue.to_owned(),
            consumer_tag,
            stop: Some(stop),
            task,
        })
    }

    /// Subscribes and waits until the subscription ends.
    pub async fn consume_blocking(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError> {
        self.subscribe(queue, handler, options).await?.join().await
    }
}
