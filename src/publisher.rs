// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Serializes payloads to JSON and hands them to the broker as persistent
//! envelopes, either straight to a queue (default exchange) or through a
//! routed exchange. Publishing never fails loudly: every problem is logged and
//! reported as `false`. A `false` caused by a saturated connection is a
//! backpressure signal, and the caller decides whether to retry, drop or wait.

use crate::{
    channel::PublishStatus,
    connection::ConnectionManager,
    envelope::{Envelope, PublishOptions},
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct RabbitMQPublisher {
    manager: Arc<ConnectionManager>,
}

impl RabbitMQPublisher {
    /// Creates a new publisher borrowing channels from `manager`.
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { manager })
    }

    /// Publishes `payload` directly to `queue`.
    ///
    /// Connects first when no link exists yet. Returns false when the broker
    /// is unreachable, the payload does not serialize, or the connection is
    /// flow-blocked.
    pub async fn publish_to_queue<T>(
        &self,
        ctx: &Context,
        queue: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
    {
        let Some(envelope) = self.envelope(ctx, payload, options) else {
            return false;
        };

        self.publish_envelope("", queue, &envelope).await
    }

    /// Publishes `payload` to `exchange` with `routing_key`; delivery follows
    /// the exchange type (topic pattern or fan-out).
    pub async fn publish_to_exchange<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> bool
    where
        T: Serialize + ?Sized,
    {
        let Some(envelope) = self.envelope(ctx, payload, options) else {
            return false;
        };

        self.publish_envelope(exchange, routing_key, &envelope).await
    }

    fn envelope<T>(&self, ctx: &Context, payload: &T, options: &PublishOptions) -> Option<Envelope>
    where
        T: Serialize + ?Sized,
    {
        match Envelope::json(payload, options, otel::inject(ctx)) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                error!(error = err.to_string(), "error serializing message");
                None
            }
        }
    }

    /// Sends an already built envelope.
    ///
    /// A publish that fails because the channel went away is retried once
    /// against a freshly obtained channel, never against the stale one.
    pub(crate) async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> bool {
        let mut retried = false;

        loop {
            let channel = match self.manager.connect().await {
                Ok(channel) => channel,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange, routing_key, "error publishing message, no channel"
                    );
                    return false;
                }
            };

            match channel.publish(exchange, routing_key, envelope).await {
                Ok(PublishStatus::Accepted) => {
                    debug!(exchange, routing_key, "message published");
                    return true;
                }
                Ok(PublishStatus::Saturated) => {
                    warn!(exchange, routing_key, "message not sent, channel buffer full");
                    return false;
                }
                Err(err) if err.is_connectivity() && !retried => {
                    warn!(
                        error = err.to_string(),
                        exchange, routing_key, "channel closed while publishing, retrying"
                    );
                    retried = true;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange, routing_key, "error publishing message"
                    );
                    return false;
                }
            }
        }
    }
}
