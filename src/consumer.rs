// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The per-delivery state machine. For each delivery:
//! 1. the retry count is read from the envelope and a consumer span is opened
//! 2. the body is parsed and the handler is invoked
//! 3. the `RetryPolicy` maps the handler outcome to a `Disposition`
//! 4. the delivery is settled with exactly one ack or nack
//!
//! Interim retries are re-published by the application after a backoff; the
//! terminal path is a nack without requeue that the broker dead-letters.

use crate::{
    channel::InboundDelivery,
    envelope::Envelope,
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    publisher::RabbitMQPublisher,
    retry::{Disposition, RetryPolicy, RetryScheduler},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, info, warn};

/// Everything a subscription needs to settle its deliveries.
pub(crate) struct ConsumerContext {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) policy: RetryPolicy,
    pub(crate) confirm_retry: bool,
    pub(crate) publisher: Arc<RabbitMQPublisher>,
    pub(crate) scheduler: Arc<dyn RetryScheduler>,
}

fn record_failure(span: &mut BoxedSpan, err: &dyn std::error::Error, description: &'static str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}

/// Handles one delivery and settles it.
///
/// Handler failures never surface here: they become a retry or a dead letter.
/// Only ack/nack failures are returned, and in that case the broker still owns
/// the delivery and will redeliver it once the channel is gone.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: InboundDelivery,
    cx: &ConsumerContext,
) -> Result<Disposition, AmqpError> {
    let InboundDelivery {
        envelope,
        redelivered,
        acker,
        ..
    } = delivery;

    let msg_type = envelope.msg_type();
    let previous = envelope.retry_count();
    let span_name = if msg_type.is_empty() {
        cx.queue.clone()
    } else {
        msg_type.clone()
    };
    let (ctx, mut span) = otel::new_span(&envelope, tracer, &span_name);

    debug!(
        queue = %cx.queue,
        retry_count = previous,
        redelivered,
        "processing message from queue"
    );

    let outcome = match serde_json::from_slice::<Value>(&envelope.payload) {
        Ok(payload) => {
            let msg = ConsumerMessage {
                queue: cx.queue.clone(),
                msg_type,
                payload,
                retry_count: previous,
                redelivered,
            };
            cx.handler.exec(&ctx, &msg).await
        }
        Err(err) => Err(HandlerError::Malformed(err.to_string())),
    };

    if let Err(err) = &outcome {
        error!(
            queue = %cx.queue,
            error = err.to_string(),
            "error processing message from queue"
        );
        record_failure(&mut span, err, "handler failure");
    }

    let disposition = cx.policy.decide(&outcome, previous);
    match disposition {
        Disposition::Ack => {
            acker.ack().await.inspect_err(|e| {
                record_failure(&mut span, e, "error to ack msg");
            })?;
            span.set_status(Status::Ok);
            debug!(queue = %cx.queue, "message acknowledged");
        }

        Disposition::Retry { retry_count, delay } => {
            let next = Envelope::retry_of(&envelope, retry_count);

            if cx.confirm_retry {
                cx.scheduler.wait(delay).await;
                if !cx.publisher.publish_envelope("", &cx.queue, &next).await {
                    error!(
                        queue = %cx.queue,
                        retry_count,
                        "retry was not accepted by the broker, sending to dlq"
                    );
                    acker.nack(false).await.inspect_err(|e| {
                        record_failure(&mut span, e, "error to nack msg");
                    })?;
                    return Ok(Disposition::DeadLetter {
                        attempts: retry_count,
                    });
                }
                acker.ack().await.inspect_err(|e| {
                    record_failure(&mut span, e, "error to ack msg");
                })?;
            } else {
                // The original is acked before the delayed re-publish runs: a
                // crash in between loses the work item.
                let publisher = cx.publisher.clone();
                let queue = cx.queue.clone();
                cx.scheduler.schedule(
                    delay,
                    async move {
                        if !publisher.publish_envelope("", &queue, &next).await {
                            error!(queue = %queue, retry_count, "failure to re-publish message for retry");
                        }
                    }
                    .boxed(),
                );
                acker.ack().await.inspect_err(|e| {
                    record_failure(&mut span, e, "error to ack msg");
                })?;
            }

            warn!(
                queue = %cx.queue,
                retry_count,
                max_retries = cx.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "message requeued"
            );
        }

        Disposition::DeadLetter { attempts } => {
            acker.nack(false).await.inspect_err(|e| {
                record_failure(&mut span, e, "error to nack msg");
            })?;
            span.set_status(Status::Error {
                description: Cow::from("msg was sent to dlq"),
            });
            error!(queue = %cx.queue, attempts, "too many attempts, message sent to dlq");
        }
    }

    info!(queue = %cx.queue, ?disposition, "message settled");
    Ok(disposition)
}
