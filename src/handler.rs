// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Message handlers invoked by the consumer.
//!
//! Handlers report their outcome as a `Result`; the consumer matches on it to
//! pick ack, retry or dead-letter. Handlers must be idempotent: delivery is
//! at-least-once.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{future::Future, sync::Arc};

/// A deserialized delivery as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub msg_type: String,
    pub payload: Value,
    /// Failed attempts before this one, 0 on the first attempt
    pub retry_count: u32,
    pub redelivered: bool,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
