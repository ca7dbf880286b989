// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Operator helpers over the broker's queues.
//!
//! The DLQ itself is passive: it is filled only by broker dead-lettering and
//! emptied by its TTL or by an operator. These helpers report depths and purge
//! queues; like the publisher they log failures and never return errors.

use crate::{channel::QueueStats, connection::ConnectionManager};
use std::sync::Arc;
use tracing::{error, info};

pub struct QueueAdmin {
    manager: Arc<ConnectionManager>,
}

impl QueueAdmin {
    pub fn new(manager: Arc<ConnectionManager>) -> QueueAdmin {
        QueueAdmin { manager }
    }

    /// Ready messages and consumers of `queue`, `None` if it cannot be inspected.
    pub async fn stats(&self, queue: &str) -> Option<QueueStats> {
        let channel = match self.manager.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), queue, "error getting queue stats, no channel");
                return None;
            }
        };

        match channel.queue_stats(queue).await {
            Ok(stats) => Some(stats),
            Err(err) => {
                error!(error = err.to_string(), queue, "error getting queue stats");
                None
            }
        }
    }

    /// Drops every ready message of `queue`.
    pub async fn purge(&self, queue: &str) -> bool {
        let channel = match self.manager.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), queue, "error purging queue, no channel");
                return false;
            }
        };

        match channel.purge(queue).await {
            Ok(purged) => {
                info!(queue, purged, "queue purged");
                true
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "error purging queue");
                false
            }
        }
    }

    /// Messages waiting in the dead-letter queue.
    pub async fn dead_letter_depth(&self) -> Option<u32> {
        let dlq = self.manager.topology().dlq_name()?.to_owned();
        self.stats(&dlq).await.map(|stats| stats.message_count)
    }
}
