// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use paystream_rabbitmq::{
    configs::RabbitMQConfigs,
    connection::ConnectionManager,
    dispatcher::{ConsumeOptions, RabbitMQDispatcher},
    errors::AmqpError,
    handler::{handler_fn, ConsumerMessage},
    publisher::RabbitMQPublisher,
    topology::queues,
    traces,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    traces::init("info");

    let cfg = RabbitMQConfigs::load()?;
    let manager = ConnectionManager::from_configs(&cfg);
    manager.connect().await?;

    let publisher = RabbitMQPublisher::new(manager.clone());
    let dispatcher = RabbitMQDispatcher::new(manager.clone(), publisher);

    let handler = handler_fn(|msg: ConsumerMessage| async move {
        info!(
            queue = %msg.queue,
            retry_count = msg.retry_count,
            payload = %msg.payload,
            "payment received"
        );
        Ok(())
    });

    let subscription = dispatcher
        .subscribe(
            queues::PAYMENT_PROCESSING,
            handler,
            ConsumeOptions::from_configs(&cfg),
        )
        .await?;

    tokio::select! {
        res = subscription.join() => {
            if let Err(err) = &res {
                error!(error = err.to_string(), "consumer finished with error");
            }
            manager.close().await?;
            res
        }
        res = manager.close_on_signal() => res,
    }
}
