// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the seam between the task-distribution layer and the
//! broker client. `AmqpChannel` lists the broker operations the topology,
//! publisher and consumer need; `LapinChannel` implements it on top of one
//! lapin connection and one channel. `LapinConnector` establishes that pair
//! and wires the connection-level error handlers that drive reconnection.

use crate::{
    configs::RabbitMQConfigs,
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Outcome of handing an envelope to the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// The envelope was written to the channel
    Accepted,
    /// The broker has flow-blocked the connection; nothing was sent
    Saturated,
}

/// Queue depth as reported by a passive declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles one delivery. Exactly one of `ack`/`nack` must be called.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery pushed by the broker to a subscription.
pub struct InboundDelivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker operations used by the core.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares a queue; a no-op when an identical queue already exists.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Declares an exchange; a no-op when an identical exchange already exists.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Hands an envelope to the broker. An empty `exchange` is the default
    /// exchange, which routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PublishStatus, AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError>;

    /// Removes every ready message of `queue`, returning how many were dropped.
    async fn purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Closes the channel and then its connection.
    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// A freshly established channel plus the signal fired when it is lost.
pub struct BrokerLink {
    pub channel: Arc<dyn AmqpChannel>,
    pub lost: mpsc::UnboundedReceiver<AmqpError>,
}

/// Opens broker links. Called once per (re)connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BrokerLink, AmqpError>;
}

/// lapin-backed implementation of `AmqpChannel`.
pub struct LapinChannel {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

impl LapinChannel {
    pub fn new(connection: Arc<Connection>, channel: Arc<Channel>) -> LapinChannel {
        LapinChannel {
            connection,
            channel,
        }
    }

    fn inbound(delivery: Delivery) -> InboundDelivery {
        InboundDelivery {
            envelope: Envelope {
                payload: delivery.data,
                properties: delivery.properties,
            },
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            acker: Box::new(LapinAcker {
                acker: delivery.acker,
            }),
        }
    }
}

/// Errors meaning the transport went away rather than the broker refusing
/// the operation.
fn is_transport_error(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
    )
}

/// Keeps transport failures distinguishable from broker refusals so callers
/// can tell a reconnect apart from a setup error.
fn classify(err: lapin::Error, refused: impl FnOnce() -> AmqpError) -> AmqpError {
    if is_transport_error(&err) {
        AmqpError::ChannelClosed(err.to_string())
    } else {
        refused()
    }
}

fn publish_error(err: lapin::Error) -> AmqpError {
    classify(err, || AmqpError::PublishingError)
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(classify(err, || AmqpError::DeclareQueueError(def.name.clone())))
            }
            _ => Ok(()),
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(classify(err, || AmqpError::DeclareExchangeError(def.name.clone())))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(err, || {
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                }))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<PublishStatus, AmqpError> {
        if self.connection.status().blocked() {
            return Ok(PublishStatus::Saturated);
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.payload,
                envelope.properties.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(publish_error(err))
            }
            _ => Ok(PublishStatus::Accepted),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(LapinChannel::inbound(delivery)),
                Err(err) => Err(AmqpError::ChannelClosed(err.to_string())),
            })
            .boxed())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, AmqpError> {
        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to inspect queue");
                Err(AmqpError::QueueInspectError(queue.to_owned()))
            }
            Ok(q) => Ok(QueueStats {
                message_count: q.message_count(),
                consumer_count: q.consumer_count(),
            }),
        }
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to purge queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            self.channel.close(200, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::CloseError("channel".to_owned())
            })?;
        }

        if self.connection.status().connected() {
            self.connection.close(200, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::CloseError("connection".to_owned())
            })?;
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// Connects with lapin using the URI and connection name from the configs.
pub struct LapinConnector {
    cfg: RabbitMQConfigs,
}

impl LapinConnector {
    pub fn new(cfg: RabbitMQConfigs) -> LapinConnector {
        LapinConnector { cfg }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<BrokerLink, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;
        let (lost_tx, lost) = mpsc::unbounded_channel();

        let tx = lost_tx.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "rabbitmq connection error");
            let _ = tx.send(AmqpError::ConnectionError);
        });

        channel.on_error(move |err| {
            warn!(error = err.to_string(), "rabbitmq channel closed");
            let _ = lost_tx.send(AmqpError::ChannelClosed(err.to_string()));
        });

        Ok(BrokerLink {
            channel: Arc::new(LapinChannel::new(conn, channel)),
            lost,
        })
    }
}

/// Creates a new AMQP connection and a channel on it.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}
