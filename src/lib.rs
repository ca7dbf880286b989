// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ task distribution for the payment backend: topology, connection
//! lifecycle, publishing and the two-tier retry consumer.

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod dlq;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod traces;

#[cfg(test)]
mod testing;
