// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit moved through the broker: a UTF-8 JSON body plus AMQP properties.
//! Every envelope is persistent and typed `application/json`. The retry state
//! of a work item lives only in the `retry-count` header of its envelope.

use crate::errors::AmqpError;
use chrono::Utc;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortString,
    },
    BasicProperties,
};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the number of failed attempts of the work item
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// AMQP delivery mode for persistent messages
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Caller-supplied header values.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> AMQPValue {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// Options merged over the publish defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: BTreeMap<String, HeaderValues>,
    pub msg_type: Option<String>,
    pub message_id: Option<String>,
}

impl PublishOptions {
    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }
}

/// A message as handed to, or received from, the broker.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl Envelope {
    /// Serializes `payload` and builds persistent JSON properties.
    ///
    /// Caller headers are merged over `extra_headers` (trace context), and the
    /// timestamp is taken now.
    pub fn json<T>(
        payload: &T,
        options: &PublishOptions,
        extra_headers: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<Envelope, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        let mut headers = extra_headers;
        for (key, value) in options.headers.clone() {
            headers.insert(ShortString::from(key), value.into());
        }

        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(headers));

        if let Some(kind) = &options.msg_type {
            properties = properties.with_type(ShortString::from(kind.clone()));
        }

        Ok(Envelope {
            payload: body,
            properties,
        })
    }

    /// Builds the next hop of a failed work item: same body, same headers
    /// apart from `retry-count`, fresh timestamp.
    pub fn retry_of(original: &Envelope, retry_count: u32) -> Envelope {
        let mut headers = original.headers().inner().clone();
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongLongInt(LongLongInt::from(retry_count)),
        );

        let properties = original
            .properties
            .clone()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_headers(FieldTable::from(headers));

        Envelope {
            payload: original.payload.clone(),
            properties,
        }
    }

    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|c| c.as_str())
    }

    pub fn timestamp(&self) -> Option<u64> {
        *self.properties.timestamp()
    }

    pub fn msg_type(&self) -> String {
        match self.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        *self.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE)
    }

    /// Failed attempts so far; an absent or non-integer header counts as 0.
    pub fn retry_count(&self) -> u32 {
        let headers = self.headers();
        let count = match headers.inner().get(RETRY_COUNT_HEADER) {
            Some(value) => integer_value(value).unwrap_or_default(),
            _ => 0,
        };

        u32::try_from(count).unwrap_or_default()
    }
}

fn integer_value(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
