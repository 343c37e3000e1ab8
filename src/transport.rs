// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! This module defines the narrow interface the client talks to the broker
//! through. Production code plugs in the lapin-backed implementation from the
//! `amqp` module; tests plug in an in-memory fake. The seam deliberately covers
//! only the operations the client performs: connect, open/close, queue
//! declare/purge, publish, qos, and consume.

use crate::{
    errors::AmqpError,
    queue::{QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::{collections::BTreeMap, fmt, pin::Pin, sync::Arc};

/// A single value in an AMQP field table (headers, declaration arguments).
///
/// Only the kinds this client reads or writes are represented; everything else
/// a broker might send in a header table is dropped on receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean field
    Bool(bool),
    /// Signed integer field, widened from any AMQP integer type
    Int(i64),
    /// POSIX timestamp field
    Timestamp(u64),
    /// UTF-8 string field
    String(String),
}

impl FieldValue {
    /// Returns the string content when this value is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// An AMQP field table keyed by field name.
///
/// A `BTreeMap` keeps iteration order deterministic, which keeps URI assembly
/// and header propagation stable across runs.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Properties attached to an outgoing publish.
///
/// `mandatory` is strictly a publish option rather than a message property, but
/// it crosses the seam here so the transport receives everything about a publish
/// in one place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// MIME content type of the payload.
    pub content_type: Option<String>,
    /// Message priority, 0-9.
    pub priority: Option<u8>,
    /// Unique message identifier.
    pub message_id: Option<String>,
    /// Application headers, including injected trace context.
    pub headers: FieldMap,
    /// Whether the broker must route the message to at least one queue.
    pub mandatory: bool,
}

/// Acknowledgement handle for a single delivery.
///
/// Consuming `Box<Self>` makes double-acking a compile error rather than a
/// broker channel error.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Acknowledges the delivery.
    async fn ack(self: Box<Self>) -> Result<(), AmqpError>;

    /// Rejects the delivery, optionally requeueing it.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer, together with its acknowledgement handle.
///
/// The client registers consumers in manual-acknowledgement mode, so the
/// handler owns the ack decision: call [`Delivery::ack`] or [`Delivery::nack`]
/// exactly once.
pub struct Delivery {
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Exchange the message arrived through (empty for the default exchange).
    pub exchange: String,
    /// Broker-assigned delivery tag, channel-scoped.
    pub delivery_tag: u64,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Application headers attached to the message.
    pub headers: FieldMap,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    /// Assembles a delivery around its acknowledgement handle.
    pub fn new(
        payload: Vec<u8>,
        routing_key: String,
        exchange: String,
        delivery_tag: u64,
        redelivered: bool,
        headers: FieldMap,
        acker: Box<dyn DeliveryAcker>,
    ) -> Delivery {
        Delivery {
            payload,
            routing_key,
            exchange,
            delivery_tag,
            redelivered,
            headers,
            acker,
        }
    }

    /// Acknowledges this delivery, consuming it.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects this delivery, consuming it.
    ///
    /// # Parameters
    /// * `requeue` - Whether the broker should redeliver the message later
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries produced by a registered consumer.
///
/// A connection-class error item means the channel or connection died under the
/// consumer; the client reacts by rebuilding both and re-subscribing.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Factory for broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes a connection to the broker at the given AMQP URI.
    ///
    /// # Parameters
    /// * `uri` - Full AMQP URI including credentials, vhost and options
    /// * `connection_name` - Name reported to the broker for this connection
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

/// An established broker connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Opens a new channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open channel carrying the actual AMQP operations.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Whether the channel is currently usable.
    fn is_open(&self) -> bool;

    /// Closes the channel.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Puts the channel into publisher-confirms mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Declares a queue and reports its state.
    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    /// Removes all ready messages from a queue.
    ///
    /// # Returns
    /// The number of messages purged
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Publishes a payload to a queue through the default exchange.
    ///
    /// When the channel is in confirms mode, this resolves only after the
    /// broker acknowledges the publish.
    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries in flight.
    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Registers a manual-acknowledgement consumer on a queue.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;
}
