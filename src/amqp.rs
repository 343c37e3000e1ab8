// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin-Backed Transport
//!
//! This module implements the transport seam over the `lapin` AMQP client.
//! It maps between the crate's field values and lapin's AMQP types, classifies
//! lapin errors into connection-class and operation errors, and resolves
//! publisher confirms when the channel runs in confirms mode.

use crate::{
    errors::AmqpError,
    queue::{QueueDefinition, QueueInfo},
    transport::{
        Delivery, DeliveryAcker, DeliveryStream, FieldMap, FieldValue, PublishProperties,
        Transport, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueuePurgeOptions,
    },
    protocol::constants::REPLY_SUCCESS,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::error;

/// Production transport over `lapin`.
///
/// The client constructs one of these by default; tests substitute their own
/// transport through the seam.
#[derive(Debug, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name));

        match Connection::connect(uri, options).await {
            Ok(connection) => Ok(Arc::new(LapinConnection { inner: connection })),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        match self.inner.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel { inner: channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "connection invalidated")
            .await
            .map_err(|err| classify(err, AmqpError::InternalError))
    }
}

struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "channel invalidated")
            .await
            .map_err(|err| classify(err, AmqpError::InternalError))
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        match self
            .inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                Err(classify(err, AmqpError::ChannelError))
            }
        }
    }

    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        match self
            .inner
            .queue_declare(
                &definition.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: definition.durable,
                    exclusive: definition.exclusive,
                    auto_delete: definition.auto_delete,
                    nowait: false,
                },
                field_table(&definition.arguments),
            )
            .await
        {
            Ok(queue) => Ok(QueueInfo {
                name: queue.name().as_str().to_owned(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = definition.name,
                    "failure to declare a queue"
                );
                Err(classify(err, |_| {
                    AmqpError::DeclareQueueError(definition.name.clone())
                }))
            }
        }
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .inner
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
        {
            Ok(count) => Ok(count),
            Err(err) => {
                error!(error = err.to_string(), name = queue, "failure to purge queue");
                Err(classify(err, |_| AmqpError::PurgeQueueError(queue.to_owned())))
            }
        }
    }

    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let confirm = match self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    immediate: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(classify(err, AmqpError::PublishingError));
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!("broker nacked the publish");
                Err(AmqpError::PublishingError("broker nacked the publish".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                Err(classify(err, AmqpError::PublishingError))
            }
        }
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(classify(err, AmqpError::QoSDeclarationError))
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .inner
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
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(classify(err, AmqpError::ConsumerError));
            }
        };

        let stream = consumer.map(|item| match item {
            Ok(delivery) => Ok(convert_delivery(delivery)),
            Err(err) => Err(classify(err, AmqpError::ConsumerError)),
        });

        Ok(Box::pin(stream))
    }
}

struct LapinAcker {
    inner: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(self: Box<Self>) -> Result<(), AmqpError> {
        self.inner
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to ack message");
                AmqpError::AckMessageError(err.to_string())
            })
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to nack message");
                AmqpError::NackMessageError(err.to_string())
            })
    }
}

/// Maps a lapin error to the crate error space.
///
/// Errors that mean the connection itself is unusable become
/// `ConnectionError` so the retry machinery picks them up; everything else is
/// wrapped by the caller-supplied constructor.
fn classify(err: lapin::Error, fallback: impl FnOnce(String) -> AmqpError) -> AmqpError {
    let detail = err.to_string();
    if matches!(
        err,
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_)
    ) {
        AmqpError::ConnectionError(detail)
    } else {
        fallback(detail)
    }
}

fn field_table(map: &FieldMap) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::new();

    for (key, value) in map {
        let amqp_value = match value {
            FieldValue::Bool(value) => AMQPValue::Boolean(*value),
            FieldValue::Int(value) => AMQPValue::LongLongInt(*value),
            FieldValue::Timestamp(value) => AMQPValue::Timestamp(*value),
            FieldValue::String(value) => AMQPValue::LongString(LongString::from(value.as_str())),
        };

        table.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(table)
}

/// Narrows a lapin field table to the value kinds this crate models; anything
/// else is dropped.
fn field_map(table: &FieldTable) -> FieldMap {
    let mut map = FieldMap::new();

    for (key, value) in table.inner() {
        let field_value = match value {
            AMQPValue::Boolean(value) => Some(FieldValue::Bool(*value)),
            AMQPValue::ShortShortInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::ShortShortUInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::ShortInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::ShortUInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::LongInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::LongUInt(value) => Some(FieldValue::Int(i64::from(*value))),
            AMQPValue::LongLongInt(value) => Some(FieldValue::Int(*value)),
            AMQPValue::Timestamp(value) => Some(FieldValue::Timestamp(*value)),
            AMQPValue::ShortString(value) => Some(FieldValue::String(value.as_str().to_owned())),
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .ok()
                .map(|value| FieldValue::String(value.to_owned())),
            _ => None,
        };

        if let Some(field_value) = field_value {
            map.insert(key.as_str().to_owned(), field_value);
        }
    }

    map
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(field_table(&properties.headers));

    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }

    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }

    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.as_str()));
    }

    basic
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(field_map)
        .unwrap_or_default();

    let acker = delivery.acker;

    Delivery::new(
        delivery.data,
        delivery.routing_key.to_string(),
        delivery.exchange.to_string(),
        delivery.delivery_tag,
        delivery.redelivered,
        headers,
        Box::new(LapinAcker { inner: acker }),
    )
}
