// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer-side surface of the client: the handler
//! trait applications implement, the options for a consume subscription, and
//! the per-delivery dispatch that wraps every handled message in an
//! OpenTelemetry consumer span.
//!
//! Consumers run in manual-acknowledgement mode: the handler owns the delivery
//! and decides whether to ack or nack it.

use crate::{errors::AmqpError, otel, transport::Delivery};
use async_trait::async_trait;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tracing::debug;
use uuid::Uuid;

/// Application-side message handler.
///
/// The handler receives the delivery by value together with the trace context
/// extracted from the message headers. Acknowledgement is the handler's
/// responsibility; a delivery dropped without ack or nack stays unacknowledged
/// until the channel dies.
///
/// Handler errors are logged by the consume loop and never stop consumption.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context extracted from the message headers
    /// * `delivery` - The received message, owning its acknowledgement handle
    async fn handle(&self, ctx: &Context, delivery: Delivery) -> Result<(), AmqpError>;
}


/// Options for a consume subscription.
///
/// This struct implements the builder pattern. Subscriptions default to a
/// prefetch of one in-flight delivery and a generated consumer tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub(crate) prefetch: u16,
    pub(crate) consumer_tag: Option<String>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        ConsumeOptions {
            prefetch: 1,
            consumer_tag: None,
        }
    }
}

impl ConsumeOptions {
    /// Creates consume options with default settings.
    ///
    /// # Returns
    /// Options with a prefetch of 1 and a generated consumer tag
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Sets the number of unacknowledged deliveries the broker may have in
    /// flight for this consumer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets the consumer tag reported to the broker.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// The consumer tag to register with, generating one when none was set.
    pub(crate) fn effective_tag(&self) -> String {
        match &self.consumer_tag {
            Some(tag) => tag.clone(),
            None => format!("ctag-{}", Uuid::new_v4()),
        }
    }
}

/// Hands one delivery to the handler inside a consumer span.
///
/// The span status mirrors the handler result; a handler error is returned to
/// the caller for logging but carries no acknowledgement side effects of its
/// own.
pub(crate) async fn dispatch(
    tracer: &BoxedTracer,
    queue: &str,
    handler: &Arc<dyn ConsumerHandler>,
    delivery: Delivery,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, queue);

    debug!(
        queue,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "message received"
    );

    match handler.handle(&ctx, delivery).await {
        Ok(_) => {
            span.set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            Err(err)
        }
    }
}
