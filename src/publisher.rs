// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Options
//!
//! This module provides the options a caller attaches to an outgoing message and
//! the assembly of the final publish properties: content type, priority,
//! generated message id, application headers, and the injected OpenTelemetry
//! trace context.

use crate::{
    otel::RabbitMQTracePropagator,
    transport::{FieldMap, FieldValue, PublishProperties},
};
use opentelemetry::{global, Context};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Options for a single publish.
///
/// This struct implements the builder pattern. Messages default to the JSON
/// content type, no priority, no extra headers, and non-mandatory routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub(crate) content_type: Option<String>,
    pub(crate) priority: Option<u8>,
    pub(crate) headers: FieldMap,
    pub(crate) mandatory: bool,
}

impl SendOptions {
    /// Creates publish options with default settings.
    ///
    /// # Returns
    /// Options publishing JSON, without priority or extra headers
    pub fn new() -> SendOptions {
        SendOptions::default()
    }

    /// Sets the MIME content type of the payload.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the message priority (0-9).
    ///
    /// # Returns
    /// Self for method chaining
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attaches an application header to the message.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: FieldValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Requires the broker to route the message to at least one queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// Assembles the wire properties for one outgoing message.
///
/// The current OpenTelemetry context is injected into the headers first, so an
/// explicit application header with the same name wins over the propagated one.
/// Every message gets a fresh v4 uuid as its message id; retries of the same
/// publish reuse the properties built here.
pub(crate) fn build_publish_properties(options: &SendOptions) -> PublishProperties {
    let mut headers = FieldMap::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut RabbitMQTracePropagator::new(&mut headers),
        )
    });

    for (key, value) in &options.headers {
        headers.insert(key.clone(), value.clone());
    }

    PublishProperties {
        content_type: Some(
            options
                .content_type
                .clone()
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
        ),
        priority: options.priority,
        message_id: Some(Uuid::new_v4().to_string()),
        headers,
        mandatory: options.mandatory,
    }
}
