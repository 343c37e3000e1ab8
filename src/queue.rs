// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the types used to declare queues and to report their
//! state back to the caller. Queues are always declared through the client, so
//! the definition carries only the options this client supports; broker-specific
//! behavior is expressed through declaration arguments.

use crate::transport::{FieldMap, FieldValue};

/// Definition of a RabbitMQ queue with its declaration parameters.
///
/// This struct implements the builder pattern. Declarations are idempotent on
/// the broker side as long as the parameters match the existing queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) arguments: FieldMap,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable,
    /// non-exclusive, not auto-deleted, no arguments).
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldMap::new(),
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer unsubscribes.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Adds a single declaration argument (for example `x-message-ttl`).
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: FieldValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Replaces the declaration arguments wholesale.
    ///
    /// # Parameters
    /// * `arguments` - The full argument table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn arguments(mut self, arguments: FieldMap) -> Self {
        self.arguments = arguments;
        self
    }
}

/// State of a queue as reported by the broker on declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// The queue name the broker confirmed.
    pub name: String,
    /// Number of messages ready in the queue.
    pub message_count: u32,
    /// Number of consumers currently subscribed to the queue.
    pub consumer_count: u32,
}
