// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! This module provides the error type shared by every operation of the client.
//! The `AmqpError` enum covers connection establishment, channel creation, queue
//! declaration, publishing, and consumer failures, and distinguishes the
//! connection-class errors that the retry machinery recovers from.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-class errors (`ConnectionError`) are transient by convention and
/// are retried by the reconnect/backoff machinery; every other variant is
/// surfaced to the caller according to the failing operation's retry policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error purging a queue with the given name
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer or reading from its delivery stream
    #[error("failure to consume: {0}")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),
}

impl AmqpError {
    /// Whether this error means the underlying connection is gone (or never came
    /// up), as opposed to an operation being rejected on a healthy connection.
    ///
    /// The reconnect loop retries only connection-class errors; everything else
    /// propagates to the caller immediately.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, AmqpError::ConnectionError(_))
    }
}
