// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation and recovery of AMQP connections and
//! channels. Connections are established with exponential backoff: the delay
//! between attempts starts at the configured initial value and doubles after
//! every failure up to a cap, with an optional bound on the number of attempts.
//! Channels are always opened from a live connection and can carry publisher
//! confirms.

use crate::{
    config::RetryPolicy,
    errors::AmqpError,
    queue::{QueueDefinition, QueueInfo},
    transport::{DeliveryStream, PublishProperties, Transport, TransportChannel, TransportConnection},
};
use std::{fmt, sync::Arc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A broker connection owned by one worker.
///
/// Cloning is cheap and shares the underlying transport handle; the client
/// hands out clones so callers can inspect or close the connection without
/// borrowing the worker state.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<dyn TransportConnection>,
}

impl ManagedConnection {
    pub(crate) fn new(inner: Arc<dyn TransportConnection>) -> ManagedConnection {
        ManagedConnection { inner }
    }

    /// Whether the connection currently reports itself usable.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Closes the connection and every channel multiplexed over it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }

    pub(crate) async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        self.inner.create_channel().await
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// A channel opened from a [`ManagedConnection`].
///
/// The channel remembers whether publisher confirms were enabled on it, so the
/// client can tell a rebuilt channel keeps the configured delivery guarantees.
#[derive(Clone)]
pub struct ManagedChannel {
    inner: Arc<dyn TransportChannel>,
    confirm_delivery: bool,
}

impl ManagedChannel {
    /// Opens a new channel on the given connection, enabling publisher
    /// confirms when requested.
    pub(crate) async fn open(
        connection: &ManagedConnection,
        confirm_delivery: bool,
    ) -> Result<ManagedChannel, AmqpError> {
        debug!("creating amqp channel...");
        let inner = connection.create_channel().await?;

        if confirm_delivery {
            inner.confirm_select().await?;
        }

        debug!("channel created");
        Ok(ManagedChannel {
            inner,
            confirm_delivery,
        })
    }

    /// Whether the channel currently reports itself usable.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether publisher confirms are enabled on this channel.
    pub fn confirm_delivery(&self) -> bool {
        self.confirm_delivery
    }

    /// Closes the channel, leaving its parent connection untouched.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close().await
    }

    pub(crate) async fn queue_declare(
        &self,
        definition: &QueueDefinition,
    ) -> Result<QueueInfo, AmqpError> {
        self.inner.queue_declare(definition).await
    }

    pub(crate) async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.inner.queue_purge(queue).await
    }

    pub(crate) async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.inner.basic_publish(queue, payload, properties).await
    }

    pub(crate) async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.inner.basic_qos(prefetch).await
    }

    pub(crate) async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.inner.basic_consume(queue, consumer_tag).await
    }
}

impl fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("open", &self.is_open())
            .field("confirm_delivery", &self.confirm_delivery)
            .finish_non_exhaustive()
    }
}

/// Establishes a connection, retrying connection-class failures with
/// exponential backoff.
///
/// The attempt counter starts at 1 and the delay at
/// `policy.initial_connection_delay`. After every failed attempt the loop logs
/// a warning, sleeps for the current delay, then doubles it up to
/// `policy.max_connection_delay`. With a bounded
/// `policy.max_connection_attempts` the last error is surfaced once the budget
/// is spent; without one the loop runs until the broker comes back. Errors that
/// are not connection-class propagate immediately.
pub(crate) async fn connect_with_retry(
    transport: &Arc<dyn Transport>,
    uri: &str,
    connection_name: &str,
    policy: &RetryPolicy,
) -> Result<ManagedConnection, AmqpError> {
    let mut attempt: u64 = 1;
    let mut delay = policy.initial_connection_delay;
    let mut last_error = None;

    while policy
        .max_connection_attempts
        .map_or(true, |max| attempt <= max)
    {
        debug!(attempt, "creating amqp connection...");

        match transport.connect(uri, connection_name).await {
            Ok(connection) => {
                if attempt > 1 {
                    info!(attempt, "amqp connection re-established");
                }
                debug!("amqp connected");
                return Ok(ManagedConnection::new(connection));
            }
            Err(err) if err.is_connection_error() => {
                warn!(
                    error = err.to_string(),
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "failure to connect, backing off"
                );

                last_error = Some(err);
                attempt += 1;
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_connection_delay);
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(err);
            }
        }
    }

    let detail = match last_error {
        Some(err) => format!("attempts exhausted after {} tries: {}", attempt - 1, err),
        None => "no connection attempts permitted".to_owned(),
    };
    error!(error = detail.as_str(), "failure to connect");
    Err(AmqpError::ConnectionError(detail))
}
