// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Client
//!
//! This module provides the resilient RabbitMQ client. A client owns at most
//! one connection and one channel, creates both lazily on first use and
//! rebuilds them whenever the broker drops them. Cloning a client is the way
//! to hand it to a worker task: clones share the configuration and the
//! shutdown signal but never a connection or channel, so workers cannot
//! corrupt each other's channel state.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::StreamExt;
use opentelemetry::global;
use tokio::{sync::Notify, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    amqp::LapinTransport,
    channel::{connect_with_retry, ManagedChannel, ManagedConnection},
    config::{ConnectionParameters, RetryPolicy},
    consumer::{dispatch, ConsumeOptions, ConsumerHandler},
    errors::AmqpError,
    publisher::{build_publish_properties, SendOptions},
    queue::{QueueDefinition, QueueInfo},
    transport::{FieldMap, PublishProperties, Transport},
};

/// Cooperative stop flag shared by a client and all of its clones.
///
/// Setting the signal never tears anything down. Consume loops observe it
/// between deliveries and during their recovery pause, finish whatever they
/// are doing and return, leaving connections and channels open for any other
/// work the process still wants to run.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownState>,
}

#[derive(Default)]
struct ShutdownState {
    requested: AtomicBool,
    wakeup: Notify,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    /// Requests a stop and wakes any loop sitting in its recovery pause.
    pub fn set(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `delay` unless the signal is set first, in which case the
    /// pause ends as soon as the signal arrives.
    pub(crate) async fn recovery_pause(&self, delay: Duration) {
        let notified = self.inner.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_set() {
            return;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = sleep(delay) => {}
        }
    }
}

/// A lazy, self-healing RabbitMQ client.
///
/// The client never connects in its constructor. The first operation that
/// needs the broker triggers a connection attempt governed by the configured
/// [`RetryPolicy`], and every later operation reuses the cached connection
/// and channel for as long as the broker keeps them open.
///
/// Clones share the [`ConnectionParameters`], the [`RetryPolicy`] and the
/// [`ShutdownSignal`] but start with empty connection and channel slots.
/// Hand one clone to each worker task.
pub struct RabbitMQClient {
    parameters: Arc<ConnectionParameters>,
    retry: RetryPolicy,
    confirm_delivery: bool,
    transport: Arc<dyn Transport>,
    shutdown: ShutdownSignal,
    connection: Option<ManagedConnection>,
    channel: Option<ManagedChannel>,
}

impl Clone for RabbitMQClient {
    fn clone(&self) -> Self {
        RabbitMQClient {
            parameters: self.parameters.clone(),
            retry: self.retry.clone(),
            confirm_delivery: self.confirm_delivery,
            transport: self.transport.clone(),
            shutdown: self.shutdown.clone(),
            connection: None,
            channel: None,
        }
    }
}

impl RabbitMQClient {
    /// Creates a client for the given broker parameters.
    ///
    /// Publisher confirms are enabled by default and the default
    /// [`RetryPolicy`] applies. Nothing is connected yet.
    pub fn new(parameters: ConnectionParameters) -> RabbitMQClient {
        RabbitMQClient {
            parameters: Arc::new(parameters),
            retry: RetryPolicy::default(),
            confirm_delivery: true,
            transport: Arc::new(LapinTransport),
            shutdown: ShutdownSignal::new(),
            connection: None,
            channel: None,
        }
    }

    /// Enables or disables publisher confirms on every channel this client
    /// opens.
    pub fn confirm_delivery(mut self, confirm: bool) -> Self {
        self.confirm_delivery = confirm;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Swaps the transport the client talks through. Used by tests to run
    /// against an in-memory broker.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Returns the live connection, establishing one if the slot is empty or
    /// the cached connection went stale.
    ///
    /// # Returns
    ///
    /// A handle to the shared connection, or the terminal error of the retry
    /// loop when the broker stayed unreachable.
    pub async fn connection(&mut self) -> Result<ManagedConnection, AmqpError> {
        if let Some(connection) = &self.connection {
            if connection.is_open() {
                return Ok(connection.clone());
            }
        }

        let connection = connect_with_retry(
            &self.transport,
            &self.parameters.uri(),
            &self.connection_label(),
            &self.retry,
        )
        .await?;

        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Returns the live channel, opening one if the slot is empty, the
    /// channel went stale or the connection under it did.
    ///
    /// Channel creation is never retried. When it fails on a healthy
    /// connection the broker is refusing channels, and hammering it would
    /// not help.
    pub async fn channel(&mut self) -> Result<ManagedChannel, AmqpError> {
        if let (Some(channel), Some(connection)) = (&self.channel, &self.connection) {
            if channel.is_open() && connection.is_open() {
                return Ok(channel.clone());
            }
        }

        let connection = self.connection().await?;
        let channel = ManagedChannel::open(&connection, self.confirm_delivery).await?;

        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Closes and forgets the cached connection and channel.
    ///
    /// Close failures are logged and swallowed: the slot is cleared either
    /// way and the next operation starts from a fresh connection.
    pub async fn invalidate_connection(&mut self) {
        self.invalidate_channel().await;

        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                debug!("closing amqp connection...");
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "failure to close the connection");
                }
            }
        }
    }

    /// Closes and forgets the cached channel, leaving the connection alone.
    pub async fn invalidate_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if channel.is_open() {
                debug!("closing amqp channel...");
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close the channel");
                }
            }
        }
    }

    /// Declares a durable queue and reports its current state.
    ///
    /// Declaring an existing queue is a cheap no-op on the broker, so this
    /// doubles as the way to inspect queue depth.
    ///
    /// # Parameters
    ///
    /// * `queue` - name of the queue to declare
    /// * `arguments` - optional extra queue arguments, `x-max-priority` and
    ///   friends
    pub async fn declare_queue(
        &mut self,
        queue: &str,
        arguments: Option<FieldMap>,
    ) -> Result<QueueInfo, AmqpError> {
        let definition = match arguments {
            Some(arguments) => QueueDefinition::new(queue).durable().arguments(arguments),
            None => QueueDefinition::new(queue).durable(),
        };

        let channel = self.channel().await?;
        channel.queue_declare(&definition).await
    }

    /// Publishes `message` to `queue`, declaring the queue first.
    ///
    /// Every failed attempt tears the connection down and the next attempt
    /// rebuilds it from scratch, which clears broken channel state the broker
    /// may have left behind. Attempts follow each other immediately; the
    /// reconnect inside each attempt already provides the pacing.
    ///
    /// # Returns
    ///
    /// The message itself on success, so callers can chain on it, or the last
    /// error once `max_send_attempts` is exhausted.
    pub async fn send(
        &mut self,
        queue: &str,
        message: Vec<u8>,
        options: SendOptions,
    ) -> Result<Vec<u8>, AmqpError> {
        let properties = build_publish_properties(&options);
        let max_attempts = self.retry.max_send_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            match self.try_send(queue, &message, &properties).await {
                Ok(_) => return Ok(message),
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt, "failure to publish, recreating the connection"
                    );
                    self.invalidate_connection().await;

                    if attempt >= max_attempts {
                        error!(
                            error = err.to_string(),
                            attempts = max_attempts,
                            "failure to publish, attempts exhausted"
                        );
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn try_send(
        &mut self,
        queue: &str,
        message: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(&QueueDefinition::new(queue).durable())
            .await?;
        channel.basic_publish(queue, message, properties).await
    }

    /// Drops every message currently sitting in `queue`.
    ///
    /// # Returns
    ///
    /// The number of messages the broker discarded. Purging is not retried:
    /// it is an operator action and the caller decides whether to run it
    /// again.
    pub async fn flush_queue(&mut self, queue: &str) -> Result<u32, AmqpError> {
        let channel = self.channel().await?;
        let purged = channel.queue_purge(queue).await?;

        debug!(name = queue, purged, "queue flushed");
        Ok(purged)
    }

    /// Reports how many messages are ready in `queue`.
    pub async fn message_count(&mut self, queue: &str) -> Result<u32, AmqpError> {
        let info = self.declare_queue(queue, None).await?;
        Ok(info.message_count)
    }

    /// Consumes `queue` until [`RabbitMQClient::shutdown`] is called.
    ///
    /// The loop re-registers the consumer whenever the stream ends and
    /// rebuilds the connection whenever it breaks, pausing for
    /// `consume_recovery_delay` between recovery rounds so a flapping broker
    /// is not hammered. Handler failures are logged and never stop the loop;
    /// the handler owns acknowledgement, so a failed message stays
    /// unacknowledged unless the handler nacked it.
    ///
    /// A shutdown requested before this call is forgotten: starting to
    /// consume re-arms the signal.
    ///
    /// # Parameters
    ///
    /// * `queue` - name of the queue to consume from
    /// * `handler` - callback invoked once per delivery
    /// * `options` - prefetch window and consumer tag
    pub async fn start_consuming(
        &mut self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) {
        self.shutdown.clear();
        info!(queue, "starting consumer");

        while !self.shutdown.is_set() {
            match self.consume_once(queue, &handler, &options).await {
                Ok(_) => {
                    debug!(queue, "consume stream ended, resubscribing");
                }
                Err(err) => {
                    if err.is_connection_error() {
                        warn!(
                            error = err.to_string(),
                            queue, "consumer lost the connection, recovering"
                        );
                    } else {
                        error!(error = err.to_string(), queue, "consumer failed, recovering");
                    }

                    self.invalidate_connection().await;

                    if self.shutdown.is_set() {
                        break;
                    }
                    self.shutdown
                        .recovery_pause(self.retry.consume_recovery_delay)
                        .await;
                }
            }
        }

        info!(queue, "consumer stopped");
    }

    async fn consume_once(
        &mut self,
        queue: &str,
        handler: &Arc<dyn ConsumerHandler>,
        options: &ConsumeOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        channel.basic_qos(options.prefetch).await?;

        let consumer_tag = options.effective_tag();
        let mut stream = channel.basic_consume(queue, &consumer_tag).await?;
        debug!(queue, consumer_tag, "consumer registered");

        let tracer = global::tracer("amqp consumer");

        while let Some(item) = stream.next().await {
            match item {
                Ok(delivery) => {
                    if let Err(err) = dispatch(&tracer, queue, handler, delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Asks every consume loop sharing this client's signal to stop.
    ///
    /// Returns immediately and may be called from any clone, any number of
    /// times. Connections and channels stay open; drop the client or call
    /// [`RabbitMQClient::invalidate_connection`] to close them.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.set();
    }

    fn connection_label(&self) -> String {
        self.parameters
            .connection_name
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned())
    }
}
