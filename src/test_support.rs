// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Transport Fake
//!
//! This module provides a scriptable transport used by the unit tests. It keeps
//! broker-side queue contents for declare/publish/purge, records every call the
//! client makes, and lets tests script failures: refused connections, failing
//! publishes, broken consume streams, and close errors. Consume streams are
//! fully script-driven and independent of the queue store.

use crate::{
    errors::AmqpError,
    queue::{QueueDefinition, QueueInfo},
    transport::{
        Delivery, DeliveryAcker, DeliveryStream, FieldMap, PublishProperties, Transport,
        TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;

/// One scripted reaction to a `basic_consume` call.
///
/// Scripts are consumed in order; once the queue of scripts is empty every
/// further consumer gets a stream that never yields.
pub(crate) enum ConsumeScript {
    /// Yield these payloads, then end the stream.
    Deliver(Vec<Vec<u8>>),
    /// Yield these payloads, then yield the error, then end the stream.
    FailMidStream {
        deliver: Vec<Vec<u8>>,
        error: AmqpError,
    },
    /// Fail the `basic_consume` call itself.
    FailRegistration(AmqpError),
    /// Return a stream that never yields anything.
    Pending,
}

struct FakeState {
    started: Instant,
    ids: AtomicUsize,

    refuse_connections: AtomicBool,
    connect_failures: AtomicUsize,
    next_connect_error: Mutex<Option<AmqpError>>,
    connect_calls: AtomicUsize,
    connect_offsets: Mutex<Vec<Duration>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    closed_connections: AtomicUsize,
    fail_connection_closes: AtomicBool,

    next_create_channel_error: Mutex<Option<AmqpError>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    closed_channels: AtomicUsize,
    fail_channel_closes: AtomicBool,
    confirm_selects: AtomicUsize,

    queues: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    declared: Mutex<Vec<QueueDefinition>>,
    purge_calls: AtomicUsize,
    next_purge_error: Mutex<Option<AmqpError>>,

    publish_failures: AtomicUsize,
    publish_attempts: AtomicUsize,

    consume_calls: AtomicUsize,
    consumer_tags: Mutex<Vec<String>>,
    consume_scripts: Mutex<VecDeque<ConsumeScript>>,
    qos_values: Mutex<Vec<u16>>,

    acked: AtomicUsize,
    nacked: AtomicUsize,
}

/// Scriptable in-memory transport.
///
/// Clones share all state, so a test keeps one handle for scripting and
/// assertions while the client drives a clone through the seam.
#[derive(Clone)]
pub(crate) struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub(crate) fn new() -> FakeTransport {
        FakeTransport {
            state: Arc::new(FakeState {
                started: Instant::now(),
                ids: AtomicUsize::new(1),
                refuse_connections: AtomicBool::new(false),
                connect_failures: AtomicUsize::new(0),
                next_connect_error: Mutex::new(None),
                connect_calls: AtomicUsize::new(0),
                connect_offsets: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                closed_connections: AtomicUsize::new(0),
                fail_connection_closes: AtomicBool::new(false),
                next_create_channel_error: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                closed_channels: AtomicUsize::new(0),
                fail_channel_closes: AtomicBool::new(false),
                confirm_selects: AtomicUsize::new(0),
                queues: Mutex::new(BTreeMap::new()),
                declared: Mutex::new(Vec::new()),
                purge_calls: AtomicUsize::new(0),
                next_purge_error: Mutex::new(None),
                publish_failures: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
                consume_calls: AtomicUsize::new(0),
                consumer_tags: Mutex::new(Vec::new()),
                consume_scripts: Mutex::new(VecDeque::new()),
                qos_values: Mutex::new(Vec::new()),
                acked: AtomicUsize::new(0),
                nacked: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn as_transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    // -- connection scripting ------------------------------------------------

    /// Makes every connection attempt fail with a connection error.
    pub(crate) fn refuse_connections(&self) {
        self.state.refuse_connections.store(true, Ordering::SeqCst);
    }

    /// Makes the first `count` connection attempts fail with a connection
    /// error; later attempts succeed.
    pub(crate) fn fail_connections(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next connection attempt fail with the given error.
    pub(crate) fn fail_next_connect_with(&self, error: AmqpError) {
        *self.state.next_connect_error.lock().unwrap() = Some(error);
    }

    /// Makes the next `create_channel` call fail with the given error.
    pub(crate) fn fail_next_create_channel_with(&self, error: AmqpError) {
        *self.state.next_create_channel_error.lock().unwrap() = Some(error);
    }

    /// Makes connection closes report an error after marking the connection
    /// closed.
    pub(crate) fn fail_connection_closes(&self) {
        self.state
            .fail_connection_closes
            .store(true, Ordering::SeqCst);
    }

    /// Makes channel closes report an error after marking the channel closed.
    pub(crate) fn fail_channel_closes(&self) {
        self.state.fail_channel_closes.store(true, Ordering::SeqCst);
    }

    /// Marks every open channel closed, as if the broker tore them down,
    /// leaving connections open.
    pub(crate) fn close_channels_out_of_band(&self) {
        for channel in self.state.channels.lock().unwrap().iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
    }

    /// Marks every open connection and channel closed, as if the broker went
    /// away.
    pub(crate) fn close_connections_out_of_band(&self) {
        for connection in self.state.connections.lock().unwrap().iter() {
            connection.open.store(false, Ordering::SeqCst);
        }
        self.close_channels_out_of_band();
    }

    // -- publish and purge scripting -----------------------------------------

    /// Makes the first `count` publishes fail; later publishes succeed.
    pub(crate) fn fail_publishes(&self, count: usize) {
        self.state.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next purge fail with the given error.
    pub(crate) fn fail_next_purge_with(&self, error: AmqpError) {
        *self.state.next_purge_error.lock().unwrap() = Some(error);
    }

    /// Queues a reaction for the next `basic_consume` call.
    pub(crate) fn push_consume_script(&self, script: ConsumeScript) {
        self.state.consume_scripts.lock().unwrap().push_back(script);
    }

    // -- observations --------------------------------------------------------

    pub(crate) fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Time offsets of every connection attempt, measured from the creation of
    /// the fake.
    pub(crate) fn connect_offsets(&self) -> Vec<Duration> {
        self.state.connect_offsets.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.state.connections.lock().unwrap().clone()
    }

    pub(crate) fn closed_connections(&self) -> usize {
        self.state.closed_connections.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_channels(&self) -> usize {
        self.state.closed_channels.load(Ordering::SeqCst)
    }

    pub(crate) fn confirm_selects(&self) -> usize {
        self.state.confirm_selects.load(Ordering::SeqCst)
    }

    pub(crate) fn queue_declares(&self) -> Vec<QueueDefinition> {
        self.state.declared.lock().unwrap().clone()
    }

    pub(crate) fn purge_calls(&self) -> usize {
        self.state.purge_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_attempts(&self) -> usize {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    /// Payloads currently sitting in the named queue.
    pub(crate) fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn consume_calls(&self) -> usize {
        self.state.consume_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn consumer_tags(&self) -> Vec<String> {
        self.state.consumer_tags.lock().unwrap().clone()
    }

    pub(crate) fn qos_values(&self) -> Vec<u16> {
        self.state.qos_values.lock().unwrap().clone()
    }

    pub(crate) fn acked(&self) -> usize {
        self.state.acked.load(Ordering::SeqCst)
    }

    pub(crate) fn nacked(&self) -> usize {
        self.state.nacked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        let call = self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .connect_offsets
            .lock()
            .unwrap()
            .push(self.state.started.elapsed());

        if let Some(error) = self.state.next_connect_error.lock().unwrap().take() {
            return Err(error);
        }

        if self.state.refuse_connections.load(Ordering::SeqCst)
            || call < self.state.connect_failures.load(Ordering::SeqCst)
        {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            id: self.state.ids.fetch_add(1, Ordering::SeqCst),
            open: AtomicBool::new(true),
            state: self.state.clone(),
        });
        self.state
            .connections
            .lock()
            .unwrap()
            .push(connection.clone());

        Ok(connection)
    }
}

/// A fake connection handle, exposed to tests for identity checks.
pub(crate) struct FakeConnection {
    id: usize,
    open: AtomicBool,
    state: Arc<FakeState>,
}

impl FakeConnection {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if let Some(error) = self.state.next_create_channel_error.lock().unwrap().take() {
            return Err(error);
        }

        if !self.is_open() {
            return Err(AmqpError::ConnectionError(
                "connection is closed".to_owned(),
            ));
        }

        let channel = Arc::new(FakeChannel {
            connection_id: self.id,
            open: AtomicBool::new(true),
            state: self.state.clone(),
        });
        self.state.channels.lock().unwrap().push(channel.clone());

        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.state
            .closed_connections
            .fetch_add(1, Ordering::SeqCst);

        for channel in self.state.channels.lock().unwrap().iter() {
            if channel.connection_id == self.id {
                channel.open.store(false, Ordering::SeqCst);
            }
        }

        if self.state.fail_connection_closes.load(Ordering::SeqCst) {
            return Err(AmqpError::InternalError("close failed".to_owned()));
        }
        Ok(())
    }
}

struct FakeChannel {
    connection_id: usize,
    open: AtomicBool,
    state: Arc<FakeState>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel is closed".to_owned()))
        }
    }

    fn make_delivery(&self, queue: &str, payload: Vec<u8>) -> Delivery {
        Delivery::new(
            payload,
            queue.to_owned(),
            String::new(),
            self.state.ids.fetch_add(1, Ordering::SeqCst) as u64,
            false,
            FieldMap::new(),
            Box::new(FakeAcker {
                state: self.state.clone(),
            }),
        )
    }
}

#[async_trait]
impl TransportChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.state.closed_channels.fetch_add(1, Ordering::SeqCst);

        if self.state.fail_channel_closes.load(Ordering::SeqCst) {
            return Err(AmqpError::InternalError("close failed".to_owned()));
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.confirm_selects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn queue_declare(&self, definition: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        self.ensure_open()?;
        self.state.declared.lock().unwrap().push(definition.clone());

        let mut queues = self.state.queues.lock().unwrap();
        let messages = queues.entry(definition.name.clone()).or_default();

        Ok(QueueInfo {
            name: definition.name.clone(),
            message_count: messages.len() as u32,
            consumer_count: 0,
        })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.ensure_open()?;
        self.state.purge_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.state.next_purge_error.lock().unwrap().take() {
            return Err(error);
        }

        let mut queues = self.state.queues.lock().unwrap();
        let purged = match queues.get_mut(queue) {
            Some(messages) => {
                let count = messages.len();
                messages.clear();
                count
            }
            None => 0,
        };

        Ok(purged as u32)
    }

    async fn basic_publish(
        &self,
        queue: &str,
        payload: &[u8],
        _properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let attempt = self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if attempt < self.state.publish_failures.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError(
                "broker refused the publish".to_owned(),
            ));
        }

        self.state
            .queues
            .lock()
            .unwrap()
            .entry(queue.to_owned())
            .or_default()
            .push(payload.to_vec());

        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.qos_values.lock().unwrap().push(prefetch);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        self.state.consume_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .consumer_tags
            .lock()
            .unwrap()
            .push(consumer_tag.to_owned());

        let script = self
            .state
            .consume_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConsumeScript::Pending);

        match script {
            ConsumeScript::FailRegistration(error) => Err(error),
            ConsumeScript::Pending => Ok(Box::pin(stream::pending())),
            ConsumeScript::Deliver(payloads) => {
                let items: Vec<Result<Delivery, AmqpError>> = payloads
                    .into_iter()
                    .map(|payload| Ok(self.make_delivery(queue, payload)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            ConsumeScript::FailMidStream { deliver, error } => {
                let mut items: Vec<Result<Delivery, AmqpError>> = deliver
                    .into_iter()
                    .map(|payload| Ok(self.make_delivery(queue, payload)))
                    .collect();
                items.push(Err(error));
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

/// Builds a standalone delivery whose acknowledgements go nowhere, for tests
/// that only need a payload to hand around.
pub(crate) fn delivery_with_payload(payload: &[u8]) -> Delivery {
    Delivery::new(
        payload.to_vec(),
        "tests".to_owned(),
        String::new(),
        1,
        false,
        FieldMap::new(),
        Box::new(NoopAcker),
    )
}

struct NoopAcker;

#[async_trait]
impl DeliveryAcker for NoopAcker {
    async fn ack(self: Box<Self>) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(self: Box<Self>, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

struct FakeAcker {
    state: Arc<FakeState>,
}

#[async_trait]
impl DeliveryAcker for FakeAcker {
    async fn ack(self: Box<Self>) -> Result<(), AmqpError> {
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(self: Box<Self>, _requeue: bool) -> Result<(), AmqpError> {
        self.state.nacked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
