// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod test_support;

pub mod amqp;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod queue;
pub mod transport;
