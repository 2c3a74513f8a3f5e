// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The application-facing side of the consumer: a handler receives each message with
//! its delivery metadata and returns `Ok` or a [`HandlerError`]. What the dispatcher
//! does with a failure depends on the subscription's ack mode.

use async_trait::async_trait;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use opentelemetry::Context;
use std::collections::BTreeMap;
use thiserror::Error;

/// Delivery information handed to handlers alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    /// Set when the broker delivered this message before, e.g. prior to a reconnect.
    pub redelivered: bool,
    pub queue: String,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
}

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub msg_type: String,
    pub data: Vec<u8>,
    pub metadata: DeliveryMetadata,
}

impl ConsumerMessage {
    pub fn queue(&self) -> &str {
        &self.metadata.queue
    }

    /// Payload as text, invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed but may succeed later; manual-ack deliveries are requeued.
    #[error("failure to handle message: {0}")]
    Transient(String),

    /// The message can never be processed; manual-ack deliveries are rejected.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The handler exceeded the configured timeout.
    #[error("handler timed out after {0}ms")]
    Timeout(u64),

    /// The handler panicked; manual-ack deliveries are requeued like a transient failure.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        HandlerError::Transient(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        HandlerError::Rejected(msg.into())
    }
}

/// Processes messages delivered to a subscription.
///
/// Deliveries are at-least-once: after a reconnect the broker may hand out a message
/// again (with `redelivered` set), so handlers must tolerate duplicates.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}
