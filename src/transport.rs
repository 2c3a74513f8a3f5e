// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! Frame-level primitives the consumption engine needs from a broker client. The
//! production implementation lives in [`crate::amqp`] and sits on top of `lapin`;
//! tests use the in-memory broker from [`crate::testing`].
//!
//! Inbound traffic (deliveries, broker-initiated closes) is pushed into a single
//! frame queue per connection, which the engine drains from one reader task.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

/// Parameters used for every connect attempt. Reconnects reuse them unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub uri: String,
    /// `host:port`, used in logs instead of the uri.
    pub endpoint: String,
    pub connection_name: String,
}

/// One message pushed by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDelivery {
    pub channel_id: u16,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// The `type` property, if the publisher set one.
    pub kind: Option<String>,
    /// String-valued headers; used for trace context propagation.
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

/// Inbound traffic of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Deliver(RawDelivery),
    ChannelClosed { channel_id: u16, reason: String },
    ConsumerCancelled { channel_id: u16, consumer_tag: String },
    ConnectionClosed { reason: String },
}

/// A freshly established connection and its inbound frame queue.
pub struct BrokerLink {
    pub connection: Arc<dyn BrokerConnection>,
    pub frames: UnboundedReceiver<InboundFrame>,
}

/// Establishes connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<BrokerLink, AmqpError>;
}

/// Outbound primitives of one live connection, addressed by channel id.
///
/// Implementations are only ever called from the connection's writer task, so they
/// don't need to order concurrent calls themselves.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self, channel_id: u16) -> Result<(), AmqpError>;

    async fn close_channel(&self, channel_id: u16) -> Result<(), AmqpError>;

    async fn declare_queue(&self, channel_id: u16, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn qos(&self, channel_id: u16, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        channel_id: u16,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError>;

    async fn cancel(&self, channel_id: u16, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, channel_id: u16, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(
        &self,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    async fn reject(&self, channel_id: u16, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
