// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! A reliable consumption engine for RabbitMQ: declares queues, consumes them with
//! bounded concurrency, settles every delivery exactly once and survives connection
//! and channel failures by replaying its declarations and subscriptions.
//!
//! ```no_run
//! use rabbitmq_consumer::{ConsumerConfigs, RabbitMQConsumer};
//! # async fn run(handler: std::sync::Arc<dyn rabbitmq_consumer::ConsumerHandler>) -> Result<(), rabbitmq_consumer::AmqpError> {
//! let consumer = RabbitMQConsumer::with_lapin(ConsumerConfigs::default())?;
//! consumer.start().await?;
//! consumer.subscribe_configured(handler).await?;
//! consumer.consume_blocking().await
//! # }
//! ```

mod otel;

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod queue;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracker;
pub mod transport;

pub use config::{AckMode, ConsumerConfigs, InFlightPolicy, RabbitMQConfigs};
pub use connection::ConnectionState;
pub use consumer::RabbitMQConsumer;
pub use errors::AmqpError;
#[cfg(feature = "mocks")]
pub use handler::MockConsumerHandler;
pub use handler::{ConsumerHandler, ConsumerMessage, DeliveryMetadata, HandlerError};
pub use queue::{QueueDefinition, QueueHandle};
pub use registry::SubscriptionId;
