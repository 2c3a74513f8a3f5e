// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error taxonomy of the consumption engine. The `AmqpError`
//! enum covers transport, channel, declaration and acknowledgment failures. Handler
//! failures live in [`crate::handler::HandlerError`] and never surface here.

use thiserror::Error;

/// Represents errors that can occur while consuming from RabbitMQ.
///
/// Only a few variants are fatal (see [`AmqpError::is_fatal`]); everything else is
/// logged by the engine and the consumer keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing or keeping a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The reconnect policy ran out of attempts or time
    #[error("gave up reconnecting: {0}")]
    ReconnectExhausted(String),

    /// Channel-local failure, recoverable by reopening the channel
    #[error("channel `{0}` failure: {1}")]
    ChannelError(u16, String),

    /// A queue was declared again with conflicting properties
    #[error("queue `{0}` already declared with conflicting properties")]
    QueueConflictError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Ack/nack/reject of an unknown or already settled delivery tag
    #[error("invalid acknowledgment for delivery tag `{0}`")]
    InvalidAckError(u64),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Invalid or inconsistent configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Unsubscribe of an id the registry doesn't know
    #[error("subscription `{0}` not found")]
    SubscriptionNotFound(u64),

    /// The consumer is shutting down or already stopped
    #[error("consumer is shutting down")]
    ShutdownError,
}

impl AmqpError {
    /// Fatal errors terminate the consumer; all others are logged and survived.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::ReconnectExhausted(_) | AmqpError::QueueConflictError(_) | AmqpError::ConfigError(_)
        )
    }

    /// Errors the connector may retry with backoff.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, AmqpError::ConnectionError(_) | AmqpError::ChannelError(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_errors() {
        assert!(AmqpError::ReconnectExhausted("3 attempts".into()).is_fatal());
        assert!(!AmqpError::ConnectionError("connection closed".into()).is_fatal());
        assert!(AmqpError::QueueConflictError("jobs".into()).is_fatal());
        assert!(!AmqpError::InvalidAckError(3).is_fatal());
        assert!(!AmqpError::ChannelError(1, "closed".into()).is_fatal());
    }

    #[test]
    fn transient_errors_are_retried() {
        assert!(AmqpError::ChannelError(2, "reset".into()).is_transient());
        assert!(!AmqpError::QueueConflictError("jobs".into()).is_transient());
        assert!(!AmqpError::ReconnectExhausted("3 attempts".into()).is_transient());
    }
}
