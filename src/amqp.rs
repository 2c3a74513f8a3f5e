// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP 0-9-1 Transport over lapin
//!
//! Production implementation of the broker seam. Channel ids used by the engine are
//! mapped to `lapin` channels; every `basic_consume` stream is forwarded into the
//! connection's frame queue by its own task, and connection errors reported by
//! `lapin` become a `ConnectionClosed` frame.

use crate::{
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{BrokerConnection, BrokerLink, ConnectionParams, Connector, InboundFrame, RawDelivery},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

/// Header used to set a message Time-To-Live on a queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header used to bound the number of messages in a queue
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Connects to RabbitMQ with `lapin`.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        LapinConnector
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<BrokerLink, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        let conn = lapin::Connection::connect(&params.uri, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), endpoint = params.endpoint, "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;

        let (tx, frames) = mpsc::unbounded_channel();
        let on_error = tx.clone();
        conn.on_error(move |err| {
            let _ = on_error.send(InboundFrame::ConnectionClosed {
                reason: err.to_string(),
            });
        });

        Ok(BrokerLink {
            connection: Arc::new(LapinConnection {
                conn,
                frames: tx,
                channels: Mutex::new(HashMap::new()),
                cancelled: Arc::new(Mutex::new(HashSet::new())),
            }),
            frames,
        })
    }
}

/// One `lapin` connection and the channels opened on it.
pub struct LapinConnection {
    conn: lapin::Connection,
    frames: UnboundedSender<InboundFrame>,
    channels: Mutex<HashMap<u16, Channel>>,
    /// Consumer tags cancelled by the client; their stream ending is expected.
    cancelled: Arc<Mutex<HashSet<String>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

fn channel_error(channel_id: u16, err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            AmqpError::ConnectionError(err.to_string())
        }
        other => AmqpError::ChannelError(channel_id, other.to_string()),
    }
}

impl LapinConnection {
    fn channel(&self, channel_id: u16) -> Result<Channel, AmqpError> {
        locked(&self.channels)
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| AmqpError::ChannelError(channel_id, "channel is not open".to_owned()))
    }
}

/// Headers with a textual or scalar value; nested tables and arrays are dropped.
fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
            AMQPValue::ShortString(value) => value.as_str().to_owned(),
            AMQPValue::LongInt(value) => value.to_string(),
            AMQPValue::LongLongInt(value) => value.to_string(),
            AMQPValue::Boolean(value) => value.to_string(),
            _ => continue,
        };
        headers.insert(key.as_str().to_owned(), value);
    }

    headers
}

fn raw_delivery(channel_id: u16, consumer_tag: &str, delivery: Delivery) -> RawDelivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(string_headers)
        .unwrap_or_default();

    RawDelivery {
        channel_id,
        consumer_tag: consumer_tag.to_owned(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        kind: delivery.properties.kind().as_ref().map(|kind| kind.to_string()),
        headers,
        payload: delivery.data,
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            channel_error(channel_id, err)
        })?;

        locked(&self.channels).insert(channel_id, channel);
        Ok(())
    }

    async fn close_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        let channel = locked(&self.channels)
            .remove(&channel_id)
            .ok_or_else(|| AmqpError::ChannelError(channel_id, "channel is not open".to_owned()))?;

        channel
            .close(200, "OK")
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn declare_queue(&self, channel_id: u16, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channel(channel_id)?;

        let mut queue_args = BTreeMap::new();
        if let Some(ttl) = def.message_ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }
        if let Some(max_length) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max_length)),
            );
        }

        channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                if is_precondition_failed(&err) {
                    AmqpError::QueueConflictError(def.name.clone())
                } else {
                    channel_error(channel_id, err)
                }
            })
    }

    async fn qos(&self, channel_id: u16, prefetch: u16) -> Result<(), AmqpError> {
        self.channel(channel_id)?
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn consume(
        &self,
        channel_id: u16,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError> {
        let channel = self.channel(channel_id)?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "failure to declare consumer");
                channel_error(channel_id, err)
            })?;

        locked(&self.cancelled).remove(consumer_tag);
        let frames = self.frames.clone();
        let cancelled = self.cancelled.clone();
        let consumer_tag = consumer_tag.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let _ = frames.send(InboundFrame::Deliver(raw_delivery(channel_id, &consumer_tag, delivery)));
                    }
                    Err(err) => {
                        warn!(error = err.to_string(), channel_id, "consumer stream failed");
                        let _ = frames.send(InboundFrame::ChannelClosed {
                            channel_id,
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }

            if !locked(&cancelled).remove(&consumer_tag) {
                let _ = frames.send(InboundFrame::ConsumerCancelled {
                    channel_id,
                    consumer_tag,
                });
            } else {
                debug!(channel_id, consumer_tag, "consumer stream ended");
            }
        });

        Ok(())
    }

    async fn cancel(&self, channel_id: u16, consumer_tag: &str) -> Result<(), AmqpError> {
        locked(&self.cancelled).insert(consumer_tag.to_owned());

        self.channel(channel_id)?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn ack(&self, channel_id: u16, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel(channel_id)?
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn nack(
        &self,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel(channel_id)?
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn reject(&self, channel_id: u16, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel(channel_id)?
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| channel_error(channel_id, err))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        locked(&self.channels).clear();

        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::{AMQPError, AMQPHardError};

    #[test]
    fn precondition_failed_is_a_queue_conflict() {
        let soft = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED),
            ShortString::from("inequivalent arg 'durable'"),
        ));
        let hard = lapin::Error::ProtocolError(AMQPError::new(
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED),
            ShortString::from("closed"),
        ));

        assert!(is_precondition_failed(&soft));
        assert!(!is_precondition_failed(&hard));
    }

    #[test]
    fn keeps_textual_and_scalar_headers() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        table.insert(ShortString::from("x-attempt"), AMQPValue::LongInt(3));
        table.insert(ShortString::from("x-nested"), AMQPValue::FieldTable(FieldTable::default()));

        let headers = string_headers(&table);

        assert_eq!(headers.get("traceparent").map(String::as_str), Some("00-abc-def-01"));
        assert_eq!(headers.get("x-attempt").map(String::as_str), Some("3"));
        assert!(!headers.contains_key("x-nested"));
    }
}
