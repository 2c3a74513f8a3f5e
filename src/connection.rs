// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Frame Serialization
//!
//! A `Connection` is one generation of the link to the broker. It is created by the
//! [`crate::connector::TransportConnector`], never mutated across a reconnect, and
//! replaced wholesale when the link fails.
//!
//! Every outbound frame (channel management, declarations, acknowledgments) goes
//! through the connection's [`Writer`]: a queue drained by a single task, so frames
//! from concurrent handlers never interleave on the socket. Inbound frames are drained
//! by one reader task that routes deliveries to the dispatcher.

use crate::{
    dispatcher::DeliveryDispatcher,
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{BrokerConnection, InboundFrame},
};
use std::sync::{Arc, Mutex};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Lifecycle of the link to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Failed,
}

#[derive(Debug, Clone)]
pub(crate) enum OutboundFrame {
    OpenChannel(u16),
    CloseChannel(u16),
    DeclareQueue(u16, QueueDefinition),
    Qos(u16, u16),
    Consume {
        channel_id: u16,
        queue: String,
        consumer_tag: String,
        no_ack: bool,
    },
    Cancel(u16, String),
    Ack(u16, u64, bool),
    Nack(u16, u64, bool, bool),
    Reject(u16, u64, bool),
    Close,
}

struct OutboundRequest {
    frame: OutboundFrame,
    reply: oneshot::Sender<Result<(), AmqpError>>,
}

/// Handle to the single outbound queue of a connection.
///
/// Frames are written in the order they were submitted.
#[derive(Clone)]
pub struct Writer {
    generation: u64,
    tx: UnboundedSender<OutboundRequest>,
}

impl Writer {
    pub(crate) fn spawn(generation: u64, link: Arc<dyn BrokerConnection>) -> (Writer, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(generation, link, rx));

        (Writer { generation, tx }, handle)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueues a frame without waiting for the broker.
    pub(crate) fn submit(&self, frame: OutboundFrame) -> Result<PendingFrame, AmqpError> {
        let (reply, response) = oneshot::channel();

        self.tx
            .send(OutboundRequest { frame, reply })
            .map_err(|_| AmqpError::ConnectionError("connection writer stopped".to_owned()))?;

        Ok(PendingFrame { response })
    }

    async fn request(&self, frame: OutboundFrame) -> Result<(), AmqpError> {
        self.submit(frame)?.wait().await
    }

    pub async fn open_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        self.request(OutboundFrame::OpenChannel(channel_id)).await
    }

    pub async fn close_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        self.request(OutboundFrame::CloseChannel(channel_id)).await
    }

    pub async fn declare_queue(&self, channel_id: u16, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.request(OutboundFrame::DeclareQueue(channel_id, def.clone())).await
    }

    pub async fn qos(&self, channel_id: u16, prefetch: u16) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Qos(channel_id, prefetch)).await
    }

    pub async fn consume(
        &self,
        channel_id: u16,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Consume {
            channel_id,
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            no_ack,
        })
        .await
    }

    pub async fn cancel(&self, channel_id: u16, consumer_tag: &str) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Cancel(channel_id, consumer_tag.to_owned())).await
    }

    pub async fn ack(&self, channel_id: u16, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Ack(channel_id, delivery_tag, multiple)).await
    }

    pub async fn nack(
        &self,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Nack(channel_id, delivery_tag, multiple, requeue))
            .await
    }

    pub async fn reject(&self, channel_id: u16, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Reject(channel_id, delivery_tag, requeue)).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.request(OutboundFrame::Close).await
    }
}

/// A submitted frame whose broker reply is still pending.
pub(crate) struct PendingFrame {
    response: oneshot::Receiver<Result<(), AmqpError>>,
}

impl PendingFrame {
    pub(crate) async fn wait(self) -> Result<(), AmqpError> {
        self.response
            .await
            .map_err(|_| AmqpError::ConnectionError("connection writer dropped request".to_owned()))?
    }
}

async fn write_loop(
    generation: u64,
    link: Arc<dyn BrokerConnection>,
    mut rx: UnboundedReceiver<OutboundRequest>,
) {
    while let Some(OutboundRequest { frame, reply }) = rx.recv().await {
        let closing = matches!(frame, OutboundFrame::Close);

        let result = match frame {
            OutboundFrame::OpenChannel(id) => link.open_channel(id).await,
            OutboundFrame::CloseChannel(id) => link.close_channel(id).await,
            OutboundFrame::DeclareQueue(id, def) => link.declare_queue(id, &def).await,
            OutboundFrame::Qos(id, prefetch) => link.qos(id, prefetch).await,
            OutboundFrame::Consume {
                channel_id,
                queue,
                consumer_tag,
                no_ack,
            } => link.consume(channel_id, &queue, &consumer_tag, no_ack).await,
            OutboundFrame::Cancel(id, tag) => link.cancel(id, &tag).await,
            OutboundFrame::Ack(id, tag, multiple) => link.ack(id, tag, multiple).await,
            OutboundFrame::Nack(id, tag, multiple, requeue) => {
                link.nack(id, tag, multiple, requeue).await
            }
            OutboundFrame::Reject(id, tag, requeue) => link.reject(id, tag, requeue).await,
            OutboundFrame::Close => link.close().await,
        };

        // the requester may have given up (shutdown), nothing to do then
        let _ = reply.send(result);

        if closing {
            break;
        }
    }

    debug!(generation, "connection writer stopped");
}

/// One generation of the link to the broker.
pub struct Connection {
    generation: u64,
    endpoint: String,
    writer: Writer,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(generation: u64, endpoint: String, writer: Writer) -> Connection {
        Connection {
            generation,
            endpoint,
            writer,
            state: Mutex::new(ConnectionState::Open),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Closes the link. Errors are logged: the connection is going away regardless.
    pub async fn close(&self) {
        if !self.is_open() {
            return;
        }

        self.set_state(ConnectionState::Closing);
        if let Err(err) = self.writer.close().await {
            warn!(error = err.to_string(), generation = self.generation, "failure to close connection");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Signals from a reader task to the consumer supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    ConnectionLost {
        generation: u64,
        reason: String,
    },
    ChannelLost {
        generation: u64,
        channel_id: u16,
        reason: String,
    },
    ConsumerCancelled {
        generation: u64,
        channel_id: u16,
        consumer_tag: String,
    },
}

/// Spawns the reader task of a connection generation.
pub(crate) fn spawn_reader(
    generation: u64,
    mut frames: UnboundedReceiver<InboundFrame>,
    dispatcher: Arc<DeliveryDispatcher>,
    events: UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                InboundFrame::Deliver(delivery) => dispatcher.route(generation, delivery),

                InboundFrame::ChannelClosed { channel_id, reason } => {
                    warn!(generation, channel_id, reason = %reason, "channel closed by broker");
                    let _ = events.send(LinkEvent::ChannelLost {
                        generation,
                        channel_id,
                        reason,
                    });
                }

                InboundFrame::ConsumerCancelled {
                    channel_id,
                    consumer_tag,
                } => {
                    warn!(generation, channel_id, consumer_tag = %consumer_tag, "consumer cancelled by broker");
                    let _ = events.send(LinkEvent::ConsumerCancelled {
                        generation,
                        channel_id,
                        consumer_tag,
                    });
                }

                InboundFrame::ConnectionClosed { reason } => {
                    error!(generation, reason = %reason, "connection lost");
                    let _ = events.send(LinkEvent::ConnectionLost { generation, reason });
                    return;
                }
            }
        }

        let _ = events.send(LinkEvent::ConnectionLost {
            generation,
            reason: "inbound frame stream ended".to_owned(),
        });
    })
}
