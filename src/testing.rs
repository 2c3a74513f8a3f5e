// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker double implementing [`Connector`] and [`BrokerConnection`] for tests of
//! code built on this crate. It keeps queues, channels, consumers and unacknowledged
//! deliveries like a broker would, records every frame it receives as a
//! [`BrokerEvent`], and records protocol misuse (settling an unknown tag, settling
//! twice) as violations instead of closing the channel.
//!
//! Failures are injected by hand: refused connects, dropped connections, closed
//! channels and broker-side consumer cancellation.
//!
//! Messages returned with `nack`/`reject` and `requeue = true` are parked until
//! [`MemoryBroker::redeliver_requeued`] is called, so a handler that always fails does
//! not spin. Deliveries left unacknowledged by a lost connection or channel go back to
//! the head of their queue with `redelivered` set, as on a real broker.

use crate::{
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{BrokerConnection, BrokerLink, ConnectionParams, Connector, InboundFrame, RawDelivery},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

/// Frames observed by the broker, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected {
        generation: u64,
    },
    ChannelOpened {
        generation: u64,
        channel_id: u16,
    },
    ChannelClosed {
        generation: u64,
        channel_id: u16,
    },
    QueueDeclared {
        queue: String,
        durable: bool,
    },
    Qos {
        channel_id: u16,
        prefetch: u16,
    },
    Consumed {
        generation: u64,
        channel_id: u16,
        queue: String,
        consumer_tag: String,
        no_ack: bool,
    },
    Cancelled {
        channel_id: u16,
        consumer_tag: String,
    },
    Acked {
        generation: u64,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
    },
    Nacked {
        generation: u64,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Rejected {
        generation: u64,
        channel_id: u16,
        delivery_tag: u64,
        requeue: bool,
    },
    /// Closed by the client.
    Closed {
        generation: u64,
    },
    /// Dropped by the broker side.
    Dropped {
        generation: u64,
    },
}

/// A message sitting in a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredMessage {
    pub kind: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Default)]
struct StoredQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    parked: Vec<StoredMessage>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelSlot {
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

impl ChannelSlot {
    fn new() -> Self {
        ChannelSlot {
            next_tag: 1,
            prefetch: 0,
            unacked: BTreeMap::new(),
        }
    }

    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

struct ActiveConsumer {
    channel_id: u16,
    consumer_tag: String,
    queue: String,
    no_ack: bool,
}

struct Link {
    generation: u64,
    frames: UnboundedSender<InboundFrame>,
    channels: HashMap<u16, ChannelSlot>,
    consumers: Vec<ActiveConsumer>,
}

#[derive(Default)]
struct State {
    generation: u64,
    link: Option<Link>,
    queues: HashMap<String, StoredQueue>,
    events: Vec<BrokerEvent>,
    violations: Vec<String>,
    refuse_connects: u32,
    connect_attempts: u32,
}

impl State {
    fn link_mut(&mut self, generation: u64) -> Result<&mut Link, AmqpError> {
        match self.link.as_mut() {
            Some(link) if link.generation == generation => Ok(link),
            _ => Err(AmqpError::ConnectionError("connection closed".to_owned())),
        }
    }

    fn channel_mut(&mut self, generation: u64, channel_id: u16) -> Result<&mut ChannelSlot, AmqpError> {
        self.link_mut(generation)?
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| AmqpError::ChannelError(channel_id, "channel is not open".to_owned()))
    }

    /// Puts unacknowledged deliveries back at the head of their queues.
    fn requeue_unacked(&mut self, unacked: BTreeMap<u64, Unacked>) {
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..entry.message
                });
            }
        }
    }

    fn take_link(&mut self) -> Option<u64> {
        let link = self.link.take()?;
        let generation = link.generation;
        for (_, channel) in link.channels {
            self.requeue_unacked(channel.unacked);
        }
        Some(generation)
    }

    fn settle(&mut self, generation: u64, channel_id: u16, delivery_tag: u64, multiple: bool) -> Vec<Unacked> {
        if self.channel_mut(generation, channel_id).is_err() {
            self.violations
                .push(format!("settlement of tag {delivery_tag} on closed channel {channel_id}"));
            return Vec::new();
        }
        let Ok(channel) = self.channel_mut(generation, channel_id) else {
            return Vec::new();
        };

        let settled: Vec<Unacked> = if multiple {
            let tags: Vec<u64> = channel.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect();
            tags.iter().filter_map(|tag| channel.unacked.remove(tag)).collect()
        } else {
            channel.unacked.remove(&delivery_tag).into_iter().collect()
        };

        if settled.is_empty() {
            self.violations.push(format!(
                "unknown delivery tag {delivery_tag} on channel {channel_id} (generation {generation})"
            ));
        }
        settled
    }

    fn park(&mut self, settled: Vec<Unacked>) {
        for entry in settled {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.parked.push(entry.message);
            }
        }
    }

    /// Hands ready messages to consumers with credit, round-robin.
    fn pump(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        loop {
            let mut delivered = false;

            for consumer in &link.consumers {
                let Some(channel) = link.channels.get_mut(&consumer.channel_id) else {
                    continue;
                };
                if !consumer.no_ack && !channel.has_credit() {
                    continue;
                }
                let Some(queue) = self.queues.get_mut(&consumer.queue) else {
                    continue;
                };
                let Some(message) = queue.ready.pop_front() else {
                    continue;
                };

                let delivery_tag = channel.next_tag;
                channel.next_tag += 1;
                if !consumer.no_ack {
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: consumer.queue.clone(),
                            message: message.clone(),
                        },
                    );
                }

                let _ = link.frames.send(InboundFrame::Deliver(RawDelivery {
                    channel_id: consumer.channel_id,
                    consumer_tag: consumer.consumer_tag.clone(),
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: String::new(),
                    routing_key: consumer.queue.clone(),
                    kind: message.kind,
                    headers: message.headers,
                    payload: message.payload,
                }));
                delivered = true;
            }

            if !delivered {
                return;
            }
        }
    }
}

/// Shared handle to the in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open_link(&self) -> Result<BrokerLink, AmqpError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(self.establish(&mut state))
    }

    fn establish(&self, state: &mut State) -> BrokerLink {
        if let Some(previous) = state.take_link() {
            state.events.push(BrokerEvent::Dropped { generation: previous });
        }

        state.generation += 1;
        let generation = state.generation;
        let (tx, frames) = mpsc::unbounded_channel();
        state.link = Some(Link {
            generation,
            frames: tx,
            channels: HashMap::new(),
            consumers: Vec::new(),
        });
        state.events.push(BrokerEvent::Connected { generation });

        BrokerLink {
            connection: Arc::new(MemoryConnection {
                broker: self.clone(),
                generation,
            }),
            frames,
        }
    }

    /// Connects without going through a [`Connector`]; never refused.
    pub fn connect_direct(&self) -> BrokerLink {
        let mut state = self.state();
        state.connect_attempts += 1;
        self.establish(&mut state)
    }

    /// Refuses the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().refuse_connects = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Generation of the most recent connection.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn is_connected(&self) -> bool {
        self.state().link.is_some()
    }

    /// Creates a queue as if another client had declared it.
    pub fn declare_existing(&self, queue: &str, durable: bool) {
        let mut state = self.state();
        state.queues.entry(queue.to_owned()).or_default().durable = durable;
    }

    pub fn publish(&self, queue: &str, payload: &[u8]) {
        self.publish_message(
            queue,
            StoredMessage {
                payload: payload.to_vec(),
                ..StoredMessage::default()
            },
        );
    }

    /// Publishes to the default exchange; unroutable messages are dropped.
    pub fn publish_message(&self, queue: &str, message: StoredMessage) {
        let mut state = self.state();
        match state.queues.get_mut(queue) {
            Some(stored) => stored.ready.push_back(message),
            None => {
                state.violations.push(format!("published to unknown queue {queue}"));
                return;
            }
        }
        state.pump();
    }

    /// Returns parked (requeued) messages to their queues and delivers them again.
    pub fn redeliver_requeued(&self) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            let parked: Vec<StoredMessage> = queue.parked.drain(..).collect();
            for message in parked.into_iter().rev() {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
        }
        state.pump();
    }

    /// Delivers ready messages to consumers with credit.
    pub fn pump(&self) {
        self.state().pump();
    }

    /// Drops the current connection from the broker side.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        let frames = state.link.as_ref().map(|link| link.frames.clone());

        if let Some(generation) = state.take_link() {
            debug!(generation, "memory broker dropping connection");
            state.events.push(BrokerEvent::Dropped { generation });
            if let Some(frames) = frames {
                let _ = frames.send(InboundFrame::ConnectionClosed {
                    reason: "connection reset by broker".to_owned(),
                });
            }
        }
    }

    /// Closes one channel from the broker side.
    pub fn fail_channel(&self, channel_id: u16) {
        let mut state = self.state();
        let Some(link) = state.link.as_mut() else {
            return;
        };
        let Some(channel) = link.channels.remove(&channel_id) else {
            return;
        };

        link.consumers.retain(|consumer| consumer.channel_id != channel_id);
        let _ = link.frames.send(InboundFrame::ChannelClosed {
            channel_id,
            reason: "PRECONDITION_FAILED".to_owned(),
        });

        state.requeue_unacked(channel.unacked);
        state.pump();
    }

    /// Cancels a consumer from the broker side, as when its queue is deleted.
    pub fn cancel_consumer(&self, consumer_tag: &str) {
        let mut state = self.state();
        let Some(link) = state.link.as_mut() else {
            return;
        };
        let Some(position) = link
            .consumers
            .iter()
            .position(|consumer| consumer.consumer_tag == consumer_tag)
        else {
            return;
        };

        let consumer = link.consumers.remove(position);
        let _ = link.frames.send(InboundFrame::ConsumerCancelled {
            channel_id: consumer.channel_id,
            consumer_tag: consumer.consumer_tag,
        });
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state().events.clone()
    }

    /// `(delivery_tag, multiple)` of every ack, all connections included.
    pub fn acks(&self) -> Vec<(u64, bool)> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Acked {
                    delivery_tag,
                    multiple,
                    ..
                } => Some((*delivery_tag, *multiple)),
                _ => None,
            })
            .collect()
    }

    /// `(delivery_tag, requeue)` of every nack.
    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Nacked {
                    delivery_tag,
                    requeue,
                    ..
                } => Some((*delivery_tag, *requeue)),
                _ => None,
            })
            .collect()
    }

    /// `(delivery_tag, requeue)` of every reject.
    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                BrokerEvent::Rejected {
                    delivery_tag,
                    requeue,
                    ..
                } => Some((*delivery_tag, *requeue)),
                _ => None,
            })
            .collect()
    }

    /// Number of ack, nack and reject frames received.
    pub fn settlements(&self) -> usize {
        self.state()
            .events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    BrokerEvent::Acked { .. } | BrokerEvent::Nacked { .. } | BrokerEvent::Rejected { .. }
                )
            })
            .count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }

    /// Messages waiting in a queue, parked ones excluded.
    pub fn ready(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|stored| stored.ready.len())
            .unwrap_or_default()
    }

    pub fn parked(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|stored| stored.parked.len())
            .unwrap_or_default()
    }

    /// Deliveries awaiting settlement on the current connection.
    pub fn unacked(&self) -> usize {
        self.state()
            .link
            .as_ref()
            .map(|link| link.channels.values().map(|channel| channel.unacked.len()).sum())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _params: &ConnectionParams) -> Result<BrokerLink, AmqpError> {
        self.open_link()
    }
}

/// One connection to the in-memory broker.
pub struct MemoryConnection {
    broker: MemoryBroker,
    generation: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let link = state.link_mut(self.generation)?;
        if link.channels.contains_key(&channel_id) {
            return Err(AmqpError::ChannelError(channel_id, "channel already open".to_owned()));
        }

        link.channels.insert(channel_id, ChannelSlot::new());
        state.events.push(BrokerEvent::ChannelOpened {
            generation: self.generation,
            channel_id,
        });
        Ok(())
    }

    async fn close_channel(&self, channel_id: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let link = state.link_mut(self.generation)?;
        let channel = link
            .channels
            .remove(&channel_id)
            .ok_or_else(|| AmqpError::ChannelError(channel_id, "channel is not open".to_owned()))?;
        link.consumers.retain(|consumer| consumer.channel_id != channel_id);

        state.requeue_unacked(channel.unacked);
        state.events.push(BrokerEvent::ChannelClosed {
            generation: self.generation,
            channel_id,
        });
        state.pump();
        Ok(())
    }

    async fn declare_queue(&self, channel_id: u16, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.generation, channel_id)?;

        let existing = state.queues.get(def.name()).map(|queue| queue.durable);
        match existing {
            Some(durable) if durable != def.is_durable() => {
                // the broker closes the channel on PRECONDITION_FAILED
                if let Ok(link) = state.link_mut(self.generation) {
                    link.channels.remove(&channel_id);
                }
                return Err(AmqpError::QueueConflictError(def.name().to_owned()));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    StoredQueue {
                        durable: def.is_durable(),
                        ..StoredQueue::default()
                    },
                );
            }
        }

        state.events.push(BrokerEvent::QueueDeclared {
            queue: def.name().to_owned(),
            durable: def.is_durable(),
        });
        Ok(())
    }

    async fn qos(&self, channel_id: u16, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.generation, channel_id)?.prefetch = prefetch;
        state.events.push(BrokerEvent::Qos { channel_id, prefetch });
        Ok(())
    }

    async fn consume(
        &self,
        channel_id: u16,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let link = state.link_mut(self.generation)?;
        if !link.channels.contains_key(&channel_id) {
            return Err(AmqpError::ChannelError(channel_id, "channel is not open".to_owned()));
        }
        link.consumers.push(ActiveConsumer {
            channel_id,
            consumer_tag: consumer_tag.to_owned(),
            queue: queue.to_owned(),
            no_ack,
        });

        state.events.push(BrokerEvent::Consumed {
            generation: self.generation,
            channel_id,
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            no_ack,
        });
        state.pump();
        Ok(())
    }

    async fn cancel(&self, channel_id: u16, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let link = state.link_mut(self.generation)?;
        link.consumers
            .retain(|consumer| !(consumer.channel_id == channel_id && consumer.consumer_tag == consumer_tag));

        state.events.push(BrokerEvent::Cancelled {
            channel_id,
            consumer_tag: consumer_tag.to_owned(),
        });
        Ok(())
    }

    async fn ack(&self, channel_id: u16, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.link_mut(self.generation)?;

        state.settle(self.generation, channel_id, delivery_tag, multiple);
        state.events.push(BrokerEvent::Acked {
            generation: self.generation,
            channel_id,
            delivery_tag,
            multiple,
        });
        state.pump();
        Ok(())
    }

    async fn nack(
        &self,
        channel_id: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.link_mut(self.generation)?;

        let settled = state.settle(self.generation, channel_id, delivery_tag, multiple);
        if requeue {
            state.park(settled);
        }
        state.events.push(BrokerEvent::Nacked {
            generation: self.generation,
            channel_id,
            delivery_tag,
            multiple,
            requeue,
        });
        state.pump();
        Ok(())
    }

    async fn reject(&self, channel_id: u16, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.link_mut(self.generation)?;

        let settled = state.settle(self.generation, channel_id, delivery_tag, false);
        if requeue {
            state.park(settled);
        }
        state.events.push(BrokerEvent::Rejected {
            generation: self.generation,
            channel_id,
            delivery_tag,
            requeue,
        });
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.link_mut(self.generation)?;

        state.take_link();
        state.events.push(BrokerEvent::Closed {
            generation: self.generation,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn consuming(broker: &MemoryBroker, no_ack: bool, prefetch: u16) -> BrokerLink {
        let link = broker.connect_direct();
        link.connection.open_channel(1).await.unwrap();
        link.connection
            .declare_queue(1, &QueueDefinition::new("jobs"))
            .await
            .unwrap();
        link.connection.qos(1, prefetch).await.unwrap();
        link.connection.consume(1, "jobs", "ctag", no_ack).await.unwrap();
        link
    }

    fn delivered(frame: InboundFrame) -> RawDelivery {
        match frame {
            InboundFrame::Deliver(delivery) => delivery,
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn respects_prefetch_credit() {
        let broker = MemoryBroker::new();
        let mut link = consuming(&broker, false, 2).await;

        for payload in [b"a", b"b", b"c"] {
            broker.publish("jobs", payload);
        }

        assert_eq!(delivered(link.frames.recv().await.unwrap()).delivery_tag, 1);
        assert_eq!(delivered(link.frames.recv().await.unwrap()).delivery_tag, 2);
        assert!(link.frames.try_recv().is_err());
        assert_eq!(broker.ready("jobs"), 1);

        link.connection.ack(1, 1, false).await.unwrap();
        let third = delivered(link.frames.recv().await.unwrap());
        assert_eq!((third.delivery_tag, third.payload), (3, b"c".to_vec()));
    }

    #[tokio::test]
    async fn records_settlement_violations() {
        let broker = MemoryBroker::new();
        let link = consuming(&broker, false, 0).await;
        broker.publish("jobs", b"a");

        link.connection.ack(1, 1, false).await.unwrap();
        link.connection.ack(1, 1, false).await.unwrap();
        link.connection.nack(1, 9, false, true).await.unwrap();

        assert_eq!(broker.violations().len(), 2);
    }

    #[tokio::test]
    async fn dropped_connection_redelivers_unacked() {
        let broker = MemoryBroker::new();
        let mut link = consuming(&broker, false, 0).await;
        broker.publish("jobs", b"a");
        broker.publish("jobs", b"b");
        link.frames.recv().await.unwrap();
        link.frames.recv().await.unwrap();
        link.connection.ack(1, 1, false).await.unwrap();

        broker.drop_connection();
        assert!(matches!(
            link.frames.recv().await.unwrap(),
            InboundFrame::ConnectionClosed { .. }
        ));
        assert!(link.connection.ack(1, 2, false).await.is_err());

        let mut next = consuming(&broker, false, 0).await;
        let again = delivered(next.frames.recv().await.unwrap());
        assert_eq!(again.payload, b"b".to_vec());
        assert_eq!(again.delivery_tag, 1);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn requeued_messages_wait_until_released() {
        let broker = MemoryBroker::new();
        let mut link = consuming(&broker, false, 0).await;
        broker.publish("jobs", b"a");
        link.frames.recv().await.unwrap();

        link.connection.nack(1, 1, false, true).await.unwrap();
        assert_eq!(broker.parked("jobs"), 1);
        assert!(link.frames.try_recv().is_err());

        broker.redeliver_requeued();
        let again = delivered(link.frames.recv().await.unwrap());
        assert_eq!((again.delivery_tag, again.redelivered), (2, true));
    }

    #[tokio::test]
    async fn durability_conflict_closes_the_channel() {
        let broker = MemoryBroker::new();
        broker.declare_existing("jobs", true);
        let link = broker.connect_direct();
        link.connection.open_channel(1).await.unwrap();

        let err = link
            .connection
            .declare_queue(1, &QueueDefinition::new("jobs"))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::QueueConflictError("jobs".to_owned()));
        assert!(matches!(link.connection.qos(1, 1).await, Err(AmqpError::ChannelError(1, _))));
    }

    #[tokio::test]
    async fn refused_connects_count_as_attempts() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let params = ConnectionParams {
            uri: "amqp://localhost".to_owned(),
            endpoint: "localhost:5672".to_owned(),
            connection_name: "test".to_owned(),
        };

        assert!(broker.connect(&params).await.is_err());
        assert!(broker.connect(&params).await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.generation(), 1);
    }
}
