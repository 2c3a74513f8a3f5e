// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Tracker
//!
//! Tracks unacknowledged deliveries per channel and issues ack/nack/reject frames.
//! A delivery is `Delivered` until it is settled exactly once; settling an unknown or
//! already settled tag fails with `InvalidAckError` and sends nothing to the broker.
//!
//! Ledgers are keyed by channel serial. When a channel or connection goes away its
//! ledger is dropped: the broker requeues those deliveries itself, and any late
//! settlement for them is refused instead of being sent on an unrelated channel.

use crate::{
    channel::ChannelRef,
    connection::{OutboundFrame, PendingFrame, Writer},
    errors::AmqpError,
    registry::SubscriptionId,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, warn};

/// State of a delivery under manual acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Acked,
    Nacked,
    Rejected,
}

/// Terminal dispositions issued on a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettledCounts {
    pub acked: u64,
    pub nacked: u64,
    pub rejected: u64,
}

struct ChannelLedger {
    channel_id: u16,
    writer: Writer,
    outstanding: BTreeMap<u64, SubscriptionId>,
    last_tag: u64,
    settled: SettledCounts,
}

impl ChannelLedger {
    fn record(&mut self, state: DeliveryState, count: u64) {
        match state {
            DeliveryState::Acked => self.settled.acked += count,
            DeliveryState::Nacked => self.settled.nacked += count,
            DeliveryState::Rejected => self.settled.rejected += count,
            DeliveryState::Delivered => {}
        }
    }
}

#[derive(Default)]
pub struct AckTracker {
    ledgers: Mutex<HashMap<ChannelRef, ChannelLedger>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledgers(&self) -> MutexGuard<'_, HashMap<ChannelRef, ChannelLedger>> {
        match self.ledgers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Starts tracking a channel whose frames go through `writer`.
    pub fn open_channel(&self, channel: ChannelRef, writer: Writer) {
        self.ledgers().insert(
            channel,
            ChannelLedger {
                channel_id: channel.id,
                writer,
                outstanding: BTreeMap::new(),
                last_tag: 0,
                settled: SettledCounts::default(),
            },
        );
    }

    /// Stops tracking a channel; returns how many deliveries were still outstanding.
    pub fn close_channel(&self, channel: ChannelRef) -> usize {
        self.ledgers()
            .remove(&channel)
            .map(|ledger| ledger.outstanding.len())
            .unwrap_or_default()
    }

    /// Drops every ledger of a connection generation.
    pub fn close_generation(&self, generation: u64) -> usize {
        let mut ledgers = self.ledgers();
        let mut dropped = 0;

        ledgers.retain(|_, ledger| {
            if ledger.writer.generation() == generation {
                dropped += ledger.outstanding.len();
                false
            } else {
                true
            }
        });

        if dropped > 0 {
            warn!(generation, dropped, "abandoning unacknowledged deliveries of a lost connection");
        }
        dropped
    }

    /// Records a new delivery in `Delivered` state.
    pub fn register(
        &self,
        channel: ChannelRef,
        delivery_tag: u64,
        subscription: SubscriptionId,
    ) -> Result<(), AmqpError> {
        let mut ledgers = self.ledgers();
        let ledger = ledgers
            .get_mut(&channel)
            .ok_or_else(|| AmqpError::ChannelError(channel.id, "channel is not tracked".to_owned()))?;

        if delivery_tag <= ledger.last_tag {
            error!(
                channel_id = channel.id,
                delivery_tag,
                last_tag = ledger.last_tag,
                "delivery tag reused on channel"
            );
            return Err(AmqpError::InvalidAckError(delivery_tag));
        }

        ledger.last_tag = delivery_tag;
        ledger.outstanding.insert(delivery_tag, subscription);
        Ok(())
    }

    pub fn state(&self, channel: ChannelRef, delivery_tag: u64) -> Option<DeliveryState> {
        self.ledgers()
            .get(&channel)
            .filter(|ledger| ledger.outstanding.contains_key(&delivery_tag))
            .map(|_| DeliveryState::Delivered)
    }

    pub fn outstanding(&self, channel: ChannelRef) -> usize {
        self.ledgers()
            .get(&channel)
            .map(|ledger| ledger.outstanding.len())
            .unwrap_or_default()
    }

    pub fn total_outstanding(&self) -> usize {
        self.ledgers()
            .values()
            .map(|ledger| ledger.outstanding.len())
            .sum()
    }

    pub fn settled(&self, channel: ChannelRef) -> Option<SettledCounts> {
        self.ledgers().get(&channel).map(|ledger| ledger.settled)
    }

    pub async fn ack(&self, channel: ChannelRef, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(channel, delivery_tag, DeliveryState::Acked, false)
            .await
    }

    pub async fn nack(&self, channel: ChannelRef, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settle(channel, delivery_tag, DeliveryState::Nacked, requeue)
            .await
    }

    /// Rejects a delivery without requeueing it.
    pub async fn reject(&self, channel: ChannelRef, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(channel, delivery_tag, DeliveryState::Rejected, false)
            .await
    }

    async fn settle(
        &self,
        channel: ChannelRef,
        delivery_tag: u64,
        state: DeliveryState,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let pending = {
            let mut ledgers = self.ledgers();
            let ledger = ledgers.get_mut(&channel).ok_or_else(|| {
                debug!(channel_id = channel.id, delivery_tag, "settling on a closed channel");
                AmqpError::ChannelError(channel.id, "channel closed".to_owned())
            })?;

            if ledger.outstanding.remove(&delivery_tag).is_none() {
                warn!(channel_id = channel.id, delivery_tag, "unknown or already settled delivery tag");
                return Err(AmqpError::InvalidAckError(delivery_tag));
            }
            ledger.record(state, 1);

            let frame = match state {
                DeliveryState::Acked => OutboundFrame::Ack(ledger.channel_id, delivery_tag, false),
                DeliveryState::Nacked => {
                    OutboundFrame::Nack(ledger.channel_id, delivery_tag, false, requeue)
                }
                DeliveryState::Rejected => OutboundFrame::Reject(ledger.channel_id, delivery_tag, false),
                DeliveryState::Delivered => return Err(AmqpError::InternalError),
            };

            // submitted under the lock so frames reach the broker in settlement order
            ledger.writer.submit(frame)?
        };

        pending.wait().await.map_err(|err| {
            error!(error = err.to_string(), channel_id = channel.id, delivery_tag, "error whiling settling msg");
            match state {
                DeliveryState::Acked => AmqpError::AckMessageError,
                DeliveryState::Nacked => AmqpError::NackMessageError,
                _ => AmqpError::RejectMessageError,
            }
        })
    }

    /// Acks `delivery_tag` and every lower outstanding tag of the same subscription.
    ///
    /// A single `multiple` ack is only sent when no lower outstanding tag on the
    /// channel belongs to another subscription; otherwise the tags are acked one by
    /// one and the other subscription's deliveries stay outstanding.
    pub async fn ack_cumulative(&self, channel: ChannelRef, delivery_tag: u64) -> Result<usize, AmqpError> {
        let pending = {
            let mut ledgers = self.ledgers();
            let ledger = ledgers
                .get_mut(&channel)
                .ok_or_else(|| AmqpError::ChannelError(channel.id, "channel closed".to_owned()))?;

            let Some(scope) = ledger.outstanding.get(&delivery_tag).copied() else {
                warn!(channel_id = channel.id, delivery_tag, "unknown or already settled delivery tag");
                return Err(AmqpError::InvalidAckError(delivery_tag));
            };

            let covered: Vec<(u64, SubscriptionId)> = ledger
                .outstanding
                .range(..=delivery_tag)
                .map(|(tag, sub)| (*tag, *sub))
                .collect();
            let single_scope = covered.iter().all(|(_, sub)| *sub == scope);

            let tags: Vec<u64> = covered
                .into_iter()
                .filter(|(_, sub)| *sub == scope)
                .map(|(tag, _)| tag)
                .collect();
            for tag in &tags {
                ledger.outstanding.remove(tag);
            }
            ledger.record(DeliveryState::Acked, tags.len() as u64);

            let mut pending = Vec::new();
            if single_scope {
                pending.push(ledger.writer.submit(OutboundFrame::Ack(ledger.channel_id, delivery_tag, true))?);
            } else {
                debug!(channel_id = channel.id, delivery_tag, "mixed subscriptions on channel, acking one by one");
                for tag in &tags {
                    pending.push(ledger.writer.submit(OutboundFrame::Ack(ledger.channel_id, *tag, false))?);
                }
            }

            (tags.len(), pending)
        };

        let (count, pending) = pending;
        for frame in pending {
            frame.wait().await.map_err(|err| {
                error!(error = err.to_string(), channel_id = channel.id, delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })?;
        }

        Ok(count)
    }

    /// Nacks every outstanding delivery on every channel. Used on shutdown.
    pub async fn nack_outstanding(&self, requeue: bool) -> usize {
        let pending = {
            let mut ledgers = self.ledgers();
            let mut pending = Vec::new();

            for ledger in ledgers.values_mut() {
                let tags: Vec<u64> = ledger.outstanding.keys().copied().collect();
                ledger.outstanding.clear();
                ledger.record(DeliveryState::Nacked, tags.len() as u64);

                for tag in tags {
                    match ledger.writer.submit(OutboundFrame::Nack(ledger.channel_id, tag, false, requeue)) {
                        Ok(frame) => pending.push((ledger.channel_id, tag, frame)),
                        Err(err) => warn!(error = err.to_string(), delivery_tag = tag, "failure to nack msg"),
                    }
                }
            }

            pending
        };

        let count = pending.len();
        for (channel_id, tag, frame) in pending {
            if let Err(err) = frame.wait().await {
                warn!(error = err.to_string(), channel_id, delivery_tag = tag, "failure to nack msg");
            }
        }

        count
    }
}
