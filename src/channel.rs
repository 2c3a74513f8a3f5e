// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module multiplexes logical channels over one [`Connection`]. Channel ids come
//! from a pool unique per connection and are reclaimed on close. Every opened channel
//! also receives a process-wide serial, so a delivery from a closed channel is never
//! confused with one from a later channel that reused the same id.

use crate::{connection::Connection, errors::AmqpError};
use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error, warn};

static CHANNEL_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identity of one opened channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelRef {
    pub id: u16,
    pub serial: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// A logical channel multiplexed over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub(crate) channel: ChannelRef,
    pub(crate) generation: u64,
    /// Flow-control credit granted to the broker (basic.qos prefetch), zero = unlimited.
    pub(crate) credit: u16,
    pub(crate) state: ChannelState,
}

impl Channel {
    pub fn id(&self) -> u16 {
        self.channel.id
    }

    pub fn reference(&self) -> ChannelRef {
        self.channel
    }

    pub fn credit(&self) -> u16 {
        self.credit
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// Channel ids in use on one connection; lowest free id first.
#[derive(Debug)]
pub struct ChannelIdPool {
    max: u16,
    next: u16,
    released: BTreeSet<u16>,
}

impl ChannelIdPool {
    pub fn new(max: u16) -> Self {
        ChannelIdPool {
            max,
            next: 1,
            released: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        if let Some(id) = self.released.pop_first() {
            return Some(id);
        }

        if self.next == 0 || self.next > self.max {
            return None;
        }

        let id = self.next;
        self.next = self.next.checked_add(1).unwrap_or(0);
        Some(id)
    }

    pub fn release(&mut self, id: u16) {
        if id == 0 || id > self.max || (self.next != 0 && id >= self.next) {
            return;
        }
        self.released.insert(id);
    }
}

/// Opens and closes channels of the current connection.
pub struct ChannelManager {
    generation: u64,
    pool: ChannelIdPool,
    channels: HashMap<u16, Channel>,
}

impl ChannelManager {
    pub fn new(connection: &Connection, channel_max: u16) -> Self {
        ChannelManager {
            generation: connection.generation(),
            pool: ChannelIdPool::new(channel_max),
            channels: HashMap::new(),
        }
    }

    pub async fn open_channel(&mut self, connection: &Connection) -> Result<Channel, AmqpError> {
        if connection.generation() != self.generation {
            return Err(AmqpError::ConnectionError(
                "channel manager belongs to a previous connection".to_owned(),
            ));
        }

        let Some(id) = self.pool.allocate() else {
            error!(generation = self.generation, "no channel id left");
            return Err(AmqpError::ChannelError(0, "channel ids exhausted".to_owned()));
        };

        debug!("creating amqp channel...");
        if let Err(err) = connection.writer().open_channel(id).await {
            error!(error = err.to_string(), channel_id = id, "error to create the channel");
            self.pool.release(id);
            return Err(match err {
                AmqpError::ConnectionError(_) => err,
                _ => AmqpError::ChannelError(id, err.to_string()),
            });
        }

        let channel = Channel {
            channel: ChannelRef {
                id,
                serial: CHANNEL_SERIAL.fetch_add(1, Ordering::Relaxed),
            },
            generation: self.generation,
            credit: 0,
            state: ChannelState::Open,
        };
        self.channels.insert(id, channel.clone());
        debug!(channel_id = id, "channel created");

        Ok(channel)
    }

    /// Closes the channel on the broker and reclaims its id.
    pub async fn close_channel(&mut self, connection: &Connection, channel: &mut Channel) {
        if channel.generation != self.generation || !self.channels.contains_key(&channel.id()) {
            channel.state = ChannelState::Closed;
            return;
        }

        if let Err(err) = connection.writer().close_channel(channel.id()).await {
            warn!(error = err.to_string(), channel_id = channel.id(), "failure to close channel");
        }

        channel.state = ChannelState::Closed;
        self.forget(channel.id());
    }

    /// Releases a channel the broker already closed. No frame is sent.
    pub fn channel_lost(&mut self, channel_id: u16) -> Option<Channel> {
        let mut lost = self.channels.remove(&channel_id)?;
        lost.state = ChannelState::Closed;
        self.pool.release(channel_id);
        Some(lost)
    }

    /// Grants `prefetch` unacknowledged deliveries to the broker on this channel.
    pub async fn set_prefetch(
        &mut self,
        connection: &Connection,
        channel: &mut Channel,
        prefetch: u16,
    ) -> Result<(), AmqpError> {
        connection
            .writer()
            .qos(channel.id(), prefetch)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), channel_id = channel.id(), "failure to configure qos");
                match err {
                    AmqpError::ConnectionError(_) => err,
                    _ => AmqpError::QoSDeclarationError(err.to_string()),
                }
            })?;

        channel.credit = prefetch;
        if let Some(tracked) = self.channels.get_mut(&channel.id()) {
            tracked.credit = prefetch;
        }

        Ok(())
    }

    pub fn get(&self, channel_id: u16) -> Option<&Channel> {
        self.channels.get(&channel_id)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    fn forget(&mut self, channel_id: u16) {
        if self.channels.remove(&channel_id).is_some() {
            self.pool.release(channel_id);
        }
    }
}
