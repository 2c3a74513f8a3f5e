// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_consumer::{
    testing::{BrokerEvent, MemoryBroker},
    ConsumerConfigs, ConsumerHandler, ConsumerMessage, HandlerError, RabbitMQConsumer,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

pub fn configs() -> ConsumerConfigs {
    ConsumerConfigs {
        backoff_base_ms: 1,
        backoff_max_ms: 10,
        backoff_jitter: false,
        max_reconnect_attempts: 5,
        shutdown_timeout_ms: 500,
        ..ConsumerConfigs::default()
    }
}

pub async fn started(broker: &MemoryBroker, cfgs: ConsumerConfigs) -> RabbitMQConsumer {
    let consumer = RabbitMQConsumer::new(cfgs, Arc::new(broker.clone())).unwrap();
    consumer.start().await.unwrap();
    consumer
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// `(generation, channel_id, queue, consumer_tag, no_ack)` of every consume.
pub fn consumes(broker: &MemoryBroker) -> Vec<(u64, u16, String, String, bool)> {
    broker
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BrokerEvent::Consumed {
                generation,
                channel_id,
                queue,
                consumer_tag,
                no_ack,
            } => Some((generation, channel_id, queue, consumer_tag, no_ack)),
            _ => None,
        })
        .collect()
}

/// What a handler saw of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub text: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

type Behaviour = dyn Fn(&ConsumerMessage) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
    + Send
    + Sync;

/// Records every message, then runs a configurable behaviour.
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    behaviour: Box<Behaviour>,
}

impl Recorder {
    pub fn ok() -> Arc<Self> {
        Self::with(|_| Box::pin(async { Ok::<_, HandlerError>(()) }))
    }

    pub fn with<F>(behaviour: F) -> Arc<Self>
    where
        F: Fn(&ConsumerMessage) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            behaviour: Box::new(behaviour),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.seen().into_iter().map(|seen| seen.text).collect()
    }
}

#[async_trait]
impl ConsumerHandler for Recorder {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen {
            text: msg.text(),
            delivery_tag: msg.metadata.delivery_tag,
            redelivered: msg.metadata.redelivered,
        });
        (self.behaviour)(msg).await
    }
}
