// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! Keeps every queue declaration and subscription made through the consumer. The
//! registry is the permanent state of the consumer: after a reconnect, queues are
//! declared again in declaration order and subscriptions re-established in subscribe
//! order, with identical queue name, ack mode and prefetch.

use crate::{
    channel::Channel,
    config::AckMode,
    connection::Connection,
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::{QueueDefinition, QueueHandle},
};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Identifier of a subscription; increases with every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queue bound to a handler.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) queue: QueueDefinition,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) ack_mode: AckMode,
    pub(crate) prefetch: u16,
    pub(crate) consumer_tag: String,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue.name
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Stable across reconnects.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queue", &self.queue.name)
            .field("ack_mode", &self.ack_mode)
            .field("prefetch", &self.prefetch)
            .field("consumer_tag", &self.consumer_tag)
            .finish()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    queues: Vec<QueueDefinition>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a queue on the broker and records it for replay.
    ///
    /// A conflicting re-declaration is refused locally, without a round-trip; an
    /// identical one returns the existing handle.
    pub async fn declare_queue(
        &mut self,
        connection: &Connection,
        channel: &Channel,
        def: QueueDefinition,
    ) -> Result<QueueHandle, AmqpError> {
        if let Some(existing) = self.queues.iter().find(|queue| queue.name == def.name) {
            if existing.conflicts_with(&def) {
                error!(queue = def.name, durable = def.durable, "queue already declared with other properties");
                return Err(AmqpError::QueueConflictError(def.name));
            }

            return Ok(QueueHandle {
                def: existing.clone(),
            });
        }

        declare_on(connection, channel, &def).await?;
        self.queues.push(def.clone());

        Ok(QueueHandle { def })
    }

    pub fn subscribe(
        &mut self,
        queue: &QueueHandle,
        handler: Arc<dyn ConsumerHandler>,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<SubscriptionId, AmqpError> {
        if !self.queues.contains(&queue.def) {
            error!(queue = queue.name(), "subscribing to a queue that was never declared");
            return Err(AmqpError::BindingConsumerError(queue.name().to_owned()));
        }
        if prefetch == 0 {
            return Err(AmqpError::ConfigError("prefetch must be positive".to_owned()));
        }

        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let subscription = Subscription {
            id,
            queue: queue.def.clone(),
            handler,
            ack_mode,
            prefetch,
            consumer_tag: format!("{}-{}", queue.name(), Uuid::new_v4()),
        };

        debug!(subscription = %id, queue = queue.name(), "subscription registered");
        self.subscriptions.insert(id, subscription);

        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<Subscription, AmqpError> {
        self.subscriptions
            .remove(&id)
            .ok_or(AmqpError::SubscriptionNotFound(id.0))
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    /// Active subscriptions in subscribe order.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values()
    }

    /// Declared queues in declaration order.
    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Sends one queue declaration on `channel`.
pub(crate) async fn declare_on(
    connection: &Connection,
    channel: &Channel,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    match connection.writer().declare_queue(channel.id(), def).await {
        Err(err) => {
            error!(error = err.to_string(), queue = def.name, "failure to declare queue");
            Err(match err {
                AmqpError::QueueConflictError(_)
                | AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(..) => err,
                _ => AmqpError::DeclareQueueError(def.name.clone()),
            })
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelManager,
        connector::{Backoff, TransportConnector},
        handler::MockConsumerHandler,
        testing::{BrokerEvent, MemoryBroker},
        transport::ConnectionParams,
    };
    use std::time::Duration;

    async fn open(broker: &MemoryBroker) -> (Arc<Connection>, Channel) {
        let connector = TransportConnector::new(
            Arc::new(broker.clone()),
            ConnectionParams {
                uri: "amqp://localhost".to_owned(),
                endpoint: "localhost:5672".to_owned(),
                connection_name: "test".to_owned(),
            },
            Backoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(1),
                jitter: false,
                max_attempts: Some(1),
                max_elapsed: None,
            },
        );
        let connection = connector.connect().await.unwrap().connection;
        let channel = ChannelManager::new(&connection, 16)
            .open_channel(&connection)
            .await
            .unwrap();
        (connection, channel)
    }

    #[tokio::test]
    async fn redeclaring_with_other_durability_conflicts() {
        let broker = MemoryBroker::new();
        let (connection, channel) = open(&broker).await;
        let mut registry = SubscriptionRegistry::new();

        registry
            .declare_queue(&connection, &channel, QueueDefinition::new("jobs"))
            .await
            .unwrap();
        let same = registry
            .declare_queue(&connection, &channel, QueueDefinition::new("jobs"))
            .await
            .unwrap();
        let err = registry
            .declare_queue(&connection, &channel, QueueDefinition::new("jobs").durable())
            .await
            .unwrap_err();

        assert_eq!(same.name(), "jobs");
        assert_eq!(err, AmqpError::QueueConflictError("jobs".to_owned()));
        assert_eq!(registry.queues().len(), 1);
        let declares = broker
            .events()
            .into_iter()
            .filter(|event| matches!(event, BrokerEvent::QueueDeclared { .. }))
            .count();
        assert_eq!(declares, 1);
    }

    #[tokio::test]
    async fn broker_side_conflict_is_reported() {
        let broker = MemoryBroker::new();
        broker.declare_existing("jobs", true);
        let (connection, channel) = open(&broker).await;
        let mut registry = SubscriptionRegistry::new();

        let err = registry
            .declare_queue(&connection, &channel, QueueDefinition::new("jobs"))
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::QueueConflictError("jobs".to_owned()));
        assert!(registry.queues().is_empty());
    }

    #[tokio::test]
    async fn keeps_subscribe_order_and_unsubscribes() {
        let broker = MemoryBroker::new();
        let (connection, channel) = open(&broker).await;
        let mut registry = SubscriptionRegistry::new();

        let jobs = registry
            .declare_queue(&connection, &channel, QueueDefinition::new("jobs"))
            .await
            .unwrap();
        let audit = registry
            .declare_queue(&connection, &channel, QueueDefinition::new("audit").durable())
            .await
            .unwrap();

        let first = registry
            .subscribe(&audit, Arc::new(MockConsumerHandler::new()), AckMode::Auto, 5)
            .unwrap();
        let second = registry
            .subscribe(&jobs, Arc::new(MockConsumerHandler::new()), AckMode::Manual, 1)
            .unwrap();
        let third = registry
            .subscribe(&jobs, Arc::new(MockConsumerHandler::new()), AckMode::Manual, 3)
            .unwrap();

        registry.unsubscribe(second).unwrap();
        assert_eq!(registry.unsubscribe(second).unwrap_err(), AmqpError::SubscriptionNotFound(second.0));

        let order: Vec<(SubscriptionId, &str, u16)> = registry
            .subscriptions()
            .map(|sub| (sub.id(), sub.queue(), sub.prefetch()))
            .collect();
        assert_eq!(order, vec![(first, "audit", 5), (third, "jobs", 3)]);
        assert!(registry.get(first).unwrap().consumer_tag().starts_with("audit-"));
    }

    #[test]
    fn refuses_undeclared_queue_and_zero_prefetch() {
        let mut registry = SubscriptionRegistry::new();
        let handle = QueueHandle {
            def: QueueDefinition::new("ghost"),
        };

        let err = registry
            .subscribe(&handle, Arc::new(MockConsumerHandler::new()), AckMode::Manual, 1)
            .unwrap_err();
        assert_eq!(err, AmqpError::BindingConsumerError("ghost".to_owned()));

        registry.queues.push(QueueDefinition::new("ghost"));
        let err = registry
            .subscribe(&handle, Arc::new(MockConsumerHandler::new()), AckMode::Manual, 0)
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConfigError(_)));
    }
}
