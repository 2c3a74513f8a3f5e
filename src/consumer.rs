// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! `RabbitMQConsumer` is the entry point of the crate. It owns the connection to the
//! broker, the subscription registry, the acknowledgment tracker and the dispatcher,
//! and keeps them consistent across failures:
//!
//! - a lost connection is re-established with backoff, then every queue is declared
//!   again in declaration order and every subscription re-established in subscribe
//!   order, with the same consumer tag, ack mode and prefetch;
//! - a lost channel only re-establishes the subscription that used it;
//! - fatal errors (a queue conflict, giving up on reconnecting) stop the consumer and
//!   are returned by [`RabbitMQConsumer::consume_blocking`].
//!
//! Each subscription consumes on its own channel, so prefetch and acknowledgment
//! scope never mix between subscriptions. Queue declarations use a separate control
//! channel.

use crate::{
    channel::{Channel, ChannelManager},
    config::{AckMode, ConsumerConfigs},
    connection::{spawn_reader, Connection, ConnectionState, LinkEvent},
    connector::{Established, TransportConnector},
    dispatcher::{DeliveryDispatcher, DispatcherSettings},
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::{QueueDefinition, QueueHandle},
    registry::{declare_on, Subscription, SubscriptionId, SubscriptionRegistry},
    tracker::AckTracker,
    transport::Connector,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Session {
    connection: Arc<Connection>,
    channels: ChannelManager,
    control: Option<Channel>,
    bindings: BTreeMap<SubscriptionId, Channel>,
}

#[derive(Default)]
struct ConsumerState {
    registry: SubscriptionRegistry,
    session: Option<Session>,
}

struct Inner {
    cfgs: ConsumerConfigs,
    connector: TransportConnector,
    tracker: Arc<AckTracker>,
    dispatcher: Arc<DeliveryDispatcher>,
    state: tokio::sync::Mutex<ConsumerState>,
    events: UnboundedSender<LinkEvent>,
    pending_events: Mutex<Option<UnboundedReceiver<LinkEvent>>>,
    shutdown: CancellationToken,
    outcome: watch::Sender<Option<Result<(), AmqpError>>>,
}

/// A reliable consumer of RabbitMQ queues.
pub struct RabbitMQConsumer {
    inner: Arc<Inner>,
}

fn not_connected() -> AmqpError {
    AmqpError::ConnectionError("consumer is not connected".to_owned())
}

impl RabbitMQConsumer {
    pub fn new(cfgs: ConsumerConfigs, connector: Arc<dyn Connector>) -> Result<Self, AmqpError> {
        cfgs.validate()?;

        let tracker = Arc::new(AckTracker::new());
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            DispatcherSettings::from_configs(&cfgs),
            tracker.clone(),
        ));
        let (events, pending) = mpsc::unbounded_channel();
        let (outcome, _) = watch::channel(None);

        Ok(RabbitMQConsumer {
            inner: Arc::new(Inner {
                connector: TransportConnector::from_configs(connector, &cfgs),
                cfgs,
                tracker,
                dispatcher,
                state: tokio::sync::Mutex::new(ConsumerState::default()),
                events,
                pending_events: Mutex::new(Some(pending)),
                shutdown: CancellationToken::new(),
                outcome,
            }),
        })
    }

    /// A consumer talking to a real broker through `lapin`.
    pub fn with_lapin(cfgs: ConsumerConfigs) -> Result<Self, AmqpError> {
        Self::new(cfgs, Arc::new(crate::amqp::LapinConnector::new()))
    }

    /// Connects to the broker and starts supervising the connection.
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AmqpError::ShutdownError);
        }

        let mut guard = self.inner.state.lock().await;
        if guard.session.is_some() {
            return Ok(());
        }

        let established = self.inner.connector.connect().await?;
        let session = self.inner.establish(established, &guard.registry).await?;
        guard.session = Some(session);
        drop(guard);

        let pending = match self.inner.pending_events.lock() {
            Ok(mut pending) => pending.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(events) = pending {
            tokio::spawn(supervise(self.inner.clone(), events));
        }

        Ok(())
    }

    /// Declares a queue and records it for replay after reconnects.
    pub async fn declare_queue(&self, def: QueueDefinition) -> Result<QueueHandle, AmqpError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let session = state.session.as_mut().ok_or_else(not_connected)?;

        let control = match session.control.clone() {
            Some(control) => control,
            None => {
                let control = session.channels.open_channel(&session.connection).await?;
                session.control = Some(control.clone());
                control
            }
        };

        match state
            .registry
            .declare_queue(&session.connection, &control, def)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // the broker closes the channel of a failed declaration
                if !matches!(err, AmqpError::ConnectionError(_)) {
                    if let Some(mut control) = session.control.take() {
                        session
                            .channels
                            .close_channel(&session.connection, &mut control)
                            .await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Starts consuming a declared queue. Deliveries reach `handler` in arrival order
    /// with at most `prefetch` of them unsettled at a time.
    pub async fn subscribe(
        &self,
        queue: &QueueHandle,
        handler: Arc<dyn ConsumerHandler>,
        ack_mode: AckMode,
        prefetch: u16,
    ) -> Result<SubscriptionId, AmqpError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        if state.session.is_none() {
            return Err(not_connected());
        }

        let id = state.registry.subscribe(queue, handler, ack_mode, prefetch)?;
        let (Some(session), Some(subscription)) = (state.session.as_mut(), state.registry.get(id).cloned())
        else {
            return Err(AmqpError::InternalError);
        };

        if let Err(err) = self.inner.bind(session, &subscription).await {
            state.registry.unsubscribe(id)?;
            self.inner.dispatcher.unsubscribe(id);
            return Err(err);
        }

        info!(
            subscription = %id,
            queue = queue.name(),
            ?ack_mode,
            prefetch,
            "subscribed"
        );
        Ok(id)
    }

    /// Declares the configured queue and subscribes `handler` to it with the
    /// configured ack mode and prefetch.
    pub async fn subscribe_configured(&self, handler: Arc<dyn ConsumerHandler>) -> Result<SubscriptionId, AmqpError> {
        let cfgs = &self.inner.cfgs;
        let queue = self
            .declare_queue(QueueDefinition::new(&cfgs.queue_name).with_durability(cfgs.durable))
            .await?;

        self.subscribe(&queue, handler, cfgs.ack_mode, cfgs.prefetch).await
    }

    /// Stops a subscription. Handlers already running finish and settle normally;
    /// deliveries not yet dispatched are returned to the broker.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), AmqpError> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let subscription = state.registry.unsubscribe(id)?;
        let finished = self.inner.dispatcher.unsubscribe(id);

        let channel = state
            .session
            .as_mut()
            .and_then(|session| session.bindings.remove(&id));
        if let (Some(session), Some(channel)) = (state.session.as_ref(), channel.as_ref()) {
            if let Err(err) = session
                .connection
                .writer()
                .cancel(channel.id(), subscription.consumer_tag())
                .await
            {
                warn!(error = err.to_string(), subscription = %id, "failure to cancel consumer");
            }
        }
        drop(guard);

        if let Some(channel) = channel {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Some(finished) = finished {
                    if let Err(err) = finished.await {
                        error!(error = err.to_string(), "dispatcher worker failed");
                    }
                }
                inner.release_channel(channel).await;
            });
        }

        info!(subscription = %id, queue = subscription.queue(), "unsubscribed");
        Ok(())
    }

    /// Runs until the consumer stops. Returns `Ok` after [`Self::shutdown`] and the
    /// fatal error otherwise.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut outcome = self.inner.outcome.subscribe();

        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                return Err(AmqpError::InternalError);
            }
        }
    }

    /// Stops consuming: cancels every consumer, waits for running handlers up to the
    /// configured timeout, requeues whatever is still unacknowledged and closes the
    /// connection.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }

        info!("shutting down consumer");
        self.inner.shutdown.cancel();

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        self.inner.connector.set_state(ConnectionState::Closing);

        if let Some(session) = state.session.as_ref() {
            for (id, channel) in &session.bindings {
                let Some(subscription) = state.registry.get(*id) else {
                    continue;
                };
                if let Err(err) = session
                    .connection
                    .writer()
                    .cancel(channel.id(), subscription.consumer_tag())
                    .await
                {
                    warn!(error = err.to_string(), subscription = %id, "failure to cancel consumer");
                }
            }
        }

        self.inner
            .dispatcher
            .shutdown(self.inner.cfgs.shutdown_timeout())
            .await;
        let requeued = self.inner.tracker.nack_outstanding(true).await;

        if let Some(session) = state.session.take() {
            session.connection.close().await;
            self.inner
                .tracker
                .close_generation(session.connection.generation());
        }
        self.inner.connector.set_state(ConnectionState::Disconnected);
        self.inner.finish(Ok(()));

        info!(requeued, "consumer stopped");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connector.state()
    }

    /// Receives every state transition of the broker link.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connector.subscribe_state()
    }

    /// Active subscriptions in subscribe order.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .subscriptions()
            .cloned()
            .collect()
    }

    pub fn tracker(&self) -> Arc<AckTracker> {
        self.inner.tracker.clone()
    }

    pub fn configs(&self) -> &ConsumerConfigs {
        &self.inner.cfgs
    }
}

impl Drop for RabbitMQConsumer {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Brings a fresh connection to the state recorded in `registry`.
    async fn establish(
        &self,
        established: Established,
        registry: &SubscriptionRegistry,
    ) -> Result<Session, AmqpError> {
        let Established { connection, frames } = established;
        spawn_reader(
            connection.generation(),
            frames,
            self.dispatcher.clone(),
            self.events.clone(),
        );

        let mut session = Session {
            channels: ChannelManager::new(&connection, self.cfgs.channel_max),
            connection: connection.clone(),
            control: None,
            bindings: BTreeMap::new(),
        };

        match self.replay(&mut session, registry).await {
            Ok(()) => Ok(session),
            Err(err) => {
                connection.close().await;
                self.discard(&connection);
                Err(err)
            }
        }
    }

    async fn replay(&self, session: &mut Session, registry: &SubscriptionRegistry) -> Result<(), AmqpError> {
        let control = session.channels.open_channel(&session.connection).await?;
        for def in registry.queues() {
            declare_on(&session.connection, &control, def).await?;
        }
        session.control = Some(control);

        for subscription in registry.subscriptions() {
            self.bind(session, subscription).await?;
            debug!(
                subscription = %subscription.id(),
                queue = subscription.queue(),
                "subscription re-established"
            );
        }

        Ok(())
    }

    /// Opens a channel for `subscription` and starts consuming on it.
    async fn bind(&self, session: &mut Session, subscription: &Subscription) -> Result<(), AmqpError> {
        let connection = session.connection.clone();
        let generation = connection.generation();
        let mut channel = session.channels.open_channel(&connection).await?;

        if subscription.ack_mode() == AckMode::Manual {
            if let Err(err) = session
                .channels
                .set_prefetch(&connection, &mut channel, subscription.prefetch())
                .await
            {
                session.channels.close_channel(&connection, &mut channel).await;
                return Err(err);
            }
            self.tracker
                .open_channel(channel.reference(), connection.writer().clone());
        }
        self.dispatcher
            .add_route(generation, channel.reference(), subscription);

        let consumed = connection
            .writer()
            .consume(
                channel.id(),
                subscription.queue(),
                subscription.consumer_tag(),
                subscription.ack_mode() == AckMode::Auto,
            )
            .await;

        if let Err(err) = consumed {
            error!(error = err.to_string(), queue = subscription.queue(), "failure to declare consumer");
            self.dispatcher.remove_channel_routes(generation, channel.id());
            self.tracker.close_channel(channel.reference());
            session.channels.close_channel(&connection, &mut channel).await;

            return Err(match err {
                AmqpError::ConnectionError(_) | AmqpError::ChannelError(..) => err,
                _ => AmqpError::BindingConsumerError(subscription.queue().to_owned()),
            });
        }

        session.bindings.insert(subscription.id(), channel);
        Ok(())
    }

    /// Forgets everything tied to a dead connection.
    fn discard(&self, connection: &Connection) {
        connection.set_state(ConnectionState::Failed);
        self.tracker.close_generation(connection.generation());
        self.dispatcher
            .abandon_generation(connection.generation(), self.cfgs.in_flight_policy);
    }

    async fn release_channel(&self, mut channel: Channel) {
        self.tracker.close_channel(channel.reference());

        let mut guard = self.state.lock().await;
        if let Some(session) = guard.session.as_mut() {
            if session.connection.generation() == channel.generation {
                let connection = session.connection.clone();
                session.channels.close_channel(&connection, &mut channel).await;
            }
        }
    }

    async fn recover_connection(&self, generation: u64, reason: &str) -> Result<(), AmqpError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let current = state
            .session
            .as_ref()
            .map(|session| session.connection.generation());
        if current != Some(generation) || self.shutdown.is_cancelled() {
            debug!(generation, "ignoring loss of a previous connection");
            return Ok(());
        }

        warn!(generation, reason, "connection lost, reconnecting");
        if let Some(session) = state.session.take() {
            self.discard(&session.connection);
        }

        let started = Instant::now();
        let mut failures = 0;
        loop {
            let established = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                established = self.connector.connect() => established?,
            };

            match self.establish(established, &state.registry).await {
                Ok(session) => {
                    info!(
                        generation = session.connection.generation(),
                        queues = state.registry.queues().len(),
                        subscriptions = state.registry.len(),
                        "consumer recovered"
                    );
                    state.session = Some(session);
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    error!(error = err.to_string(), "failure to restore consumer state");
                    return Err(err);
                }
                // a link lost during replay is retried like a refused connect
                Err(err) => {
                    failures += 1;
                    let backoff = self.connector.backoff();
                    if backoff.exhausted(failures, started) {
                        error!(error = err.to_string(), failures, "giving up restoring consumer state");
                        self.connector.set_state(ConnectionState::Failed);
                        return Err(AmqpError::ReconnectExhausted(format!(
                            "{failures} failed replays, last error: {err}"
                        )));
                    }

                    let delay = backoff.delay(failures);
                    warn!(
                        error = err.to_string(),
                        delay_ms = delay.as_millis() as u64,
                        "failure to restore consumer state, reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn recover_channel(
        &self,
        generation: u64,
        channel_id: u16,
        reason: &str,
        still_open: bool,
    ) -> Result<(), AmqpError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(session) = state.session.as_mut() else {
            return Ok(());
        };
        if session.connection.generation() != generation || self.shutdown.is_cancelled() {
            return Ok(());
        }

        if session
            .control
            .as_ref()
            .is_some_and(|control| control.id() == channel_id)
        {
            debug!(channel_id, reason, "control channel closed");
            session.control = None;
            session.channels.channel_lost(channel_id);
            return Ok(());
        }

        let Some(id) = session
            .bindings
            .iter()
            .find(|(_, channel)| channel.id() == channel_id)
            .map(|(id, _)| *id)
        else {
            return Ok(());
        };
        let Some(mut channel) = session.bindings.remove(&id) else {
            return Ok(());
        };

        warn!(subscription = %id, channel_id, reason, "subscription lost its channel, re-establishing");
        self.dispatcher.remove_channel_routes(generation, channel_id);
        self.tracker.close_channel(channel.reference());
        if still_open {
            let connection = session.connection.clone();
            session.channels.close_channel(&connection, &mut channel).await;
        } else {
            session.channels.channel_lost(channel_id);
        }

        let Some(subscription) = state.registry.get(id).cloned() else {
            return Ok(());
        };

        let backoff = self.connector.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.bind(session, &subscription).await {
                Ok(()) => {
                    info!(subscription = %id, queue = subscription.queue(), "subscription re-established");
                    return Ok(());
                }
                // the connection is gone too; its recovery replays this subscription
                Err(AmqpError::ConnectionError(_)) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if backoff.max_attempts.is_some_and(|max| attempt >= max) => {
                    error!(error = err.to_string(), subscription = %id, attempt, "giving up re-establishing subscription");
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.delay(attempt);
                    warn!(error = err.to_string(), subscription = %id, attempt, "failure to re-establish subscription");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn finish(&self, result: Result<(), AmqpError>) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(result);
            true
        });
    }
}

/// Reacts to link failures until shutdown or a fatal error.
async fn supervise(inner: Arc<Inner>, mut events: UnboundedReceiver<LinkEvent>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            return;
        };

        let result = match event {
            LinkEvent::ConnectionLost { generation, reason } => {
                inner.recover_connection(generation, &reason).await
            }
            LinkEvent::ChannelLost {
                generation,
                channel_id,
                reason,
            } => inner.recover_channel(generation, channel_id, &reason, false).await,
            LinkEvent::ConsumerCancelled {
                generation,
                channel_id,
                consumer_tag,
            } => {
                let reason = format!("consumer {consumer_tag} cancelled by broker");
                inner.recover_channel(generation, channel_id, &reason, true).await
            }
        };

        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                error!(error = err.to_string(), "consumer stopped on fatal error");
                inner.connector.set_state(ConnectionState::Failed);
                inner.finish(Err(err));
                return;
            }
            Err(err) => warn!(error = err.to_string(), "failure while recovering"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::MockConsumerHandler, testing::MemoryBroker};

    fn configs() -> ConsumerConfigs {
        ConsumerConfigs {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            backoff_jitter: false,
            max_reconnect_attempts: 3,
            shutdown_timeout_ms: 50,
            ..ConsumerConfigs::default()
        }
    }

    #[test]
    fn refuses_invalid_configuration() {
        let cfgs = ConsumerConfigs {
            prefetch: 0,
            ..configs()
        };

        let err = RabbitMQConsumer::new(cfgs, Arc::new(MemoryBroker::new())).err().unwrap();
        assert!(matches!(err, AmqpError::ConfigError(_)));
    }

    #[tokio::test]
    async fn declaring_before_start_fails() {
        let consumer = RabbitMQConsumer::new(configs(), Arc::new(MemoryBroker::new())).unwrap();

        let err = consumer
            .declare_queue(QueueDefinition::new("jobs"))
            .await
            .unwrap_err();
        assert_eq!(err, not_connected());
    }

    #[tokio::test]
    async fn start_fails_when_the_broker_stays_down() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(100);
        let consumer = RabbitMQConsumer::new(configs(), Arc::new(broker.clone())).unwrap();

        let err = consumer.start().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(consumer.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_trace() {
        let broker = MemoryBroker::new();
        let consumer = RabbitMQConsumer::new(configs(), Arc::new(broker.clone())).unwrap();
        consumer.start().await.unwrap();
        let jobs = consumer
            .declare_queue(QueueDefinition::new("jobs"))
            .await
            .unwrap();

        let err = consumer
            .subscribe(&jobs, Arc::new(MockConsumerHandler::new()), AckMode::Manual, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigError(_)));
        assert!(consumer.subscriptions().await.is_empty());
        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_final() {
        let broker = MemoryBroker::new();
        let consumer = RabbitMQConsumer::new(configs(), Arc::new(broker.clone())).unwrap();
        consumer.start().await.unwrap();

        consumer.shutdown().await.unwrap();
        consumer.shutdown().await.unwrap();

        assert_eq!(consumer.consume_blocking().await, Ok(()));
        assert_eq!(consumer.start().await, Err(AmqpError::ShutdownError));
        assert_eq!(consumer.state(), ConnectionState::Disconnected);
        assert!(!broker.is_connected());
    }
}
