// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Routes inbound deliveries to their subscription and runs the handlers.
//!
//! Each subscription has one worker task that pulls its deliveries in arrival order.
//! Before a delivery is dispatched the worker takes one of the subscription's
//! `prefetch` slots, so no more than `prefetch` deliveries are ever in a handler at
//! once; when the slots are gone the worker stops pulling until a handler settles.
//! Handlers of all subscriptions share a bounded worker pool.
//!
//! Outcomes are settled according to the ack mode: under manual-ack a success is
//! acked, a failure nacked (requeued) or rejected; under auto-ack the broker already
//! considers the message consumed, so failures are only logged. A panicking handler
//! is caught and treated as a failure.

use crate::{
    channel::ChannelRef,
    config::{AckMode, ConsumerConfigs, InFlightPolicy},
    errors::AmqpError,
    handler::{ConsumerMessage, DeliveryMetadata, HandlerError},
    otel,
    registry::{Subscription, SubscriptionId},
    tracker::AckTracker,
    transport::RawDelivery,
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    panic::AssertUnwindSafe,
    task::Poll,
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, OwnedSemaphorePermit, Semaphore,
    },
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

/// Dispatcher knobs taken from the consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub worker_pool_size: usize,
    pub handler_timeout: Option<Duration>,
    pub requeue_on_failure: bool,
}

impl DispatcherSettings {
    pub fn from_configs(cfg: &ConsumerConfigs) -> Self {
        DispatcherSettings {
            worker_pool_size: cfg.worker_pool_size,
            handler_timeout: cfg.handler_timeout(),
            requeue_on_failure: cfg.requeue_on_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    generation: u64,
    channel_id: u16,
    consumer_tag: String,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    subscription: SubscriptionId,
    channel: ChannelRef,
}

struct InboundDelivery {
    delivery: RawDelivery,
    channel: ChannelRef,
    cancel: CancellationToken,
}

struct Worker {
    tx: UnboundedSender<InboundDelivery>,
    ack_mode: AckMode,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

enum Outcome {
    Finished(Result<(), HandlerError>),
    Cancelled,
}

/// State shared by the dispatcher, its workers and their handler tasks.
#[derive(Clone)]
struct Shared {
    settings: Arc<DispatcherSettings>,
    tracker: Arc<AckTracker>,
    pool: Arc<Semaphore>,
    handlers: TaskTracker,
}

pub struct DeliveryDispatcher {
    shared: Shared,
    routes: Mutex<HashMap<RouteKey, Route>>,
    workers: Mutex<HashMap<SubscriptionId, Worker>>,
    generations: Mutex<HashMap<u64, CancellationToken>>,
    cancel: CancellationToken,
    accepting: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DeliveryDispatcher {
    pub fn new(settings: DispatcherSettings, tracker: Arc<AckTracker>) -> Self {
        let pool = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));

        DeliveryDispatcher {
            shared: Shared {
                settings: Arc::new(settings),
                tracker,
                pool,
                handlers: TaskTracker::new(),
            },
            routes: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Points deliveries of `subscription` on `channel` to its worker, spawning the
    /// worker on first use. Workers outlive reconnects.
    pub fn add_route(&self, generation: u64, channel: ChannelRef, subscription: &Subscription) {
        self.ensure_worker(subscription);
        self.generation_token(generation);

        locked(&self.routes).insert(
            RouteKey {
                generation,
                channel_id: channel.id,
                consumer_tag: subscription.consumer_tag.clone(),
            },
            Route {
                subscription: subscription.id,
                channel,
            },
        );
    }

    /// Drops the routes of one channel; its worker stays.
    pub fn remove_channel_routes(&self, generation: u64, channel_id: u16) {
        locked(&self.routes).retain(|key, _| !(key.generation == generation && key.channel_id == channel_id));
    }

    /// Forgets every route of a lost connection. With [`InFlightPolicy::Cancel`] the
    /// handlers still running for it are cancelled.
    pub fn abandon_generation(&self, generation: u64, policy: InFlightPolicy) {
        locked(&self.routes).retain(|key, _| key.generation != generation);

        if let Some(token) = locked(&self.generations).remove(&generation) {
            if policy == InFlightPolicy::Cancel {
                debug!(generation, "cancelling handlers of a lost connection");
                token.cancel();
            }
        }
    }

    /// Stops new deliveries to a subscription. Handlers already running finish; the
    /// returned handle completes once they have.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> Option<JoinHandle<()>> {
        locked(&self.routes).retain(|_, route| route.subscription != subscription);

        let worker = locked(&self.workers).remove(&subscription)?;
        worker.stop.cancel();
        Some(worker.handle)
    }

    pub fn has_worker(&self, subscription: SubscriptionId) -> bool {
        locked(&self.workers).contains_key(&subscription)
    }

    /// Called by the reader task for each inbound delivery. Never blocks.
    pub fn route(&self, generation: u64, delivery: RawDelivery) {
        let key = RouteKey {
            generation,
            channel_id: delivery.channel_id,
            consumer_tag: delivery.consumer_tag.clone(),
        };

        let Some(route) = locked(&self.routes).get(&key).copied() else {
            warn!(
                generation,
                channel_id = delivery.channel_id,
                consumer_tag = delivery.consumer_tag,
                delivery_tag = delivery.delivery_tag,
                "removing message - reason: no subscription for delivery"
            );
            return;
        };

        let workers = locked(&self.workers);
        let Some(worker) = workers.get(&route.subscription) else {
            warn!(subscription = %route.subscription, "removing message - reason: subscription has no worker");
            return;
        };

        if worker.ack_mode == AckMode::Manual {
            if let Err(err) = self
                .shared
                .tracker
                .register(route.channel, delivery.delivery_tag, route.subscription)
            {
                error!(error = err.to_string(), delivery_tag = delivery.delivery_tag, "failure to track delivery");
                return;
            }
        }

        let inbound = InboundDelivery {
            delivery,
            channel: route.channel,
            cancel: self.generation_token(generation),
        };

        if worker.tx.send(inbound).is_err() {
            warn!(subscription = %route.subscription, "worker stopped, delivery left for the broker to requeue");
        }
    }

    /// Stops dispatching, waits up to `timeout` for running handlers, then cancels
    /// the rest. Cancelled manual-ack deliveries are nacked with requeue.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }

        locked(&self.routes).clear();
        let workers: Vec<Worker> = locked(&self.workers).drain().map(|(_, worker)| worker).collect();
        for worker in &workers {
            worker.stop.cancel();
        }

        self.shared.handlers.close();
        if tokio::time::timeout(timeout, self.shared.handlers.wait()).await.is_err() {
            warn!(
                running = self.shared.handlers.len(),
                "handlers still running after shutdown timeout, cancelling"
            );
            self.cancel.cancel();
            self.shared.handlers.wait().await;
        }

        for worker in workers {
            if let Err(err) = worker.handle.await {
                error!(error = err.to_string(), "dispatcher worker failed");
            }
        }
    }

    fn generation_token(&self, generation: u64) -> CancellationToken {
        locked(&self.generations)
            .entry(generation)
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    fn ensure_worker(&self, subscription: &Subscription) {
        let mut workers = locked(&self.workers);
        if workers.contains_key(&subscription.id) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            self.shared.clone(),
            subscription.clone(),
            rx,
            stop.clone(),
        ));

        workers.insert(
            subscription.id,
            Worker {
                tx,
                ack_mode: subscription.ack_mode,
                stop,
                handle,
            },
        );
    }
}

async fn run_worker(
    shared: Shared,
    subscription: Subscription,
    mut rx: UnboundedReceiver<InboundDelivery>,
    stop: CancellationToken,
) {
    let prefetch = Arc::new(Semaphore::new(subscription.prefetch.max(1) as usize));
    let local = TaskTracker::new();

    loop {
        let inbound = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            inbound = rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        // backpressure: stop pulling until one of the prefetch slots is free
        let slot = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                release(&shared, &subscription, inbound).await;
                break;
            }
            slot = prefetch.clone().acquire_owned() => slot,
        };
        let worker_slot = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                release(&shared, &subscription, inbound).await;
                break;
            }
            slot = shared.pool.clone().acquire_owned() => slot,
        };
        let (Ok(slot), Ok(worker_slot)) = (slot, worker_slot) else {
            error!(subscription = %subscription.id, "dispatcher semaphore closed");
            break;
        };

        if subscription.ack_mode == AckMode::Manual
            && shared
                .tracker
                .state(inbound.channel, inbound.delivery.delivery_tag)
                .is_none()
        {
            debug!(
                delivery_tag = inbound.delivery.delivery_tag,
                "skipping delivery of a lost channel, the broker redelivers it"
            );
            continue;
        }

        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(shared.handlers.track_future(local.track_future(handle_delivery(
            shared.clone(),
            subscription.clone(),
            inbound,
            started_tx,
            (slot, worker_slot),
        ))));

        // handler start order follows arrival order
        let _ = started_rx.await;
    }

    rx.close();
    while let Ok(inbound) = rx.try_recv() {
        release(&shared, &subscription, inbound).await;
    }

    local.close();
    local.wait().await;
    debug!(subscription = %subscription.id, queue = subscription.queue(), "dispatcher worker stopped");
}

/// Gives back a delivery that was never dispatched.
async fn release(shared: &Shared, subscription: &Subscription, inbound: InboundDelivery) {
    if subscription.ack_mode != AckMode::Manual {
        warn!(
            delivery_tag = inbound.delivery.delivery_tag,
            queue = subscription.queue(),
            "auto-ack delivery dropped on unsubscribe"
        );
        return;
    }

    if let Err(err) = shared
        .tracker
        .nack(inbound.channel, inbound.delivery.delivery_tag, true)
        .await
    {
        debug!(error = err.to_string(), delivery_tag = inbound.delivery.delivery_tag, "failure to requeue undispatched msg");
    }
}

async fn handle_delivery(
    shared: Shared,
    subscription: Subscription,
    inbound: InboundDelivery,
    started: oneshot::Sender<()>,
    _slots: (OwnedSemaphorePermit, OwnedSemaphorePermit),
) {
    let InboundDelivery {
        delivery,
        channel,
        cancel,
    } = inbound;
    let delivery_tag = delivery.delivery_tag;

    let msg = ConsumerMessage {
        msg_type: delivery.kind.clone().unwrap_or_default(),
        data: delivery.payload,
        metadata: DeliveryMetadata {
            delivery_tag,
            redelivered: delivery.redelivered,
            queue: subscription.queue.name.clone(),
            consumer_tag: delivery.consumer_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            headers: delivery.headers,
        },
    };

    let span_name = if msg.msg_type.is_empty() {
        subscription.queue.name.as_str()
    } else {
        msg.msg_type.as_str()
    };
    let (ctx, mut span) = otel::new_span(&msg.metadata.headers, &global::tracer("amqp consumer"), span_name);

    debug!(
        queue = subscription.queue(),
        delivery_tag,
        redelivered = msg.metadata.redelivered,
        "received message"
    );

    let mut exec = Box::pin(
        AssertUnwindSafe(async { subscription.handler.exec(&ctx, &msg).await })
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|panic| {
                    let reason = panic_message(&*panic);
                    error!(delivery_tag, queue = subscription.queue(), reason = %reason, "handler panicked");
                    Err(HandlerError::Panicked(reason))
                })
            }),
    );
    let first = futures_util::poll!(&mut exec);
    let _ = started.send(());

    let outcome = match first {
        Poll::Ready(result) => Outcome::Finished(result),
        Poll::Pending => {
            let finished = async {
                match shared.settings.handler_timeout {
                    Some(limit) => tokio::time::timeout(limit, exec)
                        .await
                        .unwrap_or(Err(HandlerError::Timeout(limit.as_millis() as u64))),
                    None => exec.await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = finished => Outcome::Finished(result),
            }
        }
    };

    match &outcome {
        Outcome::Finished(Ok(())) => span.set_status(Status::Ok),
        Outcome::Finished(Err(err)) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        Outcome::Cancelled => span.set_status(Status::Error {
            description: Cow::from("handler cancelled"),
        }),
    }

    settle(&shared, &subscription, channel, delivery_tag, outcome).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        return (*reason).to_owned();
    }
    match panic.downcast_ref::<String>() {
        Some(reason) => reason.clone(),
        None => "non-string panic payload".to_owned(),
    }
}

async fn settle(
    shared: &Shared,
    subscription: &Subscription,
    channel: ChannelRef,
    delivery_tag: u64,
    outcome: Outcome,
) {
    let result = match (subscription.ack_mode, outcome) {
        (AckMode::Manual, Outcome::Finished(Ok(()))) => {
            debug!(delivery_tag, "message successfully processed");
            shared.tracker.ack(channel, delivery_tag).await
        }
        (AckMode::Manual, Outcome::Finished(Err(HandlerError::Rejected(reason)))) => {
            warn!(delivery_tag, reason, "message rejected by handler");
            shared.tracker.reject(channel, delivery_tag).await
        }
        (AckMode::Manual, Outcome::Finished(Err(err))) => {
            warn!(
                error = err.to_string(),
                delivery_tag,
                requeue = shared.settings.requeue_on_failure,
                "error whiling handling msg"
            );
            shared
                .tracker
                .nack(channel, delivery_tag, shared.settings.requeue_on_failure)
                .await
        }
        (AckMode::Manual, Outcome::Cancelled) => {
            warn!(delivery_tag, "handler cancelled, requeuing msg");
            shared.tracker.nack(channel, delivery_tag, true).await
        }
        (AckMode::Auto, Outcome::Finished(Ok(()))) => {
            debug!(delivery_tag, "message successfully processed");
            Ok(())
        }
        (AckMode::Auto, Outcome::Finished(Err(err))) => {
            warn!(
                error = err.to_string(),
                delivery_tag,
                queue = subscription.queue(),
                "error whiling handling auto-ack msg, message is lost"
            );
            Ok(())
        }
        (AckMode::Auto, Outcome::Cancelled) => {
            warn!(delivery_tag, "handler of an auto-ack msg cancelled");
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(AmqpError::ChannelError(channel_id, reason)) => {
            debug!(channel_id, delivery_tag, reason = %reason, "delivery belongs to a closed channel, broker redelivers it");
        }
        Err(err) => warn!(error = err.to_string(), delivery_tag, "failure to settle msg"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AckMode,
        connection::{spawn_reader, Writer},
        handler::{ConsumerHandler, MockConsumerHandler},
        queue::QueueDefinition,
        testing::MemoryBroker,
    };
    use async_trait::async_trait;
    use opentelemetry::Context;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Harness {
        broker: MemoryBroker,
        dispatcher: Arc<DeliveryDispatcher>,
        tracker: Arc<AckTracker>,
        channel: ChannelRef,
    }

    fn subscription(handler: Arc<dyn ConsumerHandler>, ack_mode: AckMode, prefetch: u16) -> Subscription {
        Subscription {
            id: SubscriptionId(1),
            queue: QueueDefinition::new("jobs"),
            handler,
            ack_mode,
            prefetch,
            consumer_tag: "jobs-ctag".to_owned(),
        }
    }

    async fn harness(sub: &Subscription, settings: DispatcherSettings) -> Harness {
        let broker = MemoryBroker::new();
        let link = broker.connect_direct();
        let (writer, _) = Writer::spawn(1, link.connection.clone());
        let tracker = Arc::new(AckTracker::new());
        let dispatcher = Arc::new(DeliveryDispatcher::new(settings, tracker.clone()));
        let (events, _) = mpsc::unbounded_channel();
        spawn_reader(1, link.frames, dispatcher.clone(), events);

        let channel = ChannelRef { id: 1, serial: 1 };
        writer.open_channel(1).await.unwrap();
        writer.declare_queue(1, &sub.queue).await.unwrap();
        tracker.open_channel(channel, writer.clone());
        dispatcher.add_route(1, channel, sub);
        writer
            .consume(1, "jobs", &sub.consumer_tag, sub.ack_mode == AckMode::Auto)
            .await
            .unwrap();

        Harness {
            broker,
            dispatcher,
            tracker,
            channel,
        }
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            worker_pool_size: 16,
            handler_timeout: None,
            requeue_on_failure: true,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    /// Blocks every handler until released; records concurrency.
    struct Gate {
        release: Notify,
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<u64>>,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Gate {
                release: Notify::new(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }

        fn started(&self) -> Vec<u64> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConsumerHandler for Gate {
        async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.started.lock().unwrap().push(msg.metadata.delivery_tag);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_in_arrival_order() {
        let mut handler = MockConsumerHandler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        handler.expect_exec().times(100).returning(move |_, msg| {
            record.lock().unwrap().push(msg.metadata.delivery_tag);
            Ok(())
        });
        let sub = subscription(Arc::new(handler), AckMode::Manual, 10);
        let h = harness(&sub, settings()).await;

        for i in 0..100 {
            h.broker.publish("jobs", format!("m{i}").as_bytes());
        }

        eventually(|| h.broker.acks().len() == 100).await;
        assert_eq!(*seen.lock().unwrap(), (1..=100).collect::<Vec<u64>>());
        assert!(h.broker.violations().is_empty());
    }

    #[tokio::test]
    async fn pauses_at_prefetch_limit() {
        let gate = Gate::new();
        let sub = subscription(gate.clone(), AckMode::Manual, 3);
        let h = harness(&sub, settings()).await;

        for i in 0..4 {
            h.broker.publish("jobs", format!("m{i}").as_bytes());
        }

        eventually(|| gate.started().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(gate.started(), vec![1, 2, 3]);
        assert_eq!(h.tracker.outstanding(h.channel), 4);

        gate.release.notify_one();
        eventually(|| gate.started().len() == 4).await;
        assert_eq!(gate.peak.load(Ordering::SeqCst), 3);

        for _ in 0..3 {
            gate.release.notify_one();
        }
        eventually(|| h.broker.acks().len() == 4).await;
        assert_eq!(gate.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_nacks_only_the_failed_delivery() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(|_, msg| {
            if msg.data == b"bad" {
                Err(HandlerError::transient("boom"))
            } else {
                Ok(())
            }
        });
        let sub = subscription(Arc::new(handler), AckMode::Manual, 3);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"good");
        h.broker.publish("jobs", b"bad");
        h.broker.publish("jobs", b"good");

        eventually(|| h.tracker.outstanding(h.channel) == 0 && h.broker.settlements() == 3).await;
        assert_eq!(h.broker.acks(), vec![(1, false), (3, false)]);
        assert_eq!(h.broker.nacks(), vec![(2, true)]);
    }

    #[tokio::test]
    async fn rejected_messages_are_not_requeued() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(HandlerError::rejected("poison")));
        let sub = subscription(Arc::new(handler), AckMode::Manual, 1);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"poison");

        eventually(|| h.broker.settlements() == 1).await;
        assert_eq!(h.broker.rejects(), vec![(1, false)]);
    }

    #[tokio::test]
    async fn auto_ack_failures_send_nothing() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(2)
            .returning(|_, _| Err(HandlerError::transient("boom")));
        let sub = subscription(Arc::new(handler), AckMode::Auto, 2);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"a");
        h.broker.publish("jobs", b"b");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.broker.settlements(), 0);
        assert_eq!(h.tracker.total_outstanding(), 0);
    }

    /// Panics on payload `A`, succeeds otherwise.
    struct Panicky;

    #[async_trait]
    impl ConsumerHandler for Panicky {
        async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
            if msg.data == b"A" {
                panic!("cannot handle {}", msg.text());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_requeued_and_the_subscription_continues() {
        let sub = subscription(Arc::new(Panicky), AckMode::Manual, 1);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"A");
        h.broker.publish("jobs", b"B");

        eventually(|| h.broker.settlements() == 2).await;
        assert_eq!(h.broker.nacks(), vec![(1, true)]);
        assert_eq!(h.broker.acks(), vec![(2, false)]);
        assert_eq!(h.tracker.outstanding(h.channel), 0);
        assert_eq!(h.broker.unacked(), 0);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7u8);

        assert_eq!(panic_message(&*text), "boom");
        assert_eq!(panic_message(&*owned), "bang");
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }

    #[tokio::test]
    async fn slow_handlers_time_out_and_requeue() {
        let gate = Gate::new();
        let sub = subscription(gate.clone(), AckMode::Manual, 1);
        let h = harness(
            &sub,
            DispatcherSettings {
                handler_timeout: Some(Duration::from_millis(20)),
                ..settings()
            },
        )
        .await;

        h.broker.publish("jobs", b"slow");

        eventually(|| h.broker.settlements() == 1).await;
        assert_eq!(h.broker.nacks(), vec![(1, true)]);
    }

    #[tokio::test]
    async fn unknown_route_is_dropped() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().never();
        let sub = subscription(Arc::new(handler), AckMode::Manual, 1);
        let h = harness(&sub, settings()).await;

        h.dispatcher.route(
            1,
            RawDelivery {
                channel_id: 9,
                consumer_tag: "stranger".to_owned(),
                delivery_tag: 1,
                ..RawDelivery::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.tracker.total_outstanding(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_lets_running_handlers_finish() {
        let gate = Gate::new();
        let sub = subscription(gate.clone(), AckMode::Manual, 1);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"first");
        h.broker.publish("jobs", b"second");
        eventually(|| gate.started().len() == 1).await;

        let done = h.dispatcher.unsubscribe(sub.id).unwrap();
        gate.release.notify_one();
        done.await.unwrap();

        assert_eq!(gate.started(), vec![1]);
        assert_eq!(h.broker.acks(), vec![(1, false)]);
        assert_eq!(h.broker.nacks(), vec![(2, true)]);
        assert!(!h.dispatcher.has_worker(sub.id));
    }

    #[tokio::test]
    async fn shutdown_cancels_stuck_handlers_and_requeues() {
        let gate = Gate::new();
        let sub = subscription(gate.clone(), AckMode::Manual, 2);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"a");
        h.broker.publish("jobs", b"b");
        eventually(|| gate.started().len() == 2).await;

        h.dispatcher.shutdown(Duration::from_millis(20)).await;

        let mut nacks = h.broker.nacks();
        nacks.sort();
        assert_eq!(nacks, vec![(1, true), (2, true)]);
        assert_eq!(h.tracker.total_outstanding(), 0);
    }

    #[tokio::test]
    async fn cancel_policy_stops_handlers_of_lost_connection() {
        let gate = Gate::new();
        let sub = subscription(gate.clone(), AckMode::Manual, 1);
        let h = harness(&sub, settings()).await;

        h.broker.publish("jobs", b"a");
        eventually(|| gate.started().len() == 1).await;

        h.tracker.close_generation(1);
        h.dispatcher.abandon_generation(1, InFlightPolicy::Cancel);

        eventually(|| h.dispatcher.shared.handlers.is_empty()).await;
        assert_eq!(h.broker.settlements(), 0);
        assert_eq!(gate.started(), vec![1]);
    }
}
