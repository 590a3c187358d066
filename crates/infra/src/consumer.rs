//! Consumer runtime: one worker task per `(topic, partition)`.
//!
//! - Header parsers turn transport headers into the handler's `OperationContext`
//! - Every registered handler runs in its own task with its own emit buffer
//! - A handler's buffer is produced only when that handler succeeded
//! - The delivery is committed when no handler asked for a retry
//!
//! Retryable (transient) handler errors and panics leave the delivery for
//! redelivery. Any other handler error is logged and the delivery committed:
//! redelivering a message that can never succeed would only stall the partition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use atlas_core::{Cancellation, OperationContext};
use atlas_events::{
    BusError, Delivery, Handler, HandlerOutcome, HeaderParser, MessageBuffer, MessageBus,
    RawEnvelope, StartOffset, Subscription, default_parsers, parse_headers,
};

use crate::worker::WorkerHandle;

/// Identifies one handler registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl core::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub topic: String,
    pub group_id: String,
    pub start_offset: StartOffset,
    pub header_parsers: Vec<Arc<dyn HeaderParser>>,
}

impl ConsumerConfig {
    /// Tenant and trace header parsing, reading from the earliest offset.
    pub fn new(name: impl Into<String>, topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            start_offset: StartOffset::Earliest,
            header_parsers: default_parsers(),
        }
    }

    pub fn with_start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    pub fn with_header_parsers(mut self, parsers: Vec<Arc<dyn HeaderParser>>) -> Self {
        self.header_parsers = parsers;
        self
    }
}

/// Backoff for bus fetch errors: doubling from `initial`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failure` (1-based).
    pub fn delay(&self, failure: u32) -> Duration {
        let factor = 2u32.saturating_pow(failure.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

type Registrations = Vec<(HandlerId, Arc<dyn Handler>)>;

#[derive(Default)]
struct HandlerTable {
    by_topic: RwLock<HashMap<String, Registrations>>,
}

impl HandlerTable {
    fn for_topic(&self, topic: &str) -> Registrations {
        self.by_topic
            .read()
            .map(|t| t.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn remove(&self, id: HandlerId) -> bool {
        let Ok(mut table) = self.by_topic.write() else {
            return false;
        };
        let mut removed = false;
        for registrations in table.values_mut() {
            let before = registrations.len();
            registrations.retain(|(h, _)| *h != id);
            removed |= registrations.len() != before;
        }
        removed
    }
}

pub struct ConsumerManager {
    bus: Arc<dyn MessageBus>,
    consumers: Mutex<Vec<Arc<ConsumerConfig>>>,
    handlers: Arc<HandlerTable>,
    retry: RetryPolicy,
}

impl core::fmt::Debug for ConsumerManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConsumerManager")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ConsumerManager {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            consumers: Mutex::new(Vec::new()),
            handlers: Arc::new(HandlerTable::default()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn add_consumer(&self, config: ConsumerConfig) {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.push(Arc::new(config));
        }
    }

    /// Handlers may be registered before or after `start`.
    pub fn register_handler(&self, topic: &str, handler: Arc<dyn Handler>) -> HandlerId {
        let id = HandlerId(Uuid::now_v7());
        if let Ok(mut table) = self.handlers.by_topic.write() {
            debug!(topic, handler = handler.name(), handler_id = %id, "handler registered");
            table.entry(topic.to_string()).or_default().push((id, handler));
        }
        id
    }

    /// Returns whether the handler was registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    /// Spawn one worker per partition of every consumer's topic. Workers stop
    /// when `shutdown` flips to `true`.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>, BusError> {
        let consumers = self
            .consumers
            .lock()
            .map(|c| c.clone())
            .map_err(|_| BusError::Unavailable("consumer list poisoned".into()))?;

        let mut workers = Vec::new();
        for config in consumers {
            let partitions = self.bus.partitions(&config.topic).await?;
            info!(consumer = %config.name, topic = %config.topic, group = %config.group_id, partitions, "starting consumer");
            for partition in 0..partitions {
                let worker = PartitionWorker {
                    bus: self.bus.clone(),
                    config: config.clone(),
                    partition,
                    handlers: self.handlers.clone(),
                    retry: self.retry,
                    shutdown: shutdown.clone(),
                };
                workers.push(tokio::spawn(worker.run()));
            }
        }
        Ok(workers)
    }

    /// [`start`](Self::start) with its own shutdown channel, as one handle.
    pub async fn spawn(&self) -> Result<WorkerHandle, BusError> {
        let (tx, rx) = watch::channel(false);
        let workers = self.start(rx).await?;
        let join = tokio::spawn(async move {
            for worker in workers {
                if let Err(err) = worker.await {
                    warn!(error = %err, "consumer worker ended abnormally");
                }
            }
        });
        Ok(WorkerHandle::new("consumers", tx, join))
    }
}

struct PartitionWorker {
    bus: Arc<dyn MessageBus>,
    config: Arc<ConsumerConfig>,
    partition: u32,
    handlers: Arc<HandlerTable>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl PartitionWorker {
    async fn run(mut self) {
        let Some(mut subscription) = self.subscribe().await else {
            return;
        };
        let mut failures = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };
            match next {
                Ok(Some(delivery)) => {
                    failures = 0;
                    self.process(subscription.as_mut(), delivery).await;
                }
                Ok(None) => failures = 0,
                Err(err) => {
                    failures += 1;
                    if failures >= self.retry.attempts {
                        error!(
                            consumer = %self.config.name,
                            partition = self.partition,
                            error = %err,
                            "fetch keeps failing; worker stops"
                        );
                        break;
                    }
                    warn!(consumer = %self.config.name, partition = self.partition, failures, error = %err, "fetch failed");
                    if !self.pause(self.retry.delay(failures)).await {
                        break;
                    }
                }
            }
        }
        debug!(consumer = %self.config.name, partition = self.partition, "partition worker stopped");
    }

    async fn subscribe(&mut self) -> Option<Box<dyn Subscription>> {
        let mut failures = 0u32;
        loop {
            match self
                .bus
                .subscribe(&self.config.topic, &self.config.group_id, self.partition, self.config.start_offset)
                .await
            {
                Ok(subscription) => return Some(subscription),
                Err(err) => {
                    failures += 1;
                    if failures >= self.retry.attempts {
                        error!(consumer = %self.config.name, partition = self.partition, error = %err, "cannot subscribe");
                        return None;
                    }
                    if !self.pause(self.retry.delay(failures)).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep unless shutdown comes first; returns whether to keep going.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = self.shutdown.changed() => changed.is_ok() && !*self.shutdown.borrow(),
        }
    }

    async fn process(&self, subscription: &mut dyn Subscription, delivery: Delivery) {
        let envelope = match RawEnvelope::from_slice(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    topic = %self.config.topic,
                    message_id = %delivery.id,
                    error = %err,
                    error_kind = "bad_input",
                    "undecodable envelope dropped"
                );
                self.settle(subscription, &delivery, false).await;
                return;
            }
        };

        let ctx = parse_headers(
            &self.config.header_parsers,
            OperationContext::background()
                .with_cancellation(Cancellation::from_receiver(self.shutdown.clone())),
            &delivery.message.headers,
        );
        let span = info_span!(
            "consume",
            topic = %self.config.topic,
            partition = self.partition,
            message_id = %delivery.id,
            attempt = delivery.attempt,
            kind = %envelope.kind,
            transaction_id = %envelope.transaction_id,
            tenant_id = %ctx.tenant().map(|t| t.id().to_string()).unwrap_or_default(),
            trace_id = %ctx.trace().map(|t| t.trace_id().to_string()).unwrap_or_default(),
        );

        let retry = self.dispatch(ctx, Arc::new(envelope)).instrument(span).await;
        self.settle(subscription, &delivery, retry).await;
    }

    /// Run every handler of the topic; returns whether the delivery must be retried.
    async fn dispatch(&self, ctx: OperationContext, envelope: Arc<RawEnvelope>) -> bool {
        let mut retry = false;
        for (id, handler) in self.handlers.for_topic(&self.config.topic) {
            let name = handler.name().to_string();
            let task = {
                let ctx = ctx.clone();
                let envelope = envelope.clone();
                tokio::spawn(
                    async move {
                        let mut buffer = MessageBuffer::new();
                        let result = handler.handle(&ctx, &envelope, &mut buffer).await;
                        (result, buffer)
                    }
                    .in_current_span(),
                )
            };
            match task.await {
                Ok((Ok(outcome), buffer)) => {
                    if let Err(err) = buffer.flush(self.bus.as_ref()).await {
                        warn!(handler = %name, error = %err, "produce failed; message will be redelivered");
                        retry = true;
                        continue;
                    }
                    if outcome == HandlerOutcome::Unregister {
                        self.handlers.remove(id);
                        debug!(handler = %name, handler_id = %id, "handler unregistered itself");
                    }
                }
                Ok((Err(err), _discarded)) if err.is_retryable() => {
                    warn!(handler = %name, error = %err, error_kind = %err.kind(), "handler failed; message will be redelivered");
                    retry = true;
                }
                Ok((Err(err), _discarded)) => {
                    error!(handler = %name, error = %err, error_kind = %err.kind(), "handler failed");
                }
                Err(join) => {
                    error!(handler = %name, error = %join, "handler panicked");
                    retry = true;
                }
            }
        }
        retry
    }

    async fn settle(&self, subscription: &mut dyn Subscription, delivery: &Delivery, retry: bool) {
        let settled = if retry {
            subscription.reject(delivery).await
        } else {
            subscription.commit(delivery).await
        };
        if let Err(err) = settled {
            // Uncommitted deliveries come back; handlers are idempotent.
            warn!(topic = %self.config.topic, message_id = %delivery.id, error = %err, "could not settle delivery");
        }
    }
}
