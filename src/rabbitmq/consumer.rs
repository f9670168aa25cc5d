// src/rabbitmq/consumer.rs
// Consumer registry and the per-queue delivery loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery, options::BasicConsumeOptions, types::FieldTable, Channel, Consumer,
    ExchangeKind,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{declare_and_bind, declare_exchange, ChannelConfig};
use super::client::{Client, ClientState};
use super::connection::{ConnectionEvent, Session};
use super::errors::{MessagingError, Result};

/// Where a delivery came from.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub consumer_tag: String,
    /// Connection generation the delivery arrived on; bumps on every reconnect.
    pub generation: u64,
}

/// Receives deliveries for one consumer binding.
///
/// The handler owns acknowledgement: call `delivery.ack(..)` or
/// `delivery.nack(..)` (or `reject`). Nothing is acknowledged on its behalf.
/// A delivery that is never acknowledged stays outstanding and will be
/// redelivered once the channel goes away.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: DeliveryContext, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(DeliveryContext, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: DeliveryContext, delivery: Delivery) {
        (self)(ctx, delivery).await
    }
}

/// Everything needed to (re)create one consumer.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    pub handler: Arc<dyn DeliveryHandler>,
    /// Unacknowledged deliveries allowed in flight; 0 means unlimited.
    pub prefetch_count: u16,
}

impl ConsumerOptions {
    pub fn new<H: DeliveryHandler>(
        exchange: &str,
        exchange_kind: ExchangeKind,
        queue: &str,
        routing_key: &str,
        handler: H,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            exchange_kind,
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            handler: Arc::new(handler),
            prefetch_count: 0,
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// A registered consumer. Immutable once registered; registering the same
/// queue twice makes two independent bindings.
#[derive(Clone)]
pub struct ConsumerBinding {
    id: u64,
    options: ConsumerOptions,
}

impl ConsumerBinding {
    /// Registration number, unique within one client.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn exchange(&self) -> &str {
        &self.options.exchange
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.options.exchange_kind
    }

    pub fn queue(&self) -> &str {
        &self.options.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.options.routing_key
    }

    pub fn prefetch_count(&self) -> u16 {
        self.options.prefetch_count
    }
}

impl std::fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("id", &self.id)
            .field("exchange", &self.options.exchange)
            .field("queue", &self.options.queue)
            .field("routing_key", &self.options.routing_key)
            .field("prefetch_count", &self.options.prefetch_count)
            .finish()
    }
}

/// Bindings in registration order plus the delivery loops running for the
/// current connection.
#[derive(Default)]
pub(crate) struct Registry {
    bindings: Vec<ConsumerBinding>,
    loops: Vec<JoinHandle<()>>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn bindings(&self) -> &[ConsumerBinding] {
        &self.bindings
    }

    pub(crate) fn take_loops(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.loops)
    }

    fn next_binding(&self, options: ConsumerOptions) -> ConsumerBinding {
        ConsumerBinding {
            id: self.next_id + 1,
            options,
        }
    }

    fn insert(&mut self, binding: ConsumerBinding) {
        self.next_id = self.next_id.max(binding.id);
        self.bindings.push(binding);
    }

    fn find(&self, id: u64) -> Option<&ConsumerBinding> {
        self.bindings.iter().find(|binding| binding.id == id)
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.loops.retain(|running| !running.is_finished());
        self.loops.push(handle);
    }
}

/// Declares the binding's exchange and queue on a fresh channel, applies the
/// prefetch limit and spawns the delivery loop.
async fn start_binding(
    session: &Session,
    binding: &ConsumerBinding,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<JoinHandle<()>> {
    let channel = session.create_channel().await?;
    let consumer_tag = format!("consumer-{}", &Uuid::new_v4().to_string()[..8]);
    let consumer = match open_consumer(&channel, &binding.options, &consumer_tag).await {
        Ok(consumer) => consumer,
        Err(e) => {
            if channel.status().connected() {
                let _ = channel.close(200, "consumer setup failed").await;
            }
            return Err(e);
        }
    };
    let options = &binding.options;

    info!(
        queue = %options.queue,
        routing_key = %options.routing_key,
        consumer_tag = %consumer_tag,
        generation = session.generation,
        "Started consuming"
    );

    let ctx = DeliveryContext {
        exchange: options.exchange.clone(),
        queue: options.queue.clone(),
        binding_key: options.routing_key.clone(),
        consumer_tag,
        generation: session.generation,
    };

    Ok(tokio::spawn(delivery_loop(
        consumer,
        options.handler.clone(),
        ctx,
        shutdown,
        StopReport {
            binding_id: binding.id,
            events,
        },
    )))
}

async fn open_consumer(
    channel: &Channel,
    options: &ConsumerOptions,
    consumer_tag: &str,
) -> Result<Consumer> {
    declare_exchange(channel, &options.exchange, options.exchange_kind.clone()).await?;
    declare_and_bind(channel, &options.queue, &options.exchange, &options.routing_key, true, false)
        .await?;
    ChannelConfig {
        prefetch_count: options.prefetch_count,
    }
    .apply(channel)
    .await?;

    channel
        .basic_consume(
            &options.queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::ConsumeError(e.to_string()))
}

/// Where a delivery loop reports that it stopped on its own.
struct StopReport {
    binding_id: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Hands each delivery to the handler and waits for it before taking the
/// next one, so a queue has at most one handler call in flight.
///
/// If the stream ends without a shutdown (consumer cancelled, channel closed
/// by the broker) the loop reports it so the listener can restart the binding.
async fn delivery_loop(
    mut consumer: Consumer,
    handler: Arc<dyn DeliveryHandler>,
    ctx: DeliveryContext,
    mut shutdown: watch::Receiver<bool>,
    report: StopReport,
) {
    let stopped = loop {
        if *shutdown.borrow() {
            break None;
        }

        let next = tokio::select! {
            next = consumer.next() => next,
            _ = shutdown.changed() => break None,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(
                    queue = %ctx.queue,
                    routing_key = delivery.routing_key.as_str(),
                    delivery_tag = delivery.delivery_tag,
                    bytes = delivery.data.len(),
                    "Dispatching delivery"
                );
                handler.handle(ctx.clone(), delivery).await;
            }
            Some(Err(e)) => {
                warn!(queue = %ctx.queue, error = %e, "Consumer stream failed");
                break Some(e.to_string());
            }
            None => {
                warn!(queue = %ctx.queue, "Consumer cancelled by the broker");
                break Some("consumer cancelled".to_string());
            }
        }
    };

    if let Some(reason) = stopped {
        if !*shutdown.borrow() {
            let _ = report.events.send(ConnectionEvent::ConsumerStopped {
                generation: ctx.generation,
                binding_id: report.binding_id,
                reason,
            });
        }
    }
    debug!(queue = %ctx.queue, generation = ctx.generation, "Delivery loop stopped");
}

/// Waits for the loops to notice shutdown, aborting whatever is still
/// running after `grace`.
pub(crate) async fn drain_loops(loops: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    let waits = loops.into_iter().map(|handle| async move {
        let abort = handle.abort_handle();
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("Delivery handler panicked: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Delivery loop did not stop within {:?}; aborting", grace);
                abort.abort();
            }
        }
    });
    join_all(waits).await;
}

impl Client {
    /// Registers a consumer and starts delivering to it.
    ///
    /// If the client is between connections the binding is recorded and the
    /// listener starts it once the broker is back.
    pub async fn add_consumer(&self, options: ConsumerOptions) -> Result<()> {
        // Held across the start so a concurrent replay can't start it twice.
        let mut registry = self.inner.registry.lock().await;
        self.ensure_open()?;
        if self.state() == ClientState::Disconnected {
            return Err(MessagingError::ConnectionError(
                "client is disconnected and will not reconnect".to_string(),
            ));
        }

        let binding = registry.next_binding(options);
        let session = self.inner.session.read().await.clone();
        match session {
            Some(session) => {
                let handle = start_binding(
                    &session,
                    &binding,
                    self.inner.shutdown.subscribe(),
                    self.inner.events_tx.clone(),
                )
                .await?;
                registry.track(handle);
            }
            None => {
                info!(queue = %binding.queue(), "Not connected; consumer will start after reconnect");
            }
        }
        registry.insert(binding);
        Ok(())
    }

    /// Short form mirroring the registration options one to one.
    pub async fn add_consumer_with<H: DeliveryHandler>(
        &self,
        exchange: &str,
        exchange_kind: ExchangeKind,
        queue: &str,
        routing_key: &str,
        handler: H,
        prefetch_count: u16,
    ) -> Result<()> {
        self.add_consumer(
            ConsumerOptions::new(exchange, exchange_kind, queue, routing_key, handler)
                .with_prefetch(prefetch_count),
        )
        .await
    }

    pub async fn consumers(&self) -> Vec<ConsumerBinding> {
        self.inner.registry.lock().await.bindings().to_vec()
    }

    /// Installs `session` as current and restarts every registered consumer
    /// on it, in registration order.
    pub(crate) async fn install_and_replay(&self, session: Arc<Session>) -> Result<()> {
        let mut guard = self.inner.registry.lock().await;
        let registry = &mut *guard;

        // close() flips the flag before it takes the registry lock, so either
        // it sees the loops started here or we see the flag.
        if self.is_closed() {
            drop(guard);
            let _ = session.close("client closed").await;
            return Err(MessagingError::ClosedError);
        }

        // Loops from the old connection end on their own once their channel is
        // gone; keep the ones still finishing a handler so close can wait.
        let mut loops = registry.take_loops();
        loops.retain(|handle| !handle.is_finished());

        let previous = self.inner.session.write().await.replace(session.clone());
        drop(previous);

        self.redeclare_exchange().await?;

        let mut restored = 0usize;
        for binding in registry.bindings.iter() {
            let started = start_binding(
                &session,
                binding,
                self.inner.shutdown.subscribe(),
                self.inner.events_tx.clone(),
            )
            .await;
            match started {
                Ok(handle) => {
                    loops.push(handle);
                    restored += 1;
                }
                Err(e) if !e.is_connection_loss() && session.connection.status().connected() => {
                    // The broker refused this binding only; redialing won't help.
                    error!(queue = %binding.queue(), error = %e, "Failed to restore consumer");
                }
                Err(e) => {
                    registry.loops = loops;
                    return Err(e);
                }
            }
        }

        info!(
            generation = session.generation,
            consumers = restored,
            registered = registry.bindings.len(),
            "Consumers restored"
        );
        registry.loops = loops;
        Ok(())
    }

    /// Starts `binding_id` again on the current session after its delivery
    /// loop stopped. Does nothing if the session it stopped on has already
    /// been replaced, since replay covers it.
    pub(crate) async fn restart_consumer(&self, generation: u64, binding_id: u64) -> Result<()> {
        let mut registry = self.inner.registry.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let session = match self.inner.session.read().await.clone() {
            Some(session) if session.generation == generation => session,
            _ => return Ok(()),
        };
        let binding = match registry.find(binding_id) {
            Some(binding) => binding.clone(),
            None => return Ok(()),
        };

        let handle = start_binding(
            &session,
            &binding,
            self.inner.shutdown.subscribe(),
            self.inner.events_tx.clone(),
        )
        .await?;
        registry.track(handle);
        info!(queue = %binding.queue(), binding_id, generation, "Consumer restarted");
        Ok(())
    }
}
