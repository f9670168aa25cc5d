// src/rabbitmq/client.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::ExchangeKind;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{info, warn};

use super::channel_manager::parse_exchange_kind;
use super::connection::{ConnectionEvent, Session};
use super::consumer::Registry;
use super::errors::{MessagingError, Result};
use super::reconnect::ReconnectPolicy;
use crate::config::MessagingConfig;

/// Construction options for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub uri: String,
    /// Whether the listener re-dials after an unexpected disconnect.
    pub reconnect: bool,
    pub reconnect_policy: ReconnectPolicy,
    /// Shown in the broker's management UI.
    pub connection_name: Option<String>,
    /// How long `close` waits for in-flight handlers before aborting them.
    pub shutdown_grace: Duration,
    /// Upper bound on one dial, including the AMQP handshake.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(uri: &str, reconnect: bool) -> Self {
        Self {
            uri: uri.to_string(),
            reconnect,
            reconnect_policy: ReconnectPolicy::default(),
            connection_name: None,
            shutdown_grace: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_string());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// The connection is gone and nobody is going to bring it back.
    Disconnected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct PublishingExchange {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
}

pub(crate) struct Inner {
    pub(crate) options: ClientOptions,
    /// The single source of truth for the current connection and control
    /// channel; swapped wholesale on reconnect.
    pub(crate) session: RwLock<Option<Arc<Session>>>,
    pub(crate) exchange: RwLock<Option<PublishingExchange>>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) generation: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) state: watch::Sender<ClientState>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pub(crate) events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

/// Process-wide handle on one broker connection.
///
/// Cloning is cheap and every clone refers to the same connection, consumer
/// registry and listener. Build it once at startup and hand clones to
/// whoever needs to publish or consume.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("reconnect", &self.inner.options.reconnect)
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Dials `uri` and opens the control channel. Fails fast if the broker
    /// can't be reached.
    pub async fn connect(uri: &str, reconnect: bool) -> Result<Self> {
        Self::with_options(ClientOptions::new(uri, reconnect)).await
    }

    pub async fn with_options(options: ClientOptions) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::open(
            &options.uri,
            options.connection_name.as_deref(),
            options.connect_timeout,
            1,
            events_tx.clone(),
        )
        .await?;

        Ok(Self::assemble(
            options,
            Some(Arc::new(session)),
            ClientState::Connected,
            events_tx,
            events_rx,
        ))
    }

    /// Connects with the configured options and declares the configured
    /// publishing exchange.
    pub async fn from_config(config: &MessagingConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MessagingError::ConfigError(e.to_string()))?;

        let client = Self::with_options(config.client_options()).await?;
        let kind = parse_exchange_kind(&config.publishing.exchange_type);
        if let Err(e) = client
            .setup_publishing_with_kind(&config.publishing.exchange, kind)
            .await
        {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    fn assemble(
        options: ClientOptions,
        session: Option<Arc<Session>>,
        state: ClientState,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
        events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(state);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                options,
                session: RwLock::new(session),
                exchange: RwLock::new(None),
                registry: Mutex::new(Registry::default()),
                generation: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                state,
                shutdown,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// A client with no session, as if generation 1 had just been lost.
    #[cfg(test)]
    pub(crate) fn detached(options: ClientOptions, state: ClientState) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self::assemble(options, None, state, events_tx, events_rx)
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, event: ConnectionEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    pub fn uri(&self) -> &str {
        &self.inner.options.uri
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.options.reconnect
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle changes, e.g. to restart the process once the
    /// client reaches [`ClientState::Disconnected`].
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MessagingError::ClosedError)
        } else {
            Ok(())
        }
    }

    /// The session every operation must go through. Never cached by callers
    /// beyond a single operation, so a reconnect is visible immediately.
    pub(crate) async fn current_session(&self) -> Result<Arc<Session>> {
        self.ensure_open()?;
        self.inner
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| MessagingError::ConnectionError("not connected".to_string()))
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Client state changed");
        }
    }

    /// Drops the current connection and reports it to the listener as an
    /// unexpected loss, so it re-dials and replays every consumer.
    pub async fn force_reconnect(&self) -> Result<()> {
        let session = self.current_session().await?;
        warn!(generation = session.generation, "Forcing reconnect");

        if let Err(e) = session.close("forced reconnect").await {
            warn!(error = %e, "Error while dropping connection for reconnect");
        }

        self.inner
            .events_tx
            .send(ConnectionEvent::Lost {
                generation: session.generation,
                reason: "forced reconnect".to_string(),
            })
            .map_err(|_| MessagingError::ClosedError)
    }

    /// Stops the listener and every delivery loop, then releases the channel
    /// and the connection.
    ///
    /// Handlers that are already running are given `shutdown_grace` to
    /// finish. Every later call on this client, including a second `close`,
    /// fails with [`MessagingError::ClosedError`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::ClosedError);
        }
        info!("Closing messaging client");

        self.inner.shutdown.send_replace(true);
        self.set_state(ClientState::Closed);

        let loops = self.inner.registry.lock().await.take_loops();
        super::consumer::drain_loops(loops, self.inner.options.shutdown_grace).await;

        let session = self.inner.session.write().await.take();
        match session {
            Some(session) => session.close("client closed").await,
            None => Ok(()),
        }
    }
}
