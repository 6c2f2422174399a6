use crate::callback::{self, Observer};
use crate::client_error;
use crate::connection::{self, Connection, SharedEngine};
use crate::destination::{Destination, DestinationKey};
use crate::dispatcher::{self, Action, CommandSink, Reply};
use crate::engine::Engine;
use crate::error::{error_kind, ClientError, ErrorKind};
use crate::model::{validate_ttl, ClientState, Delivery, OutboundMessage, Payload, Qos};
use crate::options::{
    parse_services, validate_share, validate_topic, ClientOptions, Credentials, ReceiveOptions, RetryPolicy,
    SecurityOptions, SendOptions, SubscribeOptions, UnsubscribeOptions,
};
use crate::state::SharedState;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Non-zero receive timeouts are raised to this value.
pub const MIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// A receive reply may arrive slightly after the deadline, the caller waits this much longer
/// so that a message taken from the destination is not lost.
const RECEIVE_REPLY_GRACE: Duration = Duration::from_millis(50);

/// How long `stop()` waits for the connection manager before it gives up on it.
const JOIN_GRACE: Duration = Duration::from_secs(3);

/// The command queue of a running connection manager and its stop signal.
#[derive(Clone)]
struct Link {
    commands: CommandSink,
    cancel: CancellationToken,
}

/// Blocking MQ Light client.
///
/// All the operations block the calling thread until the connection manager replies or the
/// timeout elapses. A client can be used from many threads at the same time, the operations
/// are executed in the order they were called.
///
/// ```no_run
/// use mqlight_client::{loopback::Broker, Client, ClientOptions, ReceiveOptions, SendOptions, SubscribeOptions};
/// use std::time::Duration;
///
/// fn main() -> anyhow::Result<()> {
///     let broker = Broker::new();
///     let client = Client::new(["amqp://localhost"], ClientOptions::default().id("client1"), broker.engine())?;
///
///     client.subscribe("news", SubscribeOptions::default())?;
///     client.send("news", "hello", SendOptions::default().qos(1))?;
///
///     if let Some(delivery) = client.receive("news", ReceiveOptions::default().timeout(Duration::from_secs(1)))? {
///         println!("{}: {:?}", delivery.topic, delivery.data());
///     }
///
///     client.stop();
///
///     Ok(())
/// }
/// ```
pub struct Client {
    shared: Arc<SharedState>,
    runtime: Option<Runtime>,
    engine: SharedEngine,
    services: Vec<Url>,
    credentials: Option<Credentials>,
    security: SecurityOptions,
    retry: RetryPolicy,
    /// Join handle of the connection manager, the lock also serializes start and stop.
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    link: RwLock<Option<Link>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client {{ {:?}, services={:?} }}", self.shared, self.services)
    }
}

/// The runtime of the client cannot be entered from another runtime.
fn ensure_blocking() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return client_error!(Unsupported, "blocking client calls cannot be made from an async context");
    }

    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Create a client and start it. Options are validated before anything else happens, then
    /// the call blocks until the client is started or retrying (or `connect_timeout_ms`
    /// elapses). Authentication and TLS failures are returned as errors.
    pub fn new<I, S, E>(services: I, options: ClientOptions, engine: E) -> Result<Client>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: Engine + 'static,
    {
        Self::build(services, options, Box::new(engine), None)
    }

    /// Same as [`Client::new`] but every state transition is also reported to `observer`. The
    /// observer runs on a dedicated thread.
    pub fn with_observer<I, S, E, F>(services: I, options: ClientOptions, engine: E, observer: F) -> Result<Client>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: Engine + 'static,
        F: Fn(ClientState, Option<&ClientError>) + Send + 'static,
    {
        Self::build(services, options, Box::new(engine), Some(Box::new(observer)))
    }

    fn build<I, S>(
        services: I,
        options: ClientOptions,
        engine: Box<dyn Engine>,
        observer: Option<Observer>,
    ) -> Result<Client>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let id = options.client_id()?;
        let credentials = options.credentials_pair()?;
        let security = options.security()?;
        let services = parse_services(services, credentials.as_ref())?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("mqlight-{}", id))
            .enable_all()
            .build()?;

        let notifications = match observer {
            Some(observer) => Some(callback::start(&id, observer)?),
            None => None,
        };

        info!("Client {} created for {} service(s)", id, services.len());

        let client = Client {
            shared: Arc::new(SharedState::new(id, notifications)),
            runtime: Some(runtime),
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            services,
            credentials,
            security,
            retry: options.retry.clone(),
            lifecycle: Mutex::new(None),
            link: RwLock::new(None),
        };

        client.start(options.connect_timeout_duration())?;

        Ok(client)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// The service the client is connected (or connecting) to.
    pub fn service(&self) -> Option<Url> {
        self.shared.service()
    }

    /// Number of connection attempts made so far.
    pub fn reconnects(&self) -> u64 {
        self.shared.reconnects()
    }

    /// The error which caused the last state transition.
    pub fn last_error(&self) -> Option<ClientError> {
        self.shared.last_error()
    }

    /// Run a future on the runtime of the client, blocking the calling thread.
    fn block_on<F: Future>(&self, f: F) -> Result<F::Output> {
        ensure_blocking()?;

        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(f)),
            None => client_error!(Stopped, "client is dropped"),
        }
    }

    /// Start the client. It returns immediately if the client is started already, otherwise it
    /// waits until the client is started or retrying. It fails if the client stops meanwhile
    /// (with the error which stopped it) or if the timeout elapses.
    pub fn start(&self, timeout: Option<Duration>) -> Result<&Self> {
        let deadline = timeout.map(|t| Instant::now() + t);

        ensure_blocking()?;

        let mut watcher = {
            let mut lifecycle = lock(&self.lifecycle);

            if self.shared.state() == ClientState::Started {
                return Ok(self);
            }

            let running = lifecycle.as_ref().map_or(false, |h| !h.is_finished());

            if !running {
                self.launch(&mut lifecycle)?;
            }

            self.shared.subscribe_state()
        };

        let wait = async move {
            watcher
                .wait_for(|s| matches!(s, ClientState::Started | ClientState::Retrying | ClientState::Stopped))
                .await
                .map(|s| *s)
        };

        let state = match deadline {
            None => self.block_on(wait)?,
            Some(d) => match self.block_on(async move { tokio::time::timeout_at(d.into(), wait).await })? {
                Ok(s) => s,
                Err(_) => return client_error!(Timeout, format!("client {} did not start in time", self.id())),
            },
        };

        match state {
            Ok(ClientState::Stopped) | Err(_) => match self.shared.last_error() {
                Some(err) => Err(anyhow::Error::new(err)),
                None => client_error!(Stopped, format!("client {} is stopped", self.id())),
            },
            Ok(_) => Ok(self),
        }
    }

    fn launch(&self, lifecycle: &mut Option<JoinHandle<()>>) -> Result<()> {
        let runtime = match &self.runtime {
            Some(runtime) => runtime,
            None => return client_error!(Stopped, "client is dropped"),
        };

        let (commands, stream) = dispatcher::queue();
        let cancel = CancellationToken::new();

        self.shared.clear_last_error();
        self.shared.transition(ClientState::Starting, None);

        let conn = Connection {
            shared: self.shared.clone(),
            engine: self.engine.clone(),
            services: self.services.clone(),
            credentials: self.credentials.clone(),
            security: self.security.clone(),
            retry: self.retry.clone(),
            commands: stream,
            cancel: cancel.clone(),
        };

        *lifecycle = Some(runtime.spawn(connection::run(conn)));
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(Link { commands, cancel });

        Ok(())
    }

    /// Stop the client. Pending and blocked calls fail with a `Stopped` error, the
    /// subscriptions are forgotten. Stopping a stopped client does nothing.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        let link = self.link.write().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(link) = &link {
            link.cancel.cancel();
        }

        let handle = match lifecycle.take() {
            Some(handle) => handle,
            None => {
                debug!("Client {} is already stopped", self.id());
                return;
            }
        };

        info!("Stopping client {}", self.id());

        let abort = handle.abort_handle();

        match self.block_on(async move { tokio::time::timeout(JOIN_GRACE, handle).await }) {
            Ok(Ok(Ok(()))) => debug!("Connection manager of {} joined", self.id()),
            Ok(Ok(Err(e))) => error!("Connection manager of {} failed: {:?}", self.id(), e),
            Ok(Err(_)) => {
                warn!("Connection manager of {} did not stop in {:?}", self.id(), JOIN_GRACE);
                abort.abort();
            }
            Err(e) => {
                warn!("Cannot wait for the connection manager of {}: {}", self.id(), e);
                abort.abort();
            }
        }

        // A manager which was aborted or panicked couldn't finish the transitions.
        self.shared.destinations.clear();
        self.shared.transition(ClientState::Stopped, None);
    }

    fn link(&self) -> Result<Link> {
        ensure_blocking()?;

        let state = self.shared.state();

        if state != ClientState::Started {
            return client_error!(Stopped, format!("client {} is {}", self.id(), state));
        }

        match self.link.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(link) => Ok(link.clone()),
            None => client_error!(Stopped, format!("client {} is not started", self.id())),
        }
    }

    /// Wait for the reply of a command. `None` means the deadline elapsed first.
    fn wait(
        &self,
        link: &Link,
        rx: oneshot::Receiver<Result<Reply>>,
        deadline: Option<Instant>,
    ) -> Result<Option<Reply>> {
        let cancel = link.cancel.clone();

        let reply = async move {
            tokio::select! {
                biased;

                r = rx => match r {
                    Ok(r) => r,
                    Err(_) => client_error!(Stopped, "client stopped before replying"),
                },
                _ = cancel.cancelled() => client_error!(Stopped, "client is stopping"),
            }
        };

        self.block_on(async move {
            match deadline {
                None => reply.await.map(Some),
                Some(d) => match tokio::time::timeout_at(d.into(), reply).await {
                    Ok(r) => r.map(Some),
                    Err(_) => Ok(None),
                },
            }
        })?
    }

    /// Send a message to a topic.
    pub fn send(&self, topic: &str, data: impl Into<Payload>, options: SendOptions) -> Result<&Self> {
        let entered = Instant::now();
        let link = self.link()?;

        validate_topic(topic, "topic")?;

        let qos = Qos::try_from(options.qos)?;
        let ttl = validate_ttl(options.ttl, false)?;
        let deadline = options.timeout.map(|t| entered + t);
        let body = data.into();

        let message = OutboundMessage {
            topic: topic.to_owned(),
            content_type: body.content_type(),
            body,
            qos,
            ttl,
        };

        debug!(
            "Client {} sends {} bytes to {} qos={:?} ttl={:?}",
            self.id(),
            message.body.len(),
            topic,
            qos,
            ttl
        );

        let rx = dispatcher::submit(&link.commands, Action::Send(message), deadline)?;

        match self.wait(&link, rx, deadline)? {
            Some(_) => Ok(self),
            None => client_error!(Timeout, format!("send to {} timed out", topic)),
        }
    }

    /// Subscribe to a topic pattern, optionally in a share.
    pub fn subscribe(&self, topic_pattern: &str, options: SubscribeOptions) -> Result<&Self> {
        let entered = Instant::now();
        let link = self.link()?;

        validate_topic(topic_pattern, "topic pattern")?;
        validate_share(options.share.as_deref())?;

        let destination = Destination {
            key: DestinationKey::new(topic_pattern, options.share.as_deref()),
            qos: Qos::try_from(options.qos)?,
            ttl: validate_ttl(options.ttl, true)?.unwrap_or(0),
            auto_confirm: options.auto_confirm,
        };

        if self.shared.destinations.contains(&destination.key) {
            return client_error!(Subscribed, format!("client {} is already subscribed to {}", self.id(), destination.key));
        }

        debug!("Client {} subscribes to {}", self.id(), destination.key);

        let deadline = options.timeout.map(|t| entered + t);
        let rx = dispatcher::submit(&link.commands, Action::Subscribe(destination.clone()), deadline)?;

        match self.wait(&link, rx, deadline)? {
            Some(_) => {
                if !self.shared.destinations.insert(destination) {
                    debug!("Destination {} was registered by another call", topic_pattern);
                }

                Ok(self)
            }
            None => client_error!(Timeout, format!("subscribe to {} timed out", topic_pattern)),
        }
    }

    /// Receive the next message of a subscribed destination. `Ok(None)` is returned if no
    /// message arrives in time. An `unsubscribe` from another thread makes a blocked receive
    /// fail with `Unsubscribed`.
    pub fn receive(&self, topic_pattern: &str, options: ReceiveOptions) -> Result<Option<Delivery>> {
        let entered = Instant::now();
        let link = self.link()?;

        validate_topic(topic_pattern, "topic pattern")?;
        validate_share(options.share.as_deref())?;

        let key = DestinationKey::new(topic_pattern, options.share.as_deref());
        let (destination, detached) = match self.shared.destinations.get(&key) {
            Some(d) => d,
            None => return client_error!(Unsubscribed, format!("client {} is not subscribed to {}", self.id(), key)),
        };

        let timeout = options.timeout.map(|t| {
            if !t.is_zero() && t < MIN_RECEIVE_TIMEOUT {
                MIN_RECEIVE_TIMEOUT
            } else {
                t
            }
        });
        let deadline = timeout.map(|t| entered + t);

        let rx = dispatcher::submit(&link.commands, Action::Receive(destination, detached), deadline)?;

        match self.wait(&link, rx, deadline.map(|d| d + RECEIVE_REPLY_GRACE)) {
            Ok(Some(Reply::Message(delivery))) => Ok(delivery),
            Ok(Some(Reply::Done)) => client_error!(Internal, "unexpected reply to receive"),
            Ok(None) => Ok(None),
            Err(e)
                if !matches!(error_kind(&e), Some(ErrorKind::Stopped | ErrorKind::Unsubscribed))
                    && !self.shared.destinations.contains(&key) =>
            {
                client_error!(Unsubscribed, format!("{} was unsubscribed during receive: {}", key, e))
            }
            Err(e) => Err(e),
        }
    }

    /// Unsubscribe from a destination. The only accepted `ttl` is 0, which deletes the
    /// destination on the server.
    pub fn unsubscribe(&self, topic_pattern: &str, options: UnsubscribeOptions) -> Result<&Self> {
        let link = self.link()?;

        validate_topic(topic_pattern, "topic pattern")?;
        validate_share(options.share.as_deref())?;

        let ttl = match options.ttl {
            None => None,
            Some(0) => Some(0),
            Some(other) => return client_error!(Range, format!("unsubscribe ttl must be 0, got {}", other)),
        };

        let key = DestinationKey::new(topic_pattern, options.share.as_deref());
        let destination = match self.shared.destinations.remove(&key) {
            Some(d) => d,
            None => return client_error!(Unsubscribed, format!("client {} is not subscribed to {}", self.id(), key)),
        };

        debug!("Client {} unsubscribes from {}", self.id(), key);

        let rx = match dispatcher::submit(&link.commands, Action::Unsubscribe(destination.clone(), ttl), None) {
            Ok(rx) => rx,
            Err(e) => {
                self.shared.destinations.insert(destination);
                return Err(e);
            }
        };

        match self.wait(&link, rx, None) {
            Ok(_) => Ok(self),
            Err(e) => {
                if error_kind(&e) != Some(ErrorKind::Stopped) {
                    warn!("Unsubscribe from {} failed, keeping the destination: {}", key, e);

                    self.shared.destinations.insert(destination);
                }

                Err(e)
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
