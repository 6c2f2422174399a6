//! The connection manager of a client.
//!
//! It runs as one task on the runtime of the client and owns the engine for the whole time it
//! runs. The loop has two phases:
//!
//! ```text
//!    connect (services in order) ---- terminal error ----> stopped
//!        |        ^
//!        |        | network error: retrying, backoff
//!        v        |
//!    serve: commands / engine events ---- cancel ----> stopping -> stopped
//! ```
//!
//! While serving, commands are taken from the queue and executed one by one, engine events are
//! handled between them. The cancellation token is the wakeup signal used by `stop()`.

use crate::dispatcher::{self, CommandStream};
use crate::engine::{ConnectParams, Engine, EngineEvent, EventSink};
use crate::error::{ClientError, ErrorKind};
use crate::model::ClientState;
use crate::options::{service_credentials, Credentials, RetryPolicy, SecurityOptions};
use crate::state::SharedState;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use url::Url;

/// How long the engine has for closing the connection during stop.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) type SharedEngine = Arc<Mutex<Box<dyn Engine>>>;

/// Everything the connection manager needs, it is moved into the task.
pub(crate) struct Connection {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) engine: SharedEngine,
    pub(crate) services: Vec<Url>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) security: SecurityOptions,
    pub(crate) retry: RetryPolicy,
    pub(crate) commands: CommandStream,
    pub(crate) cancel: CancellationToken,
}

enum Outcome {
    /// `stop()` was called.
    Cancelled,
    /// The connection is gone, try again.
    Lost(ClientError),
    /// Connecting failed with an error which cannot be fixed by retrying.
    Fatal(ClientError),
}

pub(crate) async fn run(mut conn: Connection) {
    let mut engine = conn.engine.clone().lock_owned().await;
    let shared = conn.shared.clone();

    info!("Connection manager of {} started", shared.id);

    let mut connected = false;
    let mut attempt = 0u32;
    let mut reconnecting = false;

    let outcome = loop {
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let result = tokio::select! {
            biased;

            _ = conn.cancel.cancelled() => break Outcome::Cancelled,
            r = connect_any(&mut engine, &conn, events_tx) => r,
        };

        match result {
            Ok(service) => {
                info!("Client {} connected to {}", shared.id, service);

                connected = true;
                attempt = 0;

                if reconnecting {
                    resubscribe(&mut engine, &shared).await;
                    shared.transition(ClientState::Restarted, None);
                }

                shared.transition(ClientState::Started, None);
            }
            Err(err) if err.kind.is_recoverable() => {
                if let Some(max) = conn.retry.max_retries {
                    if attempt >= max {
                        error!("Client {} gives up after {} retries", shared.id, attempt);

                        break Outcome::Fatal(err);
                    }
                }

                shared.transition(ClientState::Retrying, Some(err));
                reconnecting = true;

                let delay = conn.retry.delay(attempt);
                attempt += 1;

                debug!("Client {} retries in {:?}", shared.id, delay);

                tokio::select! {
                    biased;

                    _ = conn.cancel.cancelled() => break Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
            Err(err) => break Outcome::Fatal(err),
        }

        match serve(&mut engine, &mut conn, &mut events).await {
            Outcome::Lost(err) => {
                warn!("Client {} lost the connection: {}", shared.id, err);

                connected = false;
                reconnecting = true;

                shared.transition(ClientState::Retrying, Some(err.clone()));
                dispatcher::reject_pending(
                    &mut conn.commands,
                    &ClientError::new(ErrorKind::Stopped, format!("connection lost: {}", err.message)),
                );

                let delay = conn.retry.delay(attempt);
                attempt += 1;

                tokio::select! {
                    biased;

                    _ = conn.cancel.cancelled() => break Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            other => break other,
        }
    };

    // No more commands are accepted from here.
    conn.commands.close();

    match outcome {
        Outcome::Cancelled => {
            shared.transition(ClientState::Stopping, None);
            dispatcher::reject_pending(
                &mut conn.commands,
                &ClientError::new(ErrorKind::Stopped, "client is stopping"),
            );

            if connected {
                close_engine(&mut engine, &shared.id).await;
            }

            shared.destinations.clear();
            shared.transition(ClientState::Stopped, None);
        }
        Outcome::Fatal(err) | Outcome::Lost(err) => {
            error!("Client {} stops: {}", shared.id, err);

            dispatcher::reject_pending(&mut conn.commands, &ClientError::new(ErrorKind::Stopped, err.message.clone()));

            if connected {
                close_engine(&mut engine, &shared.id).await;
            }

            shared.destinations.clear();
            shared.transition(ClientState::Stopped, Some(err));
        }
    }

    info!("Connection manager of {} exits", shared.id);
}

/// Try the services in order. Security errors stop the round immediately.
async fn connect_any(
    engine: &mut OwnedMutexGuard<Box<dyn Engine>>,
    conn: &Connection,
    events: EventSink,
) -> Result<Url, ClientError> {
    let mut last_error = ClientError::new(ErrorKind::Network, "no service to connect to");

    for service in &conn.services {
        let attempt = conn.shared.connection_attempt(service);

        debug!("Client {} connects to {} (attempt {})", conn.shared.id, service, attempt);

        let params = ConnectParams {
            client_id: &conn.shared.id,
            service,
            credentials: service_credentials(service, conn.credentials.as_ref()),
            security: &conn.security,
            events: events.clone(),
        };

        match engine.connect(params).await {
            Ok(()) => return Ok(service.clone()),
            Err(e) => {
                let err = ClientError::from_engine(e);

                warn!("Client {} cannot connect to {}: {}", conn.shared.id, service, err);

                if !err.kind.is_recoverable() {
                    return Err(err);
                }

                last_error = err;
            }
        }
    }

    Err(last_error)
}

async fn serve(
    engine: &mut OwnedMutexGuard<Box<dyn Engine>>,
    conn: &mut Connection,
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
) -> Outcome {
    loop {
        tokio::select! {
            biased;

            _ = conn.cancel.cancelled() => return Outcome::Cancelled,
            event = events.recv() => match event {
                Some(EngineEvent::Disconnected(err)) => return Outcome::Lost(err),
                Some(EngineEvent::Error(err)) => {
                    warn!("Client {} engine error: {}", conn.shared.id, err);

                    conn.shared.record_error(err);
                }
                None => {
                    return Outcome::Lost(ClientError::new(ErrorKind::Network, "engine dropped the connection"))
                }
            },
            command = conn.commands.recv() => match command {
                Some(command) => dispatcher::execute(&mut ***engine, command, &conn.cancel).await,
                None => return Outcome::Cancelled,
            },
        }
    }
}

/// Attach the links of the registered destinations again after a reconnect.
async fn resubscribe(engine: &mut OwnedMutexGuard<Box<dyn Engine>>, shared: &SharedState) {
    for destination in shared.destinations.snapshot() {
        debug!("Client {} resubscribes to {}", shared.id, destination.key);

        if let Err(e) = engine.subscribe(&destination).await {
            let err = ClientError::from_engine(e);

            error!("Client {} cannot resubscribe to {}: {}", shared.id, destination.key, err);

            shared.record_error(err);
        }
    }
}

async fn close_engine(engine: &mut OwnedMutexGuard<Box<dyn Engine>>, id: &str) {
    match tokio::time::timeout(CLOSE_GRACE, engine.close()).await {
        Ok(Ok(())) => debug!("Client {} closed the connection", id),
        Ok(Err(e)) => warn!("Client {} close failed: {:?}", id, e),
        Err(_) => warn!("Client {} could not close the connection in {:?}", id, CLOSE_GRACE),
    }
}
