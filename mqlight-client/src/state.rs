//! State shared by the blocking API and the connection manager of one client.
//!
//! The connection manager is the one which drives the transitions, the API side only reads the
//! state (apart from `stopped -> starting` when it starts a new connection manager and the forced
//! `stopped` when the manager cannot be joined). Every transition is published on a `watch`
//! channel, so the blocking calls can wait for a state without polling, and queued to the
//! callback thread for the observer.

use crate::callback::{Notification, NotificationSink};
use crate::destination::DestinationRegistry;
use crate::error::ClientError;
use crate::model::ClientState;
use log::{debug, info};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use url::Url;

struct Inner {
    state: ClientState,
    last_error: Option<ClientError>,
    reconnects: u64,
    service: Option<Url>,
    notifications: Option<NotificationSink>,
}

pub(crate) struct SharedState {
    pub(crate) id: String,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ClientState>,
    pub(crate) destinations: DestinationRegistry,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();

        write!(
            f,
            "SharedState {{ id={}, state={}, reconnects={} }}",
            self.id, inner.state, inner.reconnects
        )
    }
}

impl SharedState {
    pub(crate) fn new(id: String, notifications: Option<NotificationSink>) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Stopped);

        Self {
            id,
            inner: Mutex::new(Inner {
                state: ClientState::Stopped,
                last_error: None,
                reconnects: 0,
                service: None,
                notifications,
            }),
            state_tx,
            destinations: DestinationRegistry::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ClientState {
        self.lock().state
    }

    pub(crate) fn last_error(&self) -> Option<ClientError> {
        self.lock().last_error.clone()
    }

    pub(crate) fn reconnects(&self) -> u64 {
        self.lock().reconnects
    }

    pub(crate) fn service(&self) -> Option<Url> {
        self.lock().service.clone()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Count a new connection attempt to `service`.
    pub(crate) fn connection_attempt(&self, service: &Url) -> u64 {
        let mut inner = self.lock();

        inner.reconnects += 1;
        inner.service = Some(service.clone());

        inner.reconnects
    }

    pub(crate) fn clear_last_error(&self) {
        self.lock().last_error = None;
    }

    pub(crate) fn record_error(&self, err: ClientError) {
        self.lock().last_error = Some(err);
    }

    /// Move to a new state. The cause, if any, becomes the last error. Transitions to the
    /// current state are ignored.
    pub(crate) fn transition(&self, state: ClientState, cause: Option<ClientError>) -> bool {
        let mut inner = self.lock();

        if inner.state == state {
            return false;
        }

        info!("Client {} {} -> {}", self.id, inner.state, state);

        inner.state = state;

        if let Some(err) = &cause {
            inner.last_error = Some(err.clone());
        }

        if state == ClientState::Stopped {
            inner.service = None;
        }

        if let Some(sink) = &inner.notifications {
            if sink.send(Notification { state, cause }).is_err() {
                debug!("Callback thread of {} is gone", self.id);
            }
        }

        // The lock is still held, so watchers see transitions in the same order as the observer.
        self.state_tx.send_replace(state);

        true
    }
}
