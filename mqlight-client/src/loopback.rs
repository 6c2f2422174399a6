//! In-process broker and engine.
//!
//! `Broker` keeps destinations and messages in memory and `LoopbackEngine` implements the
//! [`Engine`] trait on top of it, so clients can be exercised without a server. Several engines
//! (clients) can share one broker. It supports topic wildcards, private and shared destinations,
//! message expiry and credential checks. It can also simulate refused connections, refused
//! unsubscribes and dropped connections.
//!
//! ```no_run
//! use mqlight_client::{loopback::Broker, Client, ClientOptions, ReceiveOptions, SendOptions, SubscribeOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let broker = Broker::new();
//!     let client = Client::new(["amqp://localhost"], ClientOptions::default(), broker.engine())?;
//!
//!     client.subscribe("greetings", SubscribeOptions::default())?;
//!     client.send("greetings", "hello", SendOptions::default())?;
//!
//!     let delivery = client.receive("greetings", ReceiveOptions::default())?;
//!     println!("{:?}", delivery.and_then(|d| d.data().map(str::to_owned)));
//!
//!     Ok(())
//! }
//! ```

use crate::client_error;
use crate::destination::{topic_matches, Destination, DestinationKey};
use crate::engine::{ConnectParams, Engine, EngineEvent, EventSink};
use crate::error::{ClientError, ErrorKind};
use crate::model::{Delivery, OutboundMessage, Qos};
use crate::options::Credentials;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Owner {
    Client(String),
    Share(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct QueueKey {
    topic_pattern: String,
    owner: Owner,
}

impl QueueKey {
    fn new(key: &DestinationKey, client_id: &str) -> Self {
        let owner = match &key.share {
            Some(share) => Owner::Share(share.clone()),
            None => Owner::Client(client_id.to_owned()),
        };

        Self {
            topic_pattern: key.topic_pattern.clone(),
            owner,
        }
    }
}

struct StoredMessage {
    delivery: Delivery,
    expires: Option<Instant>,
}

struct Queue {
    messages: VecDeque<StoredMessage>,
    qos: Qos,
    ttl: u64,
    subscribers: usize,
    notify: Arc<Notify>,
}

struct Connection {
    client_id: String,
    events: EventSink,
    closed: CancellationToken,
    subscriptions: HashSet<QueueKey>,
}

#[derive(Default)]
struct BrokerInner {
    credentials: Option<Credentials>,
    failing_connects: u32,
    refused_unsubscribes: u32,
    connect_attempts: u64,
    next_connection: u64,
    queues: HashMap<QueueKey, Queue>,
    connections: HashMap<u64, Connection>,
}

impl BrokerInner {
    /// Drop a subscription of a connection. The queue is deleted when nobody subscribes to it
    /// anymore and it doesn't have to be kept.
    fn release(&mut self, key: &QueueKey, delete_now: bool) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.subscribers = queue.subscribers.saturating_sub(1);

            if queue.subscribers == 0 && (delete_now || queue.ttl == 0) {
                debug!("Deleting destination {:?}", key);

                self.queues.remove(key);
            }
        }
    }
}

/// An in-memory message broker.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only clients presenting these credentials are accepted.
    pub fn with_credentials(self, user: &str, password: &str) -> Self {
        self.lock().credentials = Some(Credentials {
            user: user.to_owned(),
            password: password.to_owned(),
        });
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new engine connecting to this broker.
    pub fn engine(&self) -> LoopbackEngine {
        LoopbackEngine {
            broker: self.clone(),
            connection: None,
        }
    }

    /// The next `n` connection attempts are refused with a network error.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// The next `n` unsubscribes are refused, the subscriptions stay in place.
    pub fn refuse_next_unsubscribes(&self, n: u32) {
        self.lock().refused_unsubscribes = n;
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Drop every connection as if the network failed. The destinations are kept, so clients
    /// can resubscribe to them.
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();

        info!("Dropping {} connections", inner.connections.len());

        for (_, connection) in inner.connections.drain().collect::<Vec<_>>() {
            connection.closed.cancel();

            for key in &connection.subscriptions {
                if let Some(queue) = inner.queues.get_mut(key) {
                    queue.subscribers = queue.subscribers.saturating_sub(1);
                }
            }

            let event = EngineEvent::Disconnected(ClientError::new(ErrorKind::Network, "connection reset by broker"));

            if connection.events.send(event).is_err() {
                debug!("Client {} doesn't listen to events", connection.client_id);
            }
        }
    }

    /// Number of messages waiting in a destination. Private destinations belong to `client_id`.
    pub fn pending(&self, key: &DestinationKey, client_id: &str) -> usize {
        self.lock()
            .queues
            .get(&QueueKey::new(key, client_id))
            .map_or(0, |q| q.messages.len())
    }

    pub fn has_destination(&self, key: &DestinationKey, client_id: &str) -> bool {
        self.lock().queues.contains_key(&QueueKey::new(key, client_id))
    }

    pub fn subscribers(&self, key: &DestinationKey, client_id: &str) -> usize {
        self.lock()
            .queues
            .get(&QueueKey::new(key, client_id))
            .map_or(0, |q| q.subscribers)
    }
}

/// `Engine` implementation talking to a `Broker`.
pub struct LoopbackEngine {
    broker: Broker,
    /// Id of the open connection and its close signal.
    connection: Option<(u64, String, CancellationToken)>,
}

impl LoopbackEngine {
    fn live(&self) -> Result<(u64, String, CancellationToken)> {
        match &self.connection {
            Some((id, client_id, closed)) if !closed.is_cancelled() => Ok((*id, client_id.clone(), closed.clone())),
            _ => client_error!(Network, "not connected"),
        }
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    async fn connect(&mut self, params: ConnectParams<'_>) -> Result<()> {
        let mut inner = self.broker.lock();

        inner.connect_attempts += 1;

        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;

            return client_error!(Network, format!("connection to {} refused", params.service));
        }

        if let Some(expected) = &inner.credentials {
            if params.credentials.as_ref() != Some(expected) {
                return client_error!(Security, "authentication failed");
            }
        }

        if let Some((old, _, closed)) = self.connection.take() {
            closed.cancel();
            inner.connections.remove(&old);
        }

        inner.next_connection += 1;

        let id = inner.next_connection;
        let closed = CancellationToken::new();

        inner.connections.insert(
            id,
            Connection {
                client_id: params.client_id.to_owned(),
                events: params.events,
                closed: closed.clone(),
                subscriptions: HashSet::new(),
            },
        );

        debug!("Client {} connected as #{}", params.client_id, id);

        self.connection = Some((id, params.client_id.to_owned(), closed));

        Ok(())
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        self.live()?;

        let mut inner = self.broker.lock();
        let expires = message.ttl.map(|ttl| Instant::now() + Duration::from_millis(ttl));

        for (key, queue) in inner.queues.iter_mut() {
            if !topic_matches(&key.topic_pattern, &message.topic) {
                continue;
            }

            let share = match &key.owner {
                Owner::Share(s) => Some(s.clone()),
                Owner::Client(_) => None,
            };

            queue.messages.push_back(StoredMessage {
                delivery: Delivery {
                    topic: message.topic.clone(),
                    body: message.body.clone(),
                    content_type: message.content_type,
                    topic_pattern: key.topic_pattern.clone(),
                    share,
                    qos: std::cmp::min_by_key(message.qos, queue.qos, |q| *q as u8),
                    ttl: message.ttl,
                },
                expires,
            });
            queue.notify.notify_one();
        }

        Ok(())
    }

    async fn subscribe(&mut self, destination: &Destination) -> Result<()> {
        let (id, client_id, _) = self.live()?;
        let key = QueueKey::new(&destination.key, &client_id);
        let mut inner = self.broker.lock();

        let fresh = match inner.connections.get_mut(&id) {
            Some(connection) => connection.subscriptions.insert(key.clone()),
            None => return client_error!(Network, "connection is closed"),
        };

        let queue = inner.queues.entry(key).or_insert_with(|| Queue {
            messages: VecDeque::new(),
            qos: destination.qos,
            ttl: destination.ttl,
            subscribers: 0,
            notify: Arc::new(Notify::new()),
        });

        queue.ttl = destination.ttl;

        if fresh {
            queue.subscribers += 1;
        }

        Ok(())
    }

    async fn unsubscribe(&mut self, destination: &Destination, ttl: Option<u64>) -> Result<()> {
        let (id, client_id, _) = self.live()?;
        let key = QueueKey::new(&destination.key, &client_id);
        let mut inner = self.broker.lock();

        if inner.refused_unsubscribes > 0 {
            inner.refused_unsubscribes -= 1;

            return client_error!(Internal, format!("unsubscribe from {} refused", destination.key));
        }

        let removed = match inner.connections.get_mut(&id) {
            Some(connection) => connection.subscriptions.remove(&key),
            None => return client_error!(Network, "connection is closed"),
        };

        if !removed {
            return client_error!(Unsubscribed, format!("not subscribed to {}", destination.key));
        }

        inner.release(&key, ttl == Some(0));

        Ok(())
    }

    async fn receive(&mut self, destination: &Destination) -> Result<Delivery> {
        let (_, client_id, closed) = self.live()?;
        let key = QueueKey::new(&destination.key, &client_id);

        loop {
            let notify = {
                let mut inner = self.broker.lock();
                let queue = match inner.queues.get_mut(&key) {
                    Some(q) => q,
                    None => return client_error!(Unsubscribed, format!("destination {} is gone", destination.key)),
                };
                let now = Instant::now();

                while let Some(stored) = queue.messages.pop_front() {
                    if stored.expires.map_or(false, |e| e <= now) {
                        debug!("Message on {} expired", stored.delivery.topic);
                        continue;
                    }

                    return Ok(stored.delivery);
                }

                queue.notify.clone()
            };

            tokio::select! {
                _ = notify.notified() => (),
                _ = closed.cancelled() => return client_error!(Network, "connection lost"),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some((id, _, closed)) = self.connection.take() {
            closed.cancel();

            let mut inner = self.broker.lock();

            if let Some(connection) = inner.connections.remove(&id) {
                for key in &connection.subscriptions {
                    inner.release(key, false);
                }
            }
        }

        Ok(())
    }
}
