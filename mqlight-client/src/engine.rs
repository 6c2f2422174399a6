//! Interface of the AMQP protocol engine the client drives.
//!
//! The client never talks to the network directly. An `Engine` implementation encodes and
//! decodes AMQP, handles TLS and SASL and reports connection problems. The engine is owned by
//! the connection manager of a client, so it is only ever used from one task and never by two
//! commands at the same time.
//!
//! Errors returned by the engine should be [`ClientError`](crate::ClientError)s: `Security` for
//! rejected credentials or certificates (the client stops), `Network` for transport failures
//! (the client retries). Any other error is treated as a network failure.

use crate::destination::Destination;
use crate::error::ClientError;
use crate::model::{Delivery, OutboundMessage};
use crate::options::{Credentials, SecurityOptions};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

/// Something the engine noticed outside of a request.
#[derive(Debug)]
pub enum EngineEvent {
    /// The connection is lost, the client goes to `retrying`.
    Disconnected(ClientError),
    /// A non fatal problem, it is logged and recorded as the last error.
    Error(ClientError),
}

/// Channel through which the engine reports `EngineEvent`s of a connection.
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// Everything the engine needs for opening a connection.
#[derive(Debug)]
pub struct ConnectParams<'a> {
    pub client_id: &'a str,
    pub service: &'a Url,
    pub credentials: Option<Credentials>,
    pub security: &'a SecurityOptions,
    /// Events of the new connection have to be sent here. The engine must keep the sink for as
    /// long as the connection is open, even if it never reports anything: dropping every clone
    /// of it counts as a lost connection and the client reconnects. Once the connection is
    /// replaced or closed the sink can be dropped.
    pub events: EventSink,
}

#[async_trait]
pub trait Engine: Send {
    /// Open a connection to one service. Replaces any previous connection.
    async fn connect(&mut self, params: ConnectParams<'_>) -> Result<()>;

    /// Send a message, returns when the message is accepted by the server (or written out
    /// in case of qos 0).
    async fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Attach a link to a destination.
    async fn subscribe(&mut self, destination: &Destination) -> Result<()>;

    /// Detach from a destination. `ttl` 0 asks the server to delete the destination.
    async fn unsubscribe(&mut self, destination: &Destination, ttl: Option<u64>) -> Result<()>;

    /// Wait for the next message of a destination. This future is dropped when the receive
    /// times out or the client stops, so it must not lose a message when cancelled.
    async fn receive(&mut self, destination: &Destination) -> Result<Delivery>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}
