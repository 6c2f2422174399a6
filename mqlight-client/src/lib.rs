//! Blocking MQ Light client.
//!
//! A [`Client`] sends messages to topics and receives them from destinations it subscribed to.
//! Every call blocks the calling thread, behind the scenes each client runs a small tokio
//! runtime with a connection manager task. The manager owns the AMQP [`Engine`], connects to
//! the first reachable service, reconnects with exponential backoff when the connection is
//! lost and executes the calls of the application one by one.
//!
//! The [`loopback`] module has an in-memory broker, it is handy for tests and demos.
//!
//! ```no_run
//! use mqlight_client::{loopback::Broker, Client, ClientOptions, SendOptions, SubscribeOptions, ReceiveOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     mqlight_client::setup_logger();
//!
//!     let broker = Broker::new();
//!     let client = Client::new(["amqp://localhost:5672"], ClientOptions::default(), broker.engine())?;
//!
//!     client.subscribe("sport/#", SubscribeOptions::default())?;
//!     client.send("sport/football", "goal", SendOptions::default())?;
//!
//!     let delivery = client.receive("sport/#", ReceiveOptions::default())?;
//!     println!("{:?}", delivery);
//!
//!     Ok(())
//! }
//! ```
mod callback;
pub use callback::Observer;

mod client;
pub use client::{Client, MIN_RECEIVE_TIMEOUT};

mod connection;

mod destination;
pub use destination::{topic_matches, Destination, DestinationKey};

mod dev;
pub use dev::setup_logger;

mod dispatcher;

mod engine;
pub use engine::{ConnectParams, Engine, EngineEvent, EventSink};

pub mod error;
pub use error::{error_kind, ClientError, ErrorKind};

pub mod loopback;

mod model;
pub use model::{ClientState, ContentType, Delivery, OutboundMessage, Payload, Qos, MAX_TTL};

mod options;
pub use options::{
    validate_client_id, ClientOptions, Credentials, ReceiveOptions, RetryPolicy, SecurityOptions, SendOptions,
    SubscribeOptions, UnsubscribeOptions, MAX_CLIENT_ID_LENGTH,
};

mod state;
