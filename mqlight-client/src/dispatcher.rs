//! Commands sent by the blocking API to the connection manager.
//!
//! Every API call which needs the engine becomes a `Command` with its own one-shot reply
//! channel. Commands are queued into a FIFO channel which has only one consumer, the connection
//! manager. It executes them one by one, so the engine is never used by two commands at the same
//! time, and it replies exactly once to each of them.

use crate::client_error;
use crate::destination::Destination;
use crate::engine::Engine;
use crate::error::{error_kind, ClientError, ErrorKind};
use crate::model::{Delivery, OutboundMessage};
use anyhow::Result;
use log::{debug, trace, warn};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub(crate) enum Action {
    Send(OutboundMessage),
    Subscribe(Destination),
    /// The token is cancelled when the destination is unsubscribed meanwhile.
    Receive(Destination, CancellationToken),
    Unsubscribe(Destination, Option<u64>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Send(m) => write!(
                f,
                "Send{{topic={}, qos={:?}, type={}, len={}}}",
                m.topic,
                m.qos,
                m.content_type.mime_type(),
                m.body.len()
            ),
            Action::Subscribe(d) => write!(f, "Subscribe{{{}}}", d.key),
            Action::Receive(d, _) => write!(f, "Receive{{{}}}", d.key),
            Action::Unsubscribe(d, ttl) => write!(f, "Unsubscribe{{{}, ttl={:?}}}", d.key, ttl),
        }
    }
}

/// Successful outcome of a command.
#[derive(Debug)]
pub(crate) enum Reply {
    Done,
    /// Result of a receive, `None` if no message arrived before the deadline.
    Message(Option<Delivery>),
}

pub(crate) type Response = oneshot::Sender<Result<Reply>>;

pub(crate) struct Command {
    pub(crate) action: Action,
    /// The caller stops waiting at this point.
    pub(crate) deadline: Option<Instant>,
    pub(crate) response: Response,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command{{{:?}, deadline={:?}}}", self.action, self.deadline)
    }
}

pub(crate) type CommandSink = mpsc::UnboundedSender<Command>;
pub(crate) type CommandStream = mpsc::UnboundedReceiver<Command>;

pub(crate) fn queue() -> (CommandSink, CommandStream) {
    mpsc::unbounded_channel()
}

/// Put a command into the queue and give back the receiving end of its reply.
pub(crate) fn submit(
    sink: &CommandSink,
    action: Action,
    deadline: Option<Instant>,
) -> Result<oneshot::Receiver<Result<Reply>>> {
    let (tx, rx) = oneshot::channel();

    trace!("Submit {:?}", action);

    if sink
        .send(Command {
            action,
            deadline,
            response: tx,
        })
        .is_err()
    {
        return client_error!(Stopped, "client is not started");
    }

    Ok(rx)
}

/// Execute one command against the engine and send back the reply. The command is aborted when
/// `cancel` fires, the caller gets a `Stopped` error in that case.
pub(crate) async fn execute(engine: &mut dyn Engine, command: Command, cancel: &CancellationToken) {
    let Command {
        action,
        deadline,
        response,
    } = command;

    if response.is_closed() {
        debug!("Caller of {:?} is gone, skipping it", action);
        return;
    }

    trace!("Execute {:?}", action);

    let result = tokio::select! {
        biased;

        _ = cancel.cancelled() => client_error!(Stopped, "client is stopping"),
        r = run(engine, action, deadline) => r.map_err(connection_lost),
    };

    match response.send(result) {
        Ok(()) => {}
        Err(Ok(Reply::Message(Some(delivery)))) => {
            warn!("Message from {} is dropped, the receiver gave up", delivery.topic)
        }
        Err(_) => debug!("Reply cannot be delivered, caller is gone"),
    }
}

async fn run(engine: &mut dyn Engine, action: Action, deadline: Option<Instant>) -> Result<Reply> {
    match action {
        Action::Send(message) => {
            expired(deadline)?;

            match with_deadline(deadline, engine.send(message)).await {
                Some(r) => r.map(|_| Reply::Done),
                None => client_error!(Timeout, "send timed out"),
            }
        }
        Action::Subscribe(destination) => {
            expired(deadline)?;

            match with_deadline(deadline, engine.subscribe(&destination)).await {
                Some(r) => r.map(|_| Reply::Done),
                None => client_error!(Timeout, format!("subscribe to {} timed out", destination.key)),
            }
        }
        Action::Receive(destination, detached) => {
            tokio::select! {
                biased;

                _ = detached.cancelled() => {
                    client_error!(Unsubscribed, format!("{} was unsubscribed during receive", destination.key))
                }
                r = with_deadline(deadline, engine.receive(&destination)) => match r {
                    Some(r) => r.map(|delivery| Reply::Message(Some(delivery))),
                    None => Ok(Reply::Message(None)),
                },
            }
        }
        Action::Unsubscribe(destination, ttl) => {
            engine.unsubscribe(&destination, ttl).await?;

            Ok(Reply::Done)
        }
    }
}

fn expired(deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(d) if Instant::now() >= d => client_error!(Timeout, "deadline passed before the command was executed"),
        _ => Ok(()),
    }
}

/// Await `f` until the deadline. `None` means the deadline elapsed. The future is polled at
/// least once even if the deadline is already in the past.
async fn with_deadline<T, F>(deadline: Option<Instant>, f: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match deadline {
        None => Some(f.await),
        Some(d) => tokio::time::timeout_at(d.into(), f).await.ok(),
    }
}

/// A network failure during a command means the connection is gone, the caller sees that the
/// client is not started anymore.
fn connection_lost(err: anyhow::Error) -> anyhow::Error {
    match error_kind(&err) {
        Some(ErrorKind::Network) | None => anyhow::Error::new(ClientError::new(
            ErrorKind::Stopped,
            format!("connection lost: {}", ClientError::from_engine(err).message),
        )),
        Some(_) => err,
    }
}

/// Fail every command waiting in the queue.
pub(crate) fn reject_pending(commands: &mut CommandStream, reason: &ClientError) {
    while let Ok(command) = commands.try_recv() {
        debug!("Rejecting {:?} with {}", command, reason);

        if command.response.send(Err(anyhow::Error::new(reason.clone()))).is_err() {
            debug!("Caller is gone");
        }
    }
}
