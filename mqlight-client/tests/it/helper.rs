use anyhow::Result;
use mqlight_client::loopback::Broker;
use mqlight_client::{Client, ClientError, ClientOptions, ClientState, ErrorKind, RetryPolicy};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const SERVICE: &str = "amqp://localhost:5672";

/// Retry quickly so that the reconnection tests don't wait for seconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 20,
        max_delay_ms: 100,
        max_retries: None,
    }
}

#[allow(dead_code)]
pub fn connect(broker: &Broker, id: &str) -> Result<Client> {
    Client::new([SERVICE], ClientOptions::default().id(id).retry(fast_retry()), broker.engine())
}

/// State transitions seen by an observer.
#[derive(Clone, Default)]
pub struct Transitions {
    seen: Arc<Mutex<Vec<(ClientState, Option<ErrorKind>)>>>,
}

#[allow(dead_code)]
impl Transitions {
    pub fn states(&self) -> Vec<ClientState> {
        self.seen.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn errors(&self) -> Vec<ErrorKind> {
        self.seen.lock().unwrap().iter().filter_map(|(_, e)| *e).collect()
    }
}

#[allow(dead_code)]
pub fn connect_observed(broker: &Broker, options: ClientOptions) -> Result<(Client, Transitions)> {
    let transitions = Transitions::default();
    let seen = transitions.seen.clone();

    let client = Client::with_observer([SERVICE], options, broker.engine(), move |state, err| {
        seen.lock().unwrap().push((state, err.map(|e| e.kind)));
    })?;

    Ok((client, transitions))
}

/// Poll `condition` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let until = Instant::now() + timeout;

    while Instant::now() < until {
        if condition() {
            return true;
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    condition()
}

#[allow(dead_code)]
pub(crate) fn to_client_error<T: std::fmt::Debug>(result: Result<T>) -> ClientError {
    result.unwrap_err().downcast::<ClientError>().unwrap()
}
