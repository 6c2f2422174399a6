use crate::helper::{connect, connect_observed, eventually, fast_retry, to_client_error, SERVICE};
use anyhow::Result;
use async_trait::async_trait;
use mqlight_client::loopback::{Broker, LoopbackEngine};
use mqlight_client::*;
use std::time::Duration;

/// Engine which throws away the event sink it gets on connect.
struct Forgetful(LoopbackEngine);

#[async_trait]
impl Engine for Forgetful {
    async fn connect(&mut self, params: ConnectParams<'_>) -> Result<()> {
        let (events, _) = tokio::sync::mpsc::unbounded_channel();

        self.0.connect(ConnectParams { events, ..params }).await
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        self.0.send(message).await
    }

    async fn subscribe(&mut self, destination: &Destination) -> Result<()> {
        self.0.subscribe(destination).await
    }

    async fn unsubscribe(&mut self, destination: &Destination, ttl: Option<u64>) -> Result<()> {
        self.0.unsubscribe(destination, ttl).await
    }

    async fn receive(&mut self, destination: &Destination) -> Result<Delivery> {
        self.0.receive(destination).await
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await
    }
}

#[test]
fn reconnects_and_resubscribes() {
    let broker = Broker::new();
    let options = ClientOptions::default().id("phoenix").retry(fast_retry());
    let (client, transitions) = connect_observed(&broker, options).unwrap();
    let key = DestinationKey::new("news", None);

    client.subscribe("news", SubscribeOptions::default()).unwrap();
    broker.disconnect_all();

    assert!(eventually(Duration::from_secs(5), || transitions.states().len() == 5));
    assert_eq!(
        transitions.states(),
        vec![
            ClientState::Starting,
            ClientState::Started,
            ClientState::Retrying,
            ClientState::Restarted,
            ClientState::Started
        ]
    );
    assert_eq!(transitions.errors(), vec![ErrorKind::Network]);
    assert_eq!(client.last_error().unwrap().kind, ErrorKind::Network);
    assert_eq!(client.reconnects(), 2);
    assert_eq!(broker.subscribers(&key, "phoenix"), 1);

    client.send("news", "back again", SendOptions::default()).unwrap();

    let delivery = client
        .receive("news", ReceiveOptions::default().timeout(Duration::from_secs(1)))
        .unwrap()
        .unwrap();

    assert_eq!(delivery.data(), Some("back again"));
}

#[test]
fn messages_sent_during_outage_are_kept() {
    let broker = Broker::new();
    let consumer = connect(&broker, "consumer").unwrap();

    consumer.subscribe("events", SubscribeOptions::default()).unwrap();
    broker.disconnect_all();

    let producer = connect(&broker, "producer").unwrap();
    producer.send("events", "while away", SendOptions::default()).unwrap();

    assert!(eventually(Duration::from_secs(5), || consumer.state() == ClientState::Started
        && consumer.reconnects() == 2));

    let delivery = consumer
        .receive("events", ReceiveOptions::default().timeout(Duration::from_secs(1)))
        .unwrap();

    assert_eq!(delivery.unwrap().data(), Some("while away"));
}

#[test]
fn first_connection_is_retried() {
    let broker = Broker::new();

    broker.fail_next_connects(2);

    let client = connect(&broker, "persistent").unwrap();

    assert!(eventually(Duration::from_secs(5), || client.state() == ClientState::Started));
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(client.reconnects(), 3);
}

#[test]
fn services_are_tried_in_order() {
    let broker = Broker::new();

    broker.fail_next_connects(1);

    let client = Client::new(
        ["amqp://primary:5672", "amqp://secondary:5672"],
        ClientOptions::default().retry(fast_retry()),
        broker.engine(),
    )
    .unwrap();

    assert_eq!(client.state(), ClientState::Started);
    assert_eq!(client.service().unwrap().host_str(), Some("secondary"));
    assert_eq!(broker.connect_attempts(), 2);
}

#[test]
fn gives_up_after_max_retries() {
    let broker = Broker::new();
    let retry = RetryPolicy {
        initial_delay_ms: 50,
        max_delay_ms: 50,
        max_retries: Some(2),
    };

    broker.fail_next_connects(100);

    let (client, transitions) = connect_observed(&broker, ClientOptions::default().retry(retry)).unwrap();

    assert!(eventually(Duration::from_secs(5), || client.state() == ClientState::Stopped));
    assert_eq!(client.last_error().unwrap().kind, ErrorKind::Network);
    assert_eq!(broker.connect_attempts(), 3);
    assert!(eventually(Duration::from_secs(1), || transitions.states().last()
        == Some(&ClientState::Stopped)));

    let err = to_client_error(client.send("t", "x", SendOptions::default()));
    assert_eq!(err.kind, ErrorKind::Stopped);
}

#[test]
fn connect_timeout_while_retrying_is_not_an_error() {
    let broker = Broker::new();

    broker.fail_next_connects(1);

    let options = ClientOptions::default()
        .retry(fast_retry())
        .connect_timeout(Duration::from_secs(5));
    let client = Client::new([SERVICE], options, broker.engine()).unwrap();

    assert!(matches!(client.state(), ClientState::Retrying | ClientState::Restarted | ClientState::Started));
}

#[test]
fn blocked_receive_fails_when_connection_is_lost() {
    let broker = Broker::new();
    let client = connect(&broker, "cut").unwrap();

    client.subscribe("wire", SubscribeOptions::default()).unwrap();

    std::thread::scope(|s| {
        let receiver = s.spawn(|| client.receive("wire", ReceiveOptions::default()));

        std::thread::sleep(Duration::from_millis(100));
        broker.disconnect_all();

        let err = to_client_error(receiver.join().unwrap());
        assert_eq!(err.kind, ErrorKind::Stopped);
    });

    assert!(eventually(Duration::from_secs(5), || client.state() == ClientState::Started));

    // the subscription survives the reconnect
    assert!(client
        .receive("wire", ReceiveOptions::default().timeout(Duration::ZERO))
        .unwrap()
        .is_none());
}

#[test]
fn dropped_event_sink_counts_as_lost_connection() {
    let broker = Broker::new();
    let client = Client::new(
        [SERVICE],
        ClientOptions::default().retry(fast_retry()),
        Forgetful(broker.engine()),
    )
    .unwrap();

    assert!(eventually(Duration::from_secs(5), || client.reconnects() >= 3));
    assert_eq!(client.last_error().unwrap().kind, ErrorKind::Network);
}
