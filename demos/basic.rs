use anyhow::Result;
use mqlight_client::loopback::Broker;
use mqlight_client::{Client, ClientOptions, ReceiveOptions, SendOptions, SubscribeOptions, UnsubscribeOptions};
use std::time::Duration;

fn main() -> Result<()> {
    let topic = "news/technology";

    mqlight_client::setup_logger();

    let broker = Broker::new();
    let client = Client::new(["amqp://localhost:5672"], ClientOptions::default().id("client1"), broker.engine())?;

    client.subscribe("news/#", SubscribeOptions::default())?;
    client.send(topic, "Hello World!", SendOptions::default().qos(1))?;

    if let Some(delivery) = client.receive("news/#", ReceiveOptions::default().timeout(Duration::from_secs(1)))? {
        println!("{} -> {}", delivery.topic, delivery.data().unwrap_or("<binary>"));
    }

    client.unsubscribe("news/#", UnsubscribeOptions::default())?;
    client.stop();

    Ok(())
}
