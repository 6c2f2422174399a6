use anyhow::Result;
use log::{error, info};
use mqlight_client::loopback::Broker;
use mqlight_client::*;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    let topic = "pubsub/messages";
    let share = "workers";

    mqlight_client::setup_logger();

    let broker = Broker::new();
    let options = |id: &str| ClientOptions::default().id(id);

    let producer = Client::new(["amqp://localhost"], options("producer"), broker.engine())?;
    let consumers = (0..2)
        .map(|i| Client::new(["amqp://localhost"], options(&format!("consumer{}", i)), broker.engine()))
        .collect::<Result<Vec<_>>>()?;

    for consumer in &consumers {
        consumer.subscribe(topic, SubscribeOptions::default().share(share))?;
    }

    let message_count = 1024u32;
    let message = "This will be the test message what we send over multiple times";

    let start = Instant::now();

    std::thread::scope(|s| {
        let workers = consumers
            .iter()
            .map(|consumer| {
                s.spawn(move || {
                    let mut received = 0u32;

                    loop {
                        let options = ReceiveOptions::default().share(share).timeout(Duration::from_millis(200));

                        match consumer.receive(topic, options) {
                            Ok(Some(_)) => received += 1,
                            Ok(None) => break,
                            Err(e) => {
                                error!("Receive failed {:?}", e);
                                break;
                            }
                        }
                    }

                    received
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..message_count {
            if let Err(e) = producer.send(topic, message, SendOptions::default().qos(1)) {
                error!("Send failed {:?}", e);
            }
        }

        for (i, worker) in workers.into_iter().enumerate() {
            match worker.join() {
                Ok(received) => info!("consumer{} received {} messages", i, received),
                Err(_) => error!("consumer{} panicked", i),
            }
        }
    });

    info!("{} messages in {:?}", message_count, start.elapsed());

    Ok(())
}
