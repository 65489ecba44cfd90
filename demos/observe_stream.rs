use std::error::Error;
use std::time::Duration;

use serde_json::{json, Value};
use threadlink::observable::{ObservableError, StreamProducer};
use threadlink::transport::memory::MemoryHub;
use threadlink::{Address, Client, Service};

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let hub = MemoryHub::new();
        let service = Service::builder(Address::new("ticker-service"))
            .observable("ticker", |producer: StreamProducer, args: Value| async move {
                let ticks = args["ticks"].as_u64().unwrap_or(3);
                for tick in 1..=ticks {
                    producer.write(json!({ "tick": tick }))?;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                producer.close(json!({ "ticks": ticks }))?;
                Ok::<(), ObservableError>(())
            })
            .build();
        service.spawn(hub.attach(Address::new("ticker-service")));

        let client = Client::connect(
            hub.attach(Address::new("ticker-client")),
            Address::new("ticker-service"),
        );
        let observable = client.observable("ticker", json!({ "ticks": 5 }))?;
        observable.listen(|data| println!("chunk {data}"));

        let summary = observable.closed().await?;
        println!("closed {summary}");

        Ok::<(), Box<dyn Error>>(())
    })
}
