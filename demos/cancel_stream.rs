use std::error::Error;
use std::time::Duration;

use serde_json::{json, Value};
use threadlink::observable::{ObservableError, StreamProducer};
use threadlink::retry::with_timeout;
use threadlink::transport::memory::MemoryHub;
use threadlink::{Address, Client, Service};

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let hub = MemoryHub::new();
        let service = Service::builder(Address::new("counter-service"))
            .observable("counter", |producer: StreamProducer, _args: Value| async move {
                producer.set_cancel_handler(|reason: Value| async move {
                    Ok::<Value, Value>(json!({ "stopped": true, "reason": reason }))
                });
                let mut count = 0u64;
                while producer.write(count).is_ok() {
                    count += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok::<(), ObservableError>(())
            })
            .build();
        service.spawn(hub.attach(Address::new("counter-service")));

        let client = Client::connect(
            hub.attach(Address::new("counter-client")),
            Address::new("counter-service"),
        );
        let observable = client.observable("counter", Value::Null)?;
        observable.listen(|data| println!("count {data}"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = with_timeout(Duration::from_secs(1), observable.cancel("enough")).await??;
        println!("canceled {outcome}");
        println!("active producers {}", service.active_streams());

        Ok::<(), Box<dyn Error>>(())
    })
}
