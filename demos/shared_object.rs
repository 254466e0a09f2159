use std::error::Error;
use std::sync::Arc;

use serde_json::{json, Value};
use signalhub_sdk::rso::InvocationTarget;
use signalhub_sdk::{RtClient, RtError};

struct Printer;

impl InvocationTarget for Printer {
    fn invoke(&self, method: &str, args: &[Value]) -> Result<(), RtError> {
        println!("peer invoked {method} with {args:?}");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let app_id = "REPLACE_WITH_APP_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RtClient::new(app_id)?;
        let counter = client.shared_object_with_target("counter", Arc::new(Printer));

        counter.connect().await?;
        println!("session ready");

        counter
            .add_changes_listener(Arc::new(|payload| {
                if let Ok(change) = payload {
                    println!("changed: {change}");
                }
            }))
            .await?;

        counter.set("count", json!(1)).await?;
        let value = counter.get("count").await?;
        println!("count = {value}");

        counter.invoke("refresh", vec![json!("now")]).await?;
        counter.send("announce", json!({"text": "hello"})).await?;

        counter.disconnect();
        client.disconnect().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
