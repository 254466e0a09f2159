use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use signalhub_sdk::{LifecycleEventKind, RtClient};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_id = "REPLACE_WITH_APP_ID".to_string();
    let token = "REPLACE_WITH_BEARER_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RtClient::new(app_id)?;
        client.update_token(SecretString::new(token));

        client.add_lifecycle_listener(
            LifecycleEventKind::Disconnected,
            Arc::new(|_| {
                println!("connection lost, recovery is automatic");
            }),
        );

        client.connect().await?;
        println!("connected");

        let table = client.table("Person");
        table
            .add_created_listener(
                Some("age > 18"),
                Arc::new(|payload| match payload {
                    Ok(row) => println!("created: {row}"),
                    Err(err) => println!("delivery error: {err}"),
                }),
            )
            .await?;

        let channel = client.channel("lobby");
        channel.join().await?;
        channel
            .add_message_listener(
                None,
                Arc::new(|payload| {
                    if let Ok(message) = payload {
                        println!("lobby: {message}");
                    }
                }),
            )
            .await?;

        tokio::time::sleep(Duration::from_secs(60)).await;
        client.disconnect().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
