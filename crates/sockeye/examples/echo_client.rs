//! Echo client: emits an event, waits for the echo, then round-trips an
//! ack.

use std::time::Duration;

use sockeye::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let transport = WebsocketTransport::default();
    let client = Client::dial("ws://127.0.0.1:4000/", &transport).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.on("echo", move |_channel, text: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(text);
        }
    });
    client.on(ON_DISCONNECTION, |_channel, ()| async {
        tracing::info!("server went away");
    });

    client.emit("echo", &"hello over the wire").await?;
    if let Some(reply) = rx.recv().await {
        tracing::info!(%reply, "echoed");
    }

    let pong = client.ack("ping", &(), Duration::from_millis(500)).await?;
    tracing::info!(%pong, "ack answered");

    client.close().await;
    Ok(())
}
