//! Echo server: replies to every `echo` event and answers `ping` acks.
//!
//! Run this first, then `cargo run --example echo_client`.

use std::time::Duration;

use sockeye::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let server = Server::new(
        WebsocketTransport::default(),
        ServerConfig::new()
            .with_error_handler(|err| tracing::warn!(%err, "engine error"))
            .with_recovery_handler(|channel, _panic| {
                let sid = channel.map(|c| c.id()).unwrap_or_default();
                tracing::error!(%sid, "callback panicked");
            }),
    );

    server.on(ON_CONNECTION, |channel, ()| async move {
        tracing::info!(sid = %channel.id(), ip = %channel.ip(), "connected");
        channel.join("everyone").ok();
    });
    server.on(ON_DISCONNECTION, |channel, ()| async move {
        tracing::info!(sid = %channel.id(), "disconnected");
    });
    server.on("echo", |channel, text: String| async move {
        if let Err(err) = channel.emit("echo", &text).await {
            tracing::warn!(%err, "echo failed");
        }
    });
    server.on_with_result("ping", |_channel, ()| async { "pong" });
    server.on("shout", |channel, text: String| async move {
        channel.broadcast_to("everyone", "echo", &text);
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:4000").await?;
    tracing::info!("listening on ws://127.0.0.1:4000/");

    let accept = server.clone();
    tokio::spawn(async move { accept.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
