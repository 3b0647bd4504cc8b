//! End-to-end scenarios over real WebSocket connections on localhost.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sockeye::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn start_server(server: &Server<WebsocketTransport>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = server.clone();
    tokio::spawn(async move { srv.serve(listener).await });
    format!("ws://{addr}/")
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_roundtrip_shutdown() {
    let transport = WebsocketTransport::default();
    let server = Server::new(
        transport.clone(),
        ServerConfig::new().with_error_handler(|err| tracing::debug!(%err, "server error")),
    );

    server.on(ON_CONNECTION, |channel, ()| async move {
        tracing::debug!(sid = %channel.id(), "client connected");
    });
    server.on(ON_DISCONNECTION, |channel, ()| async move {
        tracing::debug!(sid = %channel.id(), "client disconnected");
    });
    server.on("MyMethod", |channel, msg: String| async move {
        assert_eq!(msg, "Hello");
        channel
            .emit("MyMethod", &"Goodbye")
            .await
            .expect("reply emit");
    });

    let url = start_server(&server).await;
    let client = Client::dial(&url, &transport).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.on("MyMethod", move |_channel, msg: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });

    client.emit("MyMethod", &"Hello").await.unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("reply within 200ms")
        .expect("reply delivered");
    assert_eq!(reply, "Goodbye");

    // The client is still connected when shutdown runs.
    server.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.num_tasks(), 0);

    client.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ack_roundtrip_and_timeout() {
    let transport = WebsocketTransport::default();
    let server = Server::new(transport.clone(), ServerConfig::new());
    server.on(ON_CONNECTION, |_channel, ()| async {});
    server.on_with_result("ping", |_channel, ()| async { 42 });

    let url = start_server(&server).await;
    let client = Client::dial(&url, &transport).await.unwrap();

    let payload = client
        .ack("ping", &(), Duration::from_millis(500))
        .await
        .unwrap();
    let answer: i32 = serde_json::from_str(&payload).unwrap();
    assert_eq!(answer, 42);

    let err = client
        .ack("nonexistent", &(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AckTimeout), "got {err}");

    client.close().await;
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_connected_clients() {
    let transport = WebsocketTransport::default();

    let disconnections = Arc::new(AtomicUsize::new(0));
    let count = disconnections.clone();
    let server = Server::new(transport.clone(), ServerConfig::new());
    server.on(ON_CONNECTION, |_channel, ()| async {});
    server.on(ON_DISCONNECTION, move |_channel, ()| {
        count.fetch_add(1, Ordering::SeqCst);
        async {}
    });

    let url = start_server(&server).await;

    let client_a = Client::dial(&url, &transport).await.unwrap();
    let client_b = Client::dial(&url, &transport).await.unwrap();

    let client_drops = Arc::new(AtomicUsize::new(0));
    for client in [&client_a, &client_b] {
        let drops = client_drops.clone();
        client.on(ON_DISCONNECTION, move |_channel, ()| {
            drops.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    }

    // Both sessions are idle; wait until the server has stored both sids.
    tokio::time::timeout(Duration::from_secs(1), async {
        while server.amount_of_sids() != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both clients attach");

    server.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(server.num_tasks(), 0);
    assert_eq!(disconnections.load(Ordering::SeqCst), 2);

    // Each client observes its own disconnect.
    tokio::time::timeout(Duration::from_secs(1), async {
        while client_drops.load(Ordering::SeqCst) != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients observe the disconnect");
    assert!(!client_a.is_alive());
    assert!(!client_b.is_alive());
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_reaches_room_members_only() {
    let transport = WebsocketTransport::default();
    let server = Server::new(transport.clone(), ServerConfig::new());
    server.on(ON_CONNECTION, |channel, ()| async move {
        channel.join("lobby").ok();
    });
    server.on("shout", |channel, text: String| async move {
        channel.broadcast_to("lobby", "heard", &text);
    });

    let url = start_server(&server).await;

    let listener = Client::dial(&url, &transport).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    listener.on("heard", move |_channel, text: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(text);
        }
    });

    let shouter = Client::dial(&url, &transport).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while server.amount("lobby") != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both clients join the lobby");

    shouter.emit("shout", &"hi room").await.unwrap();

    let heard = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("broadcast delivered")
        .unwrap();
    assert_eq!(heard, "hi room");

    listener.close().await;
    shouter.close().await;
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn client_session_id_comes_from_the_open_frame() {
    let transport = WebsocketTransport::default();
    let server = Server::new(transport.clone(), ServerConfig::new());
    server.on(ON_CONNECTION, |_channel, ()| async {});

    let url = start_server(&server).await;
    let client = Client::dial(&url, &transport).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while client.id().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("open frame assigns the sid");

    assert_eq!(client.id().len(), 20);
    assert!(server.get_channel(&client.id()).is_ok());

    client.close().await;
    server.shutdown(Duration::from_secs(1)).await.unwrap();
}
