//! End-to-end runs of the client against a loopback websocket server.

use feed_types::{ConnectRequest, ConnectionOkEvent, FeedData, Fid, UserData, WsEvent};
use futures_util::{SinkExt, StreamExt};
use rtfeed_client::{ClientConfig, FeedsClient, MockFeedsApi, TokenSource, WebSocketTransport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerSocket = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener, uris: &Arc<Mutex<Vec<String>>>) -> ServerSocket {
    let (tcp, _) = listener.accept().await.unwrap();
    let uris = Arc::clone(uris);
    tokio_tungstenite::accept_hdr_async(tcp, move |req: &Request, resp: Response| {
        uris.lock().unwrap().push(req.uri().to_string());
        Ok(resp)
    })
    .await
    .unwrap()
}

async fn read_handshake(ws: &mut ServerSocket) -> ConnectRequest {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended before the handshake: {other:?}"),
        }
    }
}

async fn send(ws: &mut ServerSocket, event: &WsEvent) {
    ws.send(Message::Text(event.to_json().unwrap().into()))
        .await
        .unwrap();
}

fn confirm(connection_id: &str, request: ConnectRequest) -> WsEvent {
    WsEvent::ConnectionOk(ConnectionOkEvent {
        connection_id: connection_id.to_string(),
        created_at: 0,
        me: Some(request.user_details),
    })
}

/// Serves two sessions: the first announces a feed and then vanishes
/// without a close frame, the second stays up until the client closes it.
async fn spawn_server() -> (
    SocketAddr,
    Arc<Mutex<Vec<String>>>,
    oneshot::Receiver<Option<u16>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uris = Arc::new(Mutex::new(Vec::new()));
    let (closed_tx, closed_rx) = oneshot::channel();

    let seen = Arc::clone(&uris);
    tokio::spawn(async move {
        let mut ws = accept(&listener, &seen).await;
        let request = read_handshake(&mut ws).await;
        send(&mut ws, &confirm("ws-conn-1", request)).await;
        send(
            &mut ws,
            &WsEvent::FeedCreated {
                feed: FeedData::new(Fid::new("user", "new"), 1),
            },
        )
        .await;
        drop(ws);

        let mut ws = accept(&listener, &seen).await;
        let request = read_handshake(&mut ws).await;
        send(&mut ws, &confirm("ws-conn-2", request)).await;
        let mut code = None;
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                code = frame.map(|f| u16::from(f.code));
                break;
            }
        }
        let _ = ws.close(None).await;
        let _ = closed_tx.send(code);
    });

    (addr, uris, closed_rx)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 10s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn reconnects_and_recovers_over_a_real_socket() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rtfeed_client=debug")
        .with_test_writer()
        .try_init();
    let (addr, uris, closed) = spawn_server().await;

    let config = ClientConfig::new("key-123").with_base_url(&format!("http://{addr}"));
    let client = FeedsClient::new(config, WebSocketTransport::default(), MockFeedsApi::new());
    let recovered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&recovered);
    let _sub = client.on("connection.recovered", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let ok = client
        .connect_user(
            UserData::new("alice"),
            Some(TokenSource::Static("token".into())),
        )
        .await
        .unwrap();
    assert_eq!(ok.connection_id, "ws-conn-1");

    eventually(|| recovered.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.connection_id().as_deref(), Some("ws-conn-2"));
    assert!(client
        .active_feeds()
        .iter()
        .any(|feed| feed.fid() == &Fid::new("user", "new")));

    let uris = uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2);
    assert!(uris[0].starts_with("/api/v2/connect?api_key=key-123"));
    assert!(uris[0].contains("stream-auth-type=jwt"));

    client.disconnect_user().await;
    assert_eq!(closed.await.unwrap(), Some(1000));
}
