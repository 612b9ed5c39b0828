use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use relay_api::config::Config;
use relay_api::hub::registry::HubHandle;
use relay_api::hub::{server, subscriber};
use relay_api::push::{ExpoPushClient, PushProvider};
use relay_api::storage::{MemoryObjectStore, ObjectStore};
use relay_api::store::{CoordStore, MemoryStore};
use relay_api::AppState;

const SECRET: &str = "integration-secret";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a server instance over a shared in-memory store. The database pool
/// is lazy and points nowhere; these tests never reach it.
async fn start_server(store: Arc<MemoryStore>, instance_id: &str) -> (SocketAddr, AppState) {
    let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<
        diesel_async::AsyncPgConnection,
    >::new("postgres://unused/unused");
    let db = diesel_async::pooled_connection::deadpool::Pool::builder(manager)
        .max_size(1)
        .build()
        .expect("pool builder");

    let store: Arc<dyn CoordStore> = store;
    let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
    let push: Arc<dyn PushProvider> = Arc::new(ExpoPushClient::new(None));

    let (subs_tx, subs_rx) = mpsc::unbounded_channel();
    let hub = HubHandle::spawn(subs_tx);
    tokio::spawn(subscriber::run(
        store.clone(),
        hub.clone(),
        subs_rx,
        CancellationToken::new(),
    ));

    let state = AppState {
        db,
        store,
        objects,
        push,
        hub,
        config: Arc::new(Config {
            database_url: "postgres://unused/unused".to_string(),
            redis_url: "redis://unused".to_string(),
            auth_secret: SECRET.to_string(),
            instance_id: instance_id.to_string(),
            port: 0,
            expo_access_token: None,
        }),
    };

    let app = server::router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Connect, authenticate, and return the stream after READY.
async fn connect_and_auth(addr: SocketAddr, user_id: &str) -> WsStream {
    let url = format!("ws://{addr}/realtime");
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    let (mut write, mut read) = ws_stream.split();

    let token = relay_api::auth::mint_token(SECRET, user_id, 60);
    let auth = serde_json::json!({ "type": "auth", "token": token });
    write
        .send(tungstenite::Message::Text(auth.to_string().into()))
        .await
        .expect("send auth");

    let ready = read_json(&mut read).await;
    assert_eq!(ready["type"], "ready");
    assert_eq!(ready["user_id"], user_id);
    assert!(ready["heartbeat_interval"].as_u64().unwrap() > 0);

    read.reunite(write).expect("reunite")
}

async fn read_json(
    read: &mut (impl StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    let msg = time::timeout(Duration::from_secs(5), read.next())
        .await
        .expect("timeout waiting for frame")
        .expect("stream ended")
        .expect("ws read error");
    let text = msg.into_text().expect("not text");
    serde_json::from_str(&text).expect("parse frame")
}

async fn wait_for_presence(store: &MemoryStore, user_id: &str, expected: Option<&str>) {
    for _ in 0..50 {
        let current = store
            .get(&format!("presence:{user_id}"))
            .await
            .unwrap();
        if current.as_deref() == expected {
            return;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    panic!("presence for {user_id} never became {expected:?}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_returns_ready_and_announces_presence() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_server(store.clone(), "ins_a").await;

    let _ws = connect_and_auth(addr, "usr_alpha").await;

    wait_for_presence(&store, "usr_alpha", Some("ins_a")).await;
    assert_eq!(
        store.smembers("instance:ins_a:clients").await.unwrap(),
        vec!["usr_alpha"]
    );
}

#[tokio::test]
async fn invalid_token_is_rejected_with_auth_close() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_server(store, "ins_a").await;

    let url = format!("ws://{addr}/realtime");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let auth = serde_json::json!({ "type": "auth", "token": "not-a-jwt" });
    ws.send(tungstenite::Message::Text(auth.to_string().into()))
        .await
        .expect("send auth");

    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("read error");
    match msg {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4004);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn first_frame_must_be_auth() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_server(store, "ins_a").await;

    let url = format!("ws://{addr}/realtime");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    ws.send(tungstenite::Message::Text(
        serde_json::json!({ "type": "heartbeat" }).to_string().into(),
    ))
    .await
    .expect("send heartbeat");

    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout")
        .expect("stream ended")
        .expect("read error");
    match msg {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4003);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_is_acknowledged() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_server(store, "ins_a").await;

    let mut ws = connect_and_auth(addr, "usr_alpha").await;
    ws.send(tungstenite::Message::Text(
        serde_json::json!({ "type": "heartbeat" }).to_string().into(),
    ))
    .await
    .expect("send heartbeat");

    let ack = read_json(&mut ws).await;
    assert_eq!(ack["type"], "heartbeat_ack");
}

#[tokio::test]
async fn published_message_reaches_connected_member() {
    let store = Arc::new(MemoryStore::new());
    store.sadd("user:usr_alpha:groups", "grp_1").await.unwrap();
    let (addr, _state) = start_server(store.clone(), "ins_a").await;

    let mut ws = connect_and_auth(addr, "usr_alpha").await;
    // Let the subscriber pick up the group channel.
    time::sleep(Duration::from_millis(100)).await;

    let envelope = serde_json::json!({
        "id": "msg_1",
        "group_id": "grp_1",
        "messageType": 1,
        "msgNonce": "bm9uY2U=",
        "ciphertext": "Y2lwaGVy",
        "envelopes": [{
            "deviceId": "dev_1",
            "ephPubKey": "cHVi",
            "keyNonce": "a25vbmNl",
            "sealedKey": "c2VhbGVk",
        }],
    });
    store
        .publish("group:grp_1:messages", &envelope.to_string())
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["id"], "msg_1");
    assert_eq!(frame["group_id"], "grp_1");
    assert_eq!(frame["envelopes"][0]["deviceId"], "dev_1");
}

#[tokio::test]
async fn lifecycle_event_reaches_connected_member() {
    let store = Arc::new(MemoryStore::new());
    store.sadd("user:usr_alpha:groups", "grp_1").await.unwrap();
    let (addr, _state) = start_server(store.clone(), "ins_a").await;

    let mut ws = connect_and_auth(addr, "usr_alpha").await;
    time::sleep(Duration::from_millis(100)).await;

    store
        .publish(
            "events",
            &serde_json::json!({ "event": "group_updated", "group_id": "grp_1" }).to_string(),
        )
        .await
        .unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame["type"], "lifecycle");
    assert_eq!(frame["event"], "group_updated");
    assert_eq!(frame["group_id"], "grp_1");
}

#[tokio::test]
async fn send_into_foreign_group_is_forbidden() {
    let store = Arc::new(MemoryStore::new());
    store.sadd("group:grp_1:members", "usr_other").await.unwrap();
    let (addr, _state) = start_server(store, "ins_a").await;

    let mut ws = connect_and_auth(addr, "usr_alpha").await;

    let frame = serde_json::json!({
        "type": "message",
        "id": "msg_1",
        "group_id": "grp_1",
        "messageType": 1,
        "msgNonce": "bg==",
        "ciphertext": "Yw==",
        "envelopes": [],
    });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send message");

    let error = read_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "forbidden");
}

#[tokio::test]
async fn reconnect_elsewhere_wins_the_presence_record() {
    let store = Arc::new(MemoryStore::new());
    let (addr_a, _state_a) = start_server(store.clone(), "ins_a").await;
    let (addr_b, _state_b) = start_server(store.clone(), "ins_b").await;

    let ws_a = connect_and_auth(addr_a, "usr_alpha").await;
    wait_for_presence(&store, "usr_alpha", Some("ins_a")).await;

    // Same user reconnects through the other instance.
    let _ws_b = connect_and_auth(addr_b, "usr_alpha").await;
    wait_for_presence(&store, "usr_alpha", Some("ins_b")).await;

    // The old connection's teardown must not retract the new record.
    drop(ws_a);
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.get("presence:usr_alpha").await.unwrap().as_deref(),
        Some("ins_b")
    );
}

#[tokio::test]
async fn disconnect_retracts_presence() {
    let store = Arc::new(MemoryStore::new());
    let (addr, _state) = start_server(store.clone(), "ins_a").await;

    let ws = connect_and_auth(addr, "usr_alpha").await;
    wait_for_presence(&store, "usr_alpha", Some("ins_a")).await;

    drop(ws);
    wait_for_presence(&store, "usr_alpha", None).await;
    assert!(store
        .smembers("instance:ins_a:clients")
        .await
        .unwrap()
        .is_empty());
}
