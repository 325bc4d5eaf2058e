//! Integration tests for end-to-end live view sessions.
//!
//! These tests start a real server and talk to it over real WebSockets,
//! verifying join, event round trips, pub/sub fan-out and frame dropping.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tessera_core::Parts;
use tessera_live::{
    html, CallbackResult, ChunkFrame, Envelope, Event, JsonSessionVerifier, LiveServer, LiveSocket, LiveView,
    Params, RenderMeta, Router, ServerConfig, Session, Template, UploadConfig,
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CSRF: &str = "integration-csrf";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RoomMsg {
    Said(String),
}

#[derive(Debug, Clone, Default)]
struct Room {
    count: i64,
    lines: Vec<String>,
    files: Vec<String>,
}

struct RoomView;

#[async_trait]
impl LiveView for RoomView {
    type Context = Room;
    type Info = RoomMsg;

    async fn mount(&self, _params: &Params, _session: &Session, socket: &mut LiveSocket<'_, Self>) -> CallbackResult<Room> {
        socket.subscribe("lobby");
        socket.allow_upload("doc", UploadConfig::default());
        Ok(Room::default())
    }

    fn render(&self, room: &Room, _meta: &RenderMeta<'_>) -> Template {
        html!(
            "<p>{}</p><ul>{}</ul><i>{}</i>",
            room.count,
            room.lines.iter().map(|line| html!("<li>{}</li>", line.as_str())).collect::<Vec<_>>(),
            room.files.join(",")
        )
    }

    async fn handle_event(&self, event: Event, room: &mut Room, socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
        match event.name.as_str() {
            "inc" => room.count += 1,
            "say" => {
                let text = event.get_str("text").unwrap_or_default().to_string();
                socket.broadcast("lobby", &RoomMsg::Said(text))?;
            }
            "save" => {
                for entry in socket.consume_uploaded_entries("doc") {
                    room.files.push(entry.meta.name);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_info(&self, msg: RoomMsg, room: &mut Room, _socket: &mut LiveSocket<'_, Self>) -> CallbackResult<()> {
        let RoomMsg::Said(text) = msg;
        room.lines.push(text);
        Ok(())
    }
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let upload_dir = std::env::temp_dir().join(format!("tessera-it-{port}"));
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        heartbeat_timeout_secs: 5,
        upload_dir: Some(upload_dir),
        ..ServerConfig::default()
    };
    let server = LiveServer::new(config, Router::new().route("/room", RoomView));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/live/websocket"))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv(socket: &mut Socket) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("no frame within timeout")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

async fn join(socket: &mut Socket, topic: &str) -> Envelope {
    let session = JsonSessionVerifier::token(&Session::new(CSRF)).unwrap();
    send(
        socket,
        json!(["1", "1", topic, "phx_join", {
            "url": "http://localhost/room",
            "params": {"_csrf_token": CSRF},
            "session": session,
        }]),
    )
    .await;
    recv(socket).await
}

async fn event(socket: &mut Socket, topic: &str, name: &str, value: Value) {
    send(socket, json!(["1", "2", topic, "event", {"type": "click", "event": name, "value": value}])).await;
}

#[tokio::test]
async fn test_join_and_event_round_trip() {
    let port = start_test_server().await;
    let mut socket = connect(port).await;

    let reply = join(&mut socket, "lv:room").await;
    assert_eq!(reply.event, "phx_reply");
    assert_eq!(reply.payload["status"], "ok");
    let mut client = Parts::from_value(&reply.payload["response"]["rendered"]).unwrap();
    assert_eq!(client.to_html(), "<p>0</p><ul></ul><i></i>");

    event(&mut socket, "lv:room", "inc", json!({})).await;
    let reply = recv(&mut socket).await;
    assert_eq!(reply.msg_ref.as_deref(), Some("2"));
    assert_eq!(reply.payload["response"]["diff"], json!({"0": "1"}));

    client.merge(&Parts::from_value(&reply.payload["response"]["diff"]).unwrap());
    assert_eq!(client.to_html(), "<p>1</p><ul></ul><i></i>");
}

#[tokio::test]
async fn test_heartbeat_and_malformed_frames() {
    let port = start_test_server().await;
    let mut socket = connect(port).await;

    socket.send(Message::Text("garbage".into())).await.unwrap();
    send(&mut socket, json!([null, "7", "phoenix", "heartbeat", {}])).await;

    let reply = recv(&mut socket).await;
    assert_eq!(reply.topic, "phoenix");
    assert_eq!(reply.msg_ref.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_bad_csrf_gets_no_reply() {
    let port = start_test_server().await;
    let mut socket = connect(port).await;

    let session = JsonSessionVerifier::token(&Session::new(CSRF)).unwrap();
    send(
        &mut socket,
        json!(["1", "1", "lv:room", "phx_join", {
            "url": "/room",
            "params": {"_csrf_token": "forged"},
            "session": session,
        }]),
    )
    .await;
    send(&mut socket, json!([null, "8", "phoenix", "heartbeat", {}])).await;

    // the heartbeat reply is the first thing back
    let reply = recv(&mut socket).await;
    assert_eq!(reply.topic, "phoenix");
}

#[tokio::test]
async fn test_broadcast_reaches_other_socket() {
    let port = start_test_server().await;
    let mut alice = connect(port).await;
    let mut bob = connect(port).await;
    join(&mut alice, "lv:a").await;
    join(&mut bob, "lv:b").await;

    event(&mut alice, "lv:a", "say", json!({"text": "hi"})).await;

    let reply = recv(&mut alice).await;
    assert_eq!(reply.event, "phx_reply");
    let push = recv(&mut alice).await;
    assert_eq!(push.event, "diff");
    assert_eq!(push.payload["1"]["d"], json!([["hi"]]));

    let push = recv(&mut bob).await;
    assert_eq!(push.topic, "lv:b");
    assert_eq!(push.payload["1"]["d"], json!([["hi"]]));
}

#[tokio::test]
async fn test_unknown_upload_frames_are_dropped() {
    let port = start_test_server().await;
    let mut socket = connect(port).await;
    let reply = join(&mut socket, "lv:room").await;
    assert_eq!(reply.payload["status"], "ok");

    // an allow_upload for a ref the view never declared is dropped
    send(
        &mut socket,
        json!(["1", "3", "lv:room", "allow_upload", {"ref": "phx-missing", "entries": []}]),
    )
    .await;
    send(&mut socket, json!([null, "4", "phoenix", "heartbeat", {}])).await;
    assert_eq!(recv(&mut socket).await.topic, "phoenix");

    // a chunk for a topic nobody joined is dropped
    let frame = ChunkFrame {
        join_ref: Some("9".into()),
        msg_ref: Some("9".into()),
        topic: "lvu:0".into(),
        event: "chunk".into(),
        data: b"abc".to_vec(),
    };
    socket.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();
    send(&mut socket, json!([null, "5", "phoenix", "heartbeat", {}])).await;
    assert_eq!(recv(&mut socket).await.msg_ref.as_deref(), Some("5"));
}

#[tokio::test]
async fn test_leave_then_rejoin() {
    let port = start_test_server().await;
    let mut socket = connect(port).await;
    join(&mut socket, "lv:room").await;
    event(&mut socket, "lv:room", "inc", json!({})).await;
    recv(&mut socket).await;

    send(&mut socket, json!(["1", "6", "lv:room", "phx_leave", {}])).await;
    assert_eq!(recv(&mut socket).await.payload["status"], "ok");

    let reply = join(&mut socket, "lv:room").await;
    assert_eq!(reply.payload["response"]["rendered"]["0"], "0");
}
