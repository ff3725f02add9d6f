use super::protocol as ws_protocol;
use super::session::{
    Session, SessionRouterState, SessionSink, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
    MAX_FRAME_BYTES,
};
use crate::error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use onde_common::protocol::ws::ServerMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) fn router(state: SessionRouterState) -> Router {
    Router::new().route("/sock", get(ws_upgrade)).with_state(state)
}

pub(crate) async fn ws_upgrade(
    State(state): State<SessionRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize)
        .max_message_size(MAX_FRAME_BYTES as usize)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, socket)).await;
        })
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn handle_socket(state: SessionRouterState, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let conn_id = Uuid::new_v4().to_string();

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = Session::new(state, SessionSink::new(conn_id.as_str(), outbound_sender));
    info!(conn_id = %conn_id, request_id = %request_id, "websocket connected");

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(
        HEARTBEAT_INTERVAL_MS as u64 + HEARTBEAT_TIMEOUT_MS,
    );

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(conn_id = %conn_id, request_id = %request_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                // The session holds a sender, so the queue never closes here.
                let Some(outbound_message) = maybe_outbound else {
                    break;
                };
                if ws_protocol::send_ws_message(&mut socket, outbound_message).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }
                        session.handle_frame(raw_message.as_str()).await;
                    }
                    Ok(Message::Binary(_)) => {
                        session.reject_frame("binary frames are not supported");
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Ping(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) if is_frame_size_violation(&error) => {
                        close_frame_too_large(&mut socket).await;
                        break;
                    }
                    Err(error) => {
                        debug!(conn_id = %conn_id, error = %error, "websocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    info!(conn_id = %conn_id, request_id = %request_id, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use onde_common::ot::Op;
    use onde_common::protocol::ws::{
        decode_message, encode_request, ClientRequest, CreateCardReq, LoginReq, ReviseReq,
        ServerMessage, SubscribeCardReq, SubscribeSearchReq,
    };
    use onde_common::types::{Change, PropertySnapshot};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{protocol::frame::coding::CloseCode, Message as WsFrame},
        MaybeTlsStream, WebSocketStream,
    };

    use super::router;
    use crate::search::QueryRegistry;
    use crate::store::{EntityStore, MemoryStore};
    use crate::sync::EntityRegistry;
    use crate::users;
    use crate::ws::session::{SessionRouterState, MAX_FRAME_BYTES};

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_relay(memory: MemoryStore) -> String {
        let store = EntityStore::Memory(memory);
        users::create_user(&store, "ada", "pw").await.expect("seed ada");
        users::create_user(&store, "bob", "pw").await.expect("seed bob");
        let state = SessionRouterState {
            entities: EntityRegistry::spawn(store.clone()),
            queries: QueryRegistry::spawn(store.clone(), Duration::from_millis(50)),
            store,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .await
                .expect("relay websocket server should run for integration test");
        });
        format!("ws://{addr}/sock")
    }

    async fn ws_send(socket: &mut ClientSocket, request: ClientRequest) {
        let raw = encode_request(request).expect("request should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("ws message should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerMessage {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return decode_message(&payload).expect("text frame should decode");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    async fn connect_and_login(url: &str, user_id: &str) -> (ClientSocket, String) {
        let (mut socket, _) = connect_async(url).await.expect("client should connect");
        ws_send(
            &mut socket,
            ClientRequest::Login(LoginReq { user_id: user_id.into(), password: "pw".into() }),
        )
        .await;
        match ws_recv(&mut socket).await {
            ServerMessage::Login(rsp) => {
                assert_eq!(rsp.user_id, user_id);
                (socket, rsp.conn_id)
            }
            other => panic!("expected login response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_before_login_get_no_connection() {
        let url = start_relay(MemoryStore::new("onde")).await;
        let (mut socket, _) = connect_async(url.as_str()).await.expect("client should connect");

        ws_send(&mut socket, ClientRequest::SubscribeCard(SubscribeCardReq { card_id: "c1".into(), sub_id: 1 }))
            .await;
        match ws_recv(&mut socket).await {
            ServerMessage::Error(err) => assert_eq!(err.msg, "no connection"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_edits_converge_for_both_clients() {
        let memory = MemoryStore::new("onde");
        memory
            .upsert("c1", &PropertySnapshot::from([("body".to_string(), "hello".to_string())]))
            .await
            .expect("seed card");
        let url = start_relay(memory.clone()).await;

        let (mut alice, alice_conn) = connect_and_login(&url, "ada").await;
        let (mut bob, _) = connect_and_login(&url, "bob").await;

        for socket in [&mut alice, &mut bob] {
            ws_send(socket, ClientRequest::SubscribeCard(SubscribeCardReq { card_id: "c1".into(), sub_id: 1 }))
                .await;
            match ws_recv(socket).await {
                ServerMessage::SubscribeCard(rsp) => {
                    assert_eq!(rsp.rev, 0);
                    assert_eq!(rsp.props["body"], "hello");
                }
                other => panic!("expected subscribe response, got {other:?}"),
            }
        }

        // Both edits are authored against revision 0.
        ws_send(
            &mut alice,
            ClientRequest::Revise(ReviseReq {
                conn_id: Some(alice_conn.clone()),
                sub_id: 1,
                card_id: "c1".into(),
                rev: 0,
                change: Change { prop: "body".into(), ops: vec![Op::Insert(">".into()), Op::Retain(5)] },
            }),
        )
        .await;
        match ws_recv(&mut alice).await {
            ServerMessage::Revise(rsp) => assert_eq!(rsp.orig_conn_id, alice_conn),
            other => panic!("expected revise broadcast, got {other:?}"),
        }
        ws_send(
            &mut bob,
            ClientRequest::Revise(ReviseReq {
                conn_id: None,
                sub_id: 1,
                card_id: "c1".into(),
                rev: 0,
                change: Change { prop: "body".into(), ops: vec![Op::Retain(5), Op::Insert("!".into())] },
            }),
        )
        .await;

        let mut bob_revisions = Vec::new();
        while bob_revisions.len() < 2 {
            if let ServerMessage::Revise(rsp) = ws_recv(&mut bob).await {
                bob_revisions.push(rsp);
            }
        }
        assert_eq!(bob_revisions[0].orig_conn_id, alice_conn);
        assert_eq!(bob_revisions[1].rev, 0);
        assert_eq!(bob_revisions[1].change.ops, vec![Op::Retain(6), Op::Insert("!".into())]);

        match ws_recv(&mut alice).await {
            ServerMessage::Revise(rsp) => assert_eq!(rsp.change.ops, vec![Op::Retain(6), Op::Insert("!".into())]),
            other => panic!("expected second revise broadcast, got {other:?}"),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let body = memory.get_by_id("c1").await.expect("card stored")["body"].clone();
            if body == ">hello!" {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "card never persisted, last body {body:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn created_cards_show_up_in_live_search() {
        let url = start_relay(MemoryStore::new("onde")).await;
        let (mut socket, _) = connect_and_login(&url, "ada").await;

        ws_send(&mut socket, ClientRequest::SubscribeSearch(SubscribeSearchReq { query: "pickle".into() }))
            .await;
        assert!(matches!(ws_recv(&mut socket).await, ServerMessage::SubscribeSearch(rsp) if rsp.query == "pickle"));
        match ws_recv(&mut socket).await {
            ServerMessage::SearchResults(results) => assert_eq!(results.total, 0),
            other => panic!("expected initial results, got {other:?}"),
        }

        ws_send(
            &mut socket,
            ClientRequest::CreateCard(CreateCardReq {
                create_id: 3,
                props: PropertySnapshot::from([("body".to_string(), "pickle jar".to_string())]),
            }),
        )
        .await;

        let mut card_id = None;
        loop {
            match ws_recv(&mut socket).await {
                ServerMessage::CreateCard(rsp) => {
                    assert_eq!(rsp.create_id, 3);
                    card_id = Some(rsp.card_id);
                }
                ServerMessage::SearchResults(results) if results.total == 1 => {
                    let card_id = card_id.expect("create response precedes results");
                    assert_eq!(results.results[0].card_id, card_id);
                    assert_eq!(results.results[0].body, "pickle jar");
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn oversized_frame_closes_with_size_code() {
        let url = start_relay(MemoryStore::new("onde")).await;
        let (mut socket, _) = connect_and_login(&url, "ada").await;

        let oversized = "x".repeat(MAX_FRAME_BYTES as usize + 1);
        let _ = socket.send(WsFrame::Text(oversized.into())).await;

        let closed = timeout(Duration::from_secs(2), async {
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(WsFrame::Close(Some(close))) => return Some(close.code),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            None
        })
        .await
        .expect("socket should close");
        if let Some(code) = closed {
            assert_eq!(code, CloseCode::Size);
        }
    }
}
