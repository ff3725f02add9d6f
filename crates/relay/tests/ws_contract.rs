use onde_common::protocol::ws::{decode_request, encode_message, ClientRequest, ServerMessage};
use serde_json::Value;

const RELAY_WS_SESSION_SOURCE: &str = include_str!("../src/ws/session.rs");
const RELAY_WS_HANDLER_SOURCE: &str = include_str!("../src/ws/handler.rs");
const RELAY_MAIN_SOURCE: &str = include_str!("../src/main.rs");
const RELAY_ADMIN_SOURCE: &str = include_str!("../src/admin.rs");

#[test]
fn websocket_contract_heartbeat_and_frame_limits() {
    let heartbeat_interval_ms = parse_u64_const(RELAY_WS_SESSION_SOURCE, "HEARTBEAT_INTERVAL_MS");
    let heartbeat_timeout_ms = parse_u64_const(RELAY_WS_SESSION_SOURCE, "HEARTBEAT_TIMEOUT_MS");
    let max_frame_bytes = parse_u64_const(RELAY_WS_SESSION_SOURCE, "MAX_FRAME_BYTES");

    assert_eq!(heartbeat_interval_ms, 15_000);
    assert_eq!(heartbeat_timeout_ms, 10_000);
    assert_eq!(max_frame_bytes, 262_144);
    assert!(
        heartbeat_timeout_ms < heartbeat_interval_ms,
        "pong timeout must be shorter than heartbeat interval",
    );
    assert!(RELAY_WS_HANDLER_SOURCE.contains("close_code::SIZE"));
    assert!(RELAY_WS_HANDLER_SOURCE.contains(".max_frame_size(MAX_FRAME_BYTES as usize)"));
    assert!(
        RELAY_WS_HANDLER_SOURCE.contains(".max_message_size(MAX_FRAME_BYTES as usize)"),
        "fragmented messages must be bounded after reassembly too",
    );
}

#[test]
fn http_surface_mounts_every_route() {
    assert!(RELAY_WS_HANDLER_SOURCE.contains(".route(\"/sock\", get(ws_upgrade))"));
    assert!(RELAY_ADMIN_SOURCE.contains(".route(\"/admin/new-user\", post(new_user))"));
    assert!(RELAY_MAIN_SOURCE.contains(".route(\"/healthz\", get(healthz))"));
    assert!(RELAY_MAIN_SOURCE.contains(".route(\"/metrics\""));
}

#[test]
fn unauthenticated_reply_text_is_stable() {
    assert!(RELAY_WS_SESSION_SOURCE
        .contains("pub(crate) const NOT_LOGGED_IN: &str = \"no connection\";"));
}

#[test]
fn browser_client_frames_decode() {
    let frames = [
        (r#"{"Type":"login","Login":{"UserId":"ada","Password":"pw"}}"#, "login"),
        (r#"{"Type":"subscribecard","SubscribeCard":{"CardId":"c1","SubId":2}}"#, "subscribecard"),
        (r#"{"Type":"unsubscribecard","UnsubscribeCard":{"SubId":2}}"#, "unsubscribecard"),
        (
            r#"{"Type":"revise","Revise":{"ConnId":"k","SubId":2,"CardId":"c1","Rev":3,"Change":{"Prop":"body","Ops":[4,-1,"x"]}}}"#,
            "revise",
        ),
        (r#"{"Type":"subscribesearch","SubscribeSearch":{"Query":"milk"}}"#, "subscribesearch"),
        (r#"{"Type":"unsubscribesearch","UnsubscribeSearch":{"Query":"milk"}}"#, "unsubscribesearch"),
        (r#"{"Type":"createcard","CreateCard":{"CreateId":1,"Props":{}}}"#, "createcard"),
    ];

    for (raw, kind) in frames {
        let request = decode_request(raw).unwrap_or_else(|error| panic!("{kind}: {error}"));
        assert_eq!(request.kind(), kind);
    }

    let ClientRequest::Revise(revise) = decode_request(frames[3].0).expect("revise decodes") else {
        panic!("expected revise");
    };
    assert_eq!(revise.rev, 3);
    assert_eq!(revise.change.ops.len(), 3);
}

#[test]
fn error_frames_carry_only_the_error_payload() {
    let encoded = encode_message(ServerMessage::error("no connection")).expect("encode");
    let value: Value = serde_json::from_str(&encoded).expect("valid json");
    let object = value.as_object().expect("object frame");

    assert_eq!(object.len(), 2);
    assert_eq!(object["Type"], "error");
    assert_eq!(object["Error"]["Msg"], "no connection");
}

fn parse_u64_const(source: &str, name: &str) -> u64 {
    let needle = format!("const {name}:");
    let index = source.find(&needle).expect("constant must be declared");
    let line = source[index..].lines().next().expect("constant declaration line must exist");
    let raw_value = line
        .split('=')
        .nth(1)
        .expect("constant must have assignment")
        .trim()
        .trim_end_matches(';')
        .replace('_', "");
    raw_value
        .parse::<u64>()
        .unwrap_or_else(|error| panic!("failed to parse `{name}` from `{line}`: {error}"))
}
