use axum::extract::ws::{Message, WebSocket};
use onde_common::protocol::ws::{self as wire, ClientRequest, ProtocolError, ServerMessage};

pub fn decode_frame(raw: &str) -> Result<ClientRequest, ProtocolError> {
    wire::decode_request(raw)
}

pub fn encode_frame(message: ServerMessage) -> Result<String, serde_json::Error> {
    wire::encode_message(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: ServerMessage) -> Result<(), ()> {
    let encoded = encode_frame(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
