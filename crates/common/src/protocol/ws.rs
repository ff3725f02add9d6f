// WebSocket message types for the onde editing protocol.
//
// Every frame is one JSON envelope of the form `{"Type": <tag>, "<Payload>":
// {...}}`. The envelope structs below are the serde boundary; the rest of the
// code works with `ClientRequest` and `ServerMessage`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Change, PropertySnapshot};

pub const MSG_LOGIN: &str = "login";
pub const MSG_SUBSCRIBE_CARD: &str = "subscribecard";
pub const MSG_UNSUBSCRIBE_CARD: &str = "unsubscribecard";
pub const MSG_REVISE: &str = "revise";
pub const MSG_SUBSCRIBE_SEARCH: &str = "subscribesearch";
pub const MSG_UNSUBSCRIBE_SEARCH: &str = "unsubscribesearch";
pub const MSG_CREATE_CARD: &str = "createcard";
pub const MSG_SEARCH_RESULTS: &str = "searchresults";
pub const MSG_ERROR: &str = "error";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("message type `{0}` is missing its payload")]
    MissingPayload(&'static str),

    #[error("message type `{0}` carries more than one payload")]
    ExtraPayload(&'static str),
}

// Requests.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct LoginReq {
    pub user_id: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeCardReq {
    pub card_id: String,
    pub sub_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeCardReq {
    pub sub_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ReviseReq {
    /// Ignored by the relay, which always uses the socket's own id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
    pub sub_id: i64,
    pub card_id: String,
    pub rev: i64,
    pub change: Change,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeSearchReq {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeSearchReq {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateCardReq {
    pub create_id: i64,
    #[serde(default)]
    pub props: PropertySnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_card: Option<SubscribeCardReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_card: Option<UnsubscribeCardReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revise: Option<ReviseReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_search: Option<SubscribeSearchReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_search: Option<UnsubscribeSearchReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_card: Option<CreateCardReq>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Login(LoginReq),
    SubscribeCard(SubscribeCardReq),
    UnsubscribeCard(UnsubscribeCardReq),
    Revise(ReviseReq),
    SubscribeSearch(SubscribeSearchReq),
    UnsubscribeSearch(UnsubscribeSearchReq),
    CreateCard(CreateCardReq),
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Login(_) => MSG_LOGIN,
            ClientRequest::SubscribeCard(_) => MSG_SUBSCRIBE_CARD,
            ClientRequest::UnsubscribeCard(_) => MSG_UNSUBSCRIBE_CARD,
            ClientRequest::Revise(_) => MSG_REVISE,
            ClientRequest::SubscribeSearch(_) => MSG_SUBSCRIBE_SEARCH,
            ClientRequest::UnsubscribeSearch(_) => MSG_UNSUBSCRIBE_SEARCH,
            ClientRequest::CreateCard(_) => MSG_CREATE_CARD,
        }
    }
}

impl TryFrom<RequestEnvelope> for ClientRequest {
    type Error = ProtocolError;

    fn try_from(envelope: RequestEnvelope) -> Result<Self, ProtocolError> {
        let RequestEnvelope {
            kind,
            login,
            subscribe_card,
            unsubscribe_card,
            revise,
            subscribe_search,
            unsubscribe_search,
            create_card,
        } = envelope;

        let present = [
            login.is_some(),
            subscribe_card.is_some(),
            unsubscribe_card.is_some(),
            revise.is_some(),
            subscribe_search.is_some(),
            unsubscribe_search.is_some(),
            create_card.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();

        let (tag, request) = match kind.as_str() {
            MSG_LOGIN => (MSG_LOGIN, login.map(ClientRequest::Login)),
            MSG_SUBSCRIBE_CARD => {
                (MSG_SUBSCRIBE_CARD, subscribe_card.map(ClientRequest::SubscribeCard))
            }
            MSG_UNSUBSCRIBE_CARD => {
                (MSG_UNSUBSCRIBE_CARD, unsubscribe_card.map(ClientRequest::UnsubscribeCard))
            }
            MSG_REVISE => (MSG_REVISE, revise.map(ClientRequest::Revise)),
            MSG_SUBSCRIBE_SEARCH => {
                (MSG_SUBSCRIBE_SEARCH, subscribe_search.map(ClientRequest::SubscribeSearch))
            }
            MSG_UNSUBSCRIBE_SEARCH => {
                (MSG_UNSUBSCRIBE_SEARCH, unsubscribe_search.map(ClientRequest::UnsubscribeSearch))
            }
            MSG_CREATE_CARD => (MSG_CREATE_CARD, create_card.map(ClientRequest::CreateCard)),
            _ => return Err(ProtocolError::UnknownType(kind)),
        };

        let request = request.ok_or(ProtocolError::MissingPayload(tag))?;
        if present > 1 {
            return Err(ProtocolError::ExtraPayload(tag));
        }
        Ok(request)
    }
}

impl From<ClientRequest> for RequestEnvelope {
    fn from(request: ClientRequest) -> Self {
        let mut envelope = RequestEnvelope { kind: request.kind().to_string(), ..Default::default() };
        match request {
            ClientRequest::Login(req) => envelope.login = Some(req),
            ClientRequest::SubscribeCard(req) => envelope.subscribe_card = Some(req),
            ClientRequest::UnsubscribeCard(req) => envelope.unsubscribe_card = Some(req),
            ClientRequest::Revise(req) => envelope.revise = Some(req),
            ClientRequest::SubscribeSearch(req) => envelope.subscribe_search = Some(req),
            ClientRequest::UnsubscribeSearch(req) => envelope.unsubscribe_search = Some(req),
            ClientRequest::CreateCard(req) => envelope.create_card = Some(req),
        }
        envelope
    }
}

// Responses.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct LoginRsp {
    pub user_id: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeCardRsp {
    pub card_id: String,
    pub sub_id: i64,
    pub rev: i64,
    pub props: PropertySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeCardRsp {
    pub sub_id: i64,
}

/// A committed revision.
///
/// `rev` is the revision the change was transformed against, so a client
/// applies it on top of exactly `rev` prior revisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ReviseRsp {
    pub orig_conn_id: String,
    pub orig_sub_id: i64,
    pub card_id: String,
    pub sub_ids: Vec<i64>,
    pub rev: i64,
    pub change: Change,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeSearchRsp {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct UnsubscribeSearchRsp {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CreateCardRsp {
    pub create_id: i64,
    pub card_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SearchResult {
    pub card_id: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SearchResultsRsp {
    pub query: String,
    pub total: usize,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorRsp {
    pub msg: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revise: Option<ReviseRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_card: Option<SubscribeCardRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_card: Option<UnsubscribeCardRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_search: Option<SubscribeSearchRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_search: Option<UnsubscribeSearchRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_card: Option<CreateCardRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<SearchResultsRsp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRsp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Login(LoginRsp),
    SubscribeCard(SubscribeCardRsp),
    UnsubscribeCard(UnsubscribeCardRsp),
    Revise(ReviseRsp),
    SubscribeSearch(SubscribeSearchRsp),
    UnsubscribeSearch(UnsubscribeSearchRsp),
    CreateCard(CreateCardRsp),
    SearchResults(SearchResultsRsp),
    Error(ErrorRsp),
}

impl ServerMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorRsp { msg: msg.into() })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Login(_) => MSG_LOGIN,
            ServerMessage::SubscribeCard(_) => MSG_SUBSCRIBE_CARD,
            ServerMessage::UnsubscribeCard(_) => MSG_UNSUBSCRIBE_CARD,
            ServerMessage::Revise(_) => MSG_REVISE,
            ServerMessage::SubscribeSearch(_) => MSG_SUBSCRIBE_SEARCH,
            ServerMessage::UnsubscribeSearch(_) => MSG_UNSUBSCRIBE_SEARCH,
            ServerMessage::CreateCard(_) => MSG_CREATE_CARD,
            ServerMessage::SearchResults(_) => MSG_SEARCH_RESULTS,
            ServerMessage::Error(_) => MSG_ERROR,
        }
    }
}

impl From<ServerMessage> for ResponseEnvelope {
    fn from(message: ServerMessage) -> Self {
        let mut envelope = ResponseEnvelope { kind: message.kind().to_string(), ..Default::default() };
        match message {
            ServerMessage::Login(rsp) => envelope.login = Some(rsp),
            ServerMessage::SubscribeCard(rsp) => envelope.subscribe_card = Some(rsp),
            ServerMessage::UnsubscribeCard(rsp) => envelope.unsubscribe_card = Some(rsp),
            ServerMessage::Revise(rsp) => envelope.revise = Some(rsp),
            ServerMessage::SubscribeSearch(rsp) => envelope.subscribe_search = Some(rsp),
            ServerMessage::UnsubscribeSearch(rsp) => envelope.unsubscribe_search = Some(rsp),
            ServerMessage::CreateCard(rsp) => envelope.create_card = Some(rsp),
            ServerMessage::SearchResults(rsp) => envelope.search_results = Some(rsp),
            ServerMessage::Error(rsp) => envelope.error = Some(rsp),
        }
        envelope
    }
}

impl TryFrom<ResponseEnvelope> for ServerMessage {
    type Error = ProtocolError;

    fn try_from(envelope: ResponseEnvelope) -> Result<Self, ProtocolError> {
        let (tag, message) = match envelope.kind.as_str() {
            MSG_LOGIN => (MSG_LOGIN, envelope.login.map(ServerMessage::Login)),
            MSG_SUBSCRIBE_CARD => {
                (MSG_SUBSCRIBE_CARD, envelope.subscribe_card.map(ServerMessage::SubscribeCard))
            }
            MSG_UNSUBSCRIBE_CARD => (
                MSG_UNSUBSCRIBE_CARD,
                envelope.unsubscribe_card.map(ServerMessage::UnsubscribeCard),
            ),
            MSG_REVISE => (MSG_REVISE, envelope.revise.map(ServerMessage::Revise)),
            MSG_SUBSCRIBE_SEARCH => (
                MSG_SUBSCRIBE_SEARCH,
                envelope.subscribe_search.map(ServerMessage::SubscribeSearch),
            ),
            MSG_UNSUBSCRIBE_SEARCH => (
                MSG_UNSUBSCRIBE_SEARCH,
                envelope.unsubscribe_search.map(ServerMessage::UnsubscribeSearch),
            ),
            MSG_CREATE_CARD => (MSG_CREATE_CARD, envelope.create_card.map(ServerMessage::CreateCard)),
            MSG_SEARCH_RESULTS => {
                (MSG_SEARCH_RESULTS, envelope.search_results.map(ServerMessage::SearchResults))
            }
            MSG_ERROR => (MSG_ERROR, envelope.error.map(ServerMessage::Error)),
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        };
        message.ok_or(ProtocolError::MissingPayload(tag))
    }
}

pub fn decode_request(raw: &str) -> Result<ClientRequest, ProtocolError> {
    let envelope: RequestEnvelope = serde_json::from_str(raw)?;
    ClientRequest::try_from(envelope)
}

pub fn encode_request(request: ClientRequest) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RequestEnvelope::from(request))
}

pub fn decode_message(raw: &str) -> Result<ServerMessage, ProtocolError> {
    let envelope: ResponseEnvelope = serde_json::from_str(raw)?;
    ServerMessage::try_from(envelope)
}

pub fn encode_message(message: ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ResponseEnvelope::from(message))
}
