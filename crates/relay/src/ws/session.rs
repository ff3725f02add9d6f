use std::collections::HashMap;
use std::sync::Arc;

use onde_common::protocol::ws::{
    ClientRequest, CreateCardReq, CreateCardRsp, LoginReq, LoginRsp, ReviseReq, ServerMessage,
    SubscribeCardReq, SubscribeSearchReq, UnsubscribeCardReq, UnsubscribeCardRsp,
    UnsubscribeSearchReq, UnsubscribeSearchRsp,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol as ws_protocol;
use crate::error::{ErrorCode, RelayError};
use crate::metrics;
use crate::search::{LiveQueryHandle, QueryRegistry};
use crate::store::EntityStore;
use crate::sync::{create_entity, EntityHandle, EntityRegistry, Revision};
use crate::users;

pub(crate) const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u32 = 262_144;

/// Reply text for any request made before a successful login.
pub(crate) const NOT_LOGGED_IN: &str = "no connection";

/// Shared handles every connection needs.
#[derive(Clone)]
pub(crate) struct SessionRouterState {
    pub(crate) store: EntityStore,
    pub(crate) entities: EntityRegistry,
    pub(crate) queries: QueryRegistry,
}

/// Outbound queue of one connection. Actors push into it and the socket
/// task drains it, so replies and broadcasts reach the client in the order
/// they were queued.
#[derive(Debug, Clone)]
pub struct SessionSink {
    conn_id: Arc<str>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl SessionSink {
    pub fn new(conn_id: impl Into<Arc<str>>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { conn_id: conn_id.into(), tx }
    }

    /// A sink plus the receiving end of its queue.
    pub fn channel(conn_id: &str) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(conn_id, tx), rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Queues `message`. Returns false once the connection has gone away.
    pub fn send(&self, message: ServerMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(conn_id = %self.conn_id, kind = err.0.kind(), "dropping message for closed connection");
                false
            }
        }
    }
}

/// Per-connection request dispatcher.
pub(crate) struct Session {
    state: SessionRouterState,
    sink: SessionSink,
    user_id: Option<String>,
    card_subs: HashMap<i64, EntityHandle>,
    search_subs: HashMap<String, LiveQueryHandle>,
}

impl Session {
    pub(crate) fn new(state: SessionRouterState, sink: SessionSink) -> Self {
        Self {
            state,
            sink,
            user_id: None,
            card_subs: HashMap::new(),
            search_subs: HashMap::new(),
        }
    }

    pub(crate) fn conn_id(&self) -> &str {
        self.sink.conn_id()
    }

    /// Decodes and handles one text frame. Undecodable frames are answered
    /// with an error and otherwise ignored.
    pub(crate) async fn handle_frame(&mut self, raw: &str) {
        match ws_protocol::decode_frame(raw) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                debug!(conn_id = %self.conn_id(), error = %err, "rejecting malformed frame");
                self.reject_frame(&err.to_string());
            }
        }
    }

    pub(crate) fn reject_frame(&self, reason: &str) {
        metrics::record_ws_request("invalid", true);
        self.sink.send(ServerMessage::error(reason));
    }

    pub(crate) async fn handle(&mut self, request: ClientRequest) {
        let kind = request.kind();
        let result = self.dispatch(request).await;
        metrics::record_ws_request(kind, result.is_err());
        if let Err(err) = result {
            debug!(conn_id = %self.conn_id(), kind, code = err.code().as_str(), error = %err.message(), "request failed");
            self.sink.send(ServerMessage::error(err.message()));
        }
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<(), RelayError> {
        if let ClientRequest::Login(login) = request {
            return self.login(login).await;
        }
        if self.user_id.is_none() {
            return Err(RelayError::new(ErrorCode::AuthInvalidCredentials, NOT_LOGGED_IN));
        }

        match request {
            ClientRequest::Login(_) => Ok(()),
            ClientRequest::SubscribeCard(req) => self.subscribe_card(req).await,
            ClientRequest::UnsubscribeCard(req) => self.unsubscribe_card(req),
            ClientRequest::Revise(req) => self.revise(req).await,
            ClientRequest::SubscribeSearch(req) => self.subscribe_search(req).await,
            ClientRequest::UnsubscribeSearch(req) => self.unsubscribe_search(req),
            ClientRequest::CreateCard(req) => self.create_card(req).await,
        }
    }

    async fn login(&mut self, req: LoginReq) -> Result<(), RelayError> {
        users::verify_login(&self.state.store, &req.user_id, &req.password).await?;
        info!(conn_id = %self.conn_id(), user_id = %req.user_id, "login accepted");
        self.user_id = Some(req.user_id.clone());
        self.sink.send(ServerMessage::Login(LoginRsp {
            user_id: req.user_id,
            conn_id: self.conn_id().to_string(),
        }));
        Ok(())
    }

    async fn subscribe_card(&mut self, req: SubscribeCardReq) -> Result<(), RelayError> {
        if self.card_subs.contains_key(&req.sub_id) {
            return Err(RelayError::new(
                ErrorCode::AlreadySubscribed,
                format!("subscription {} already in use", req.sub_id),
            ));
        }

        let (handle, snapshot) =
            self.state.entities.subscribe(&req.card_id, self.sink.clone(), req.sub_id).await?;
        debug!(conn_id = %self.conn_id(), entity_id = %req.card_id, sub_id = req.sub_id, rev = snapshot.rev, "card subscription opened");
        self.card_subs.insert(req.sub_id, handle);
        Ok(())
    }

    fn unsubscribe_card(&mut self, req: UnsubscribeCardReq) -> Result<(), RelayError> {
        let handle = self.card_subs.remove(&req.sub_id).ok_or_else(|| {
            RelayError::new(ErrorCode::NotSubscribed, format!("no subscription {}", req.sub_id))
        })?;
        self.state.entities.unsubscribe(&handle, self.sink.conn_id(), req.sub_id);
        self.sink.send(ServerMessage::UnsubscribeCard(UnsubscribeCardRsp { sub_id: req.sub_id }));
        Ok(())
    }

    async fn revise(&mut self, req: ReviseReq) -> Result<(), RelayError> {
        if let Some(conn_id) = req.conn_id.as_deref() {
            if conn_id != self.conn_id() {
                return Err(RelayError::new(
                    ErrorCode::ValidationFailed,
                    format!("revision names connection {conn_id}"),
                ));
            }
        }

        let handle = self.card_subs.get(&req.sub_id).ok_or_else(|| {
            RelayError::new(ErrorCode::NotSubscribed, format!("no subscription {}", req.sub_id))
        })?;
        if handle.id() != req.card_id {
            return Err(RelayError::new(
                ErrorCode::ValidationFailed,
                format!("subscription {} is not for card {}", req.sub_id, req.card_id),
            ));
        }

        let revision = Revision {
            conn_id: self.conn_id().to_string(),
            sub_id: req.sub_id,
            rev: req.rev,
            change: req.change,
        };
        handle.revise(revision).await?;
        Ok(())
    }

    async fn subscribe_search(&mut self, req: SubscribeSearchReq) -> Result<(), RelayError> {
        if self.search_subs.contains_key(&req.query) {
            return Err(RelayError::new(
                ErrorCode::AlreadySubscribed,
                format!("already following query {:?}", req.query),
            ));
        }

        let (handle, _) = self.state.queries.subscribe(&req.query, self.sink.clone()).await?;
        self.search_subs.insert(req.query, handle);
        Ok(())
    }

    fn unsubscribe_search(&mut self, req: UnsubscribeSearchReq) -> Result<(), RelayError> {
        let handle = self.search_subs.remove(&req.query).ok_or_else(|| {
            RelayError::new(ErrorCode::NotSubscribed, format!("not following query {:?}", req.query))
        })?;
        self.state.queries.unsubscribe(&handle, self.sink.conn_id());
        self.sink.send(ServerMessage::UnsubscribeSearch(UnsubscribeSearchRsp { query: req.query }));
        Ok(())
    }

    async fn create_card(&mut self, req: CreateCardReq) -> Result<(), RelayError> {
        let card_id = create_entity(&self.state.store, self.conn_id(), req.props).await?;
        self.sink.send(ServerMessage::CreateCard(CreateCardRsp { create_id: req.create_id, card_id }));
        Ok(())
    }

    /// Drops every subscription this connection holds.
    pub(crate) fn close(&mut self) {
        let conn_id = self.sink.conn_id().to_string();
        let cards = self.card_subs.len();
        let searches = self.search_subs.len();

        for (sub_id, handle) in self.card_subs.drain() {
            self.state.entities.unsubscribe(&handle, &conn_id, sub_id);
        }
        for (_, handle) in self.search_subs.drain() {
            self.state.queries.unsubscribe(&handle, &conn_id);
        }
        info!(conn_id, cards, searches, "session closed");
    }
}
