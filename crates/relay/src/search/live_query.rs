use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use onde_common::protocol::ws::{SearchResult, SearchResultsRsp, ServerMessage, SubscribeSearchRsp};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use super::QueryError;
use crate::metrics;
use crate::store::{EntityStore, QueryPage};
use crate::ws::SessionSink;

/// Sent to the query registry once an actor has stopped for good.
#[derive(Debug, Clone)]
pub struct Terminated {
    pub query: String,
    pub generation: u64,
}

enum QueryMessage {
    Subscribe {
        sink: SessionSink,
        reply: oneshot::Sender<Result<Option<SearchResultsRsp>, QueryError>>,
    },
    Unsubscribe {
        conn_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct LiveQueryHandle {
    query: Arc<str>,
    generation: u64,
    tx: mpsc::UnboundedSender<QueryMessage>,
}

impl LiveQueryHandle {
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Adds `sink` and runs the query right away. The actor queues
    /// `SubscribeSearchRsp` and then the current results on the sink.
    pub(crate) async fn subscribe(
        &self,
        sink: SessionSink,
    ) -> Result<Option<SearchResultsRsp>, QueryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(QueryMessage::Subscribe { sink, reply }).map_err(|_| QueryError::Stopped)?;
        rx.await.map_err(|_| QueryError::Stopped)?
    }

    pub fn unsubscribe(&self, conn_id: &str) {
        let message = QueryMessage::Unsubscribe { conn_id: conn_id.to_string() };
        if self.tx.send(message).is_err() {
            debug!(query = %self.query, conn_id, "unsubscribe after live query stopped");
        }
    }
}

pub(crate) fn spawn_live_query(
    query: String,
    generation: u64,
    store: EntityStore,
    interval: Duration,
    done: mpsc::UnboundedSender<Terminated>,
) -> LiveQueryHandle {
    let (tx, mailbox) = mpsc::unbounded_channel();
    let actor = LiveQuery {
        query: query.clone(),
        generation,
        store,
        interval,
        subscribers: HashMap::new(),
        snapshot: None,
        mailbox,
        done,
    };
    tokio::spawn(actor.run().instrument(info_span!("relay.search", query = %query, generation)));

    LiveQueryHandle { query: query.into(), generation, tx }
}

/// Builds the wire result set for one store page.
pub fn results_from_page(query: &str, page: QueryPage) -> SearchResultsRsp {
    let results = page
        .hits
        .iter()
        .map(|hit| SearchResult {
            card_id: hit.id.clone(),
            title: hit.title().to_string(),
            body: hit.body().to_string(),
        })
        .collect();
    SearchResultsRsp { query: query.to_string(), total: page.total, results }
}

struct LiveQuery {
    query: String,
    generation: u64,
    store: EntityStore,
    interval: Duration,
    subscribers: HashMap<String, SessionSink>,
    snapshot: Option<SearchResultsRsp>,
    mailbox: mpsc::UnboundedReceiver<QueryMessage>,
    done: mpsc::UnboundedSender<Terminated>,
}

impl LiveQuery {
    async fn run(mut self) {
        info!("live query started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Subscribers get fresh results on arrival; skip the immediate tick.
        ticker.reset();

        loop {
            tokio::select! {
                message = self.mailbox.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    match message {
                        QueryMessage::Subscribe { sink, reply } => {
                            let result = self.subscribe(sink).await;
                            let _ = reply.send(result);
                        }
                        QueryMessage::Unsubscribe { conn_id } => {
                            self.unsubscribe(&conn_id);
                            if self.subscribers.is_empty() {
                                break;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.refresh().await {
                        self.broadcast();
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn subscribe(&mut self, sink: SessionSink) -> Result<Option<SearchResultsRsp>, QueryError> {
        let conn_id = sink.conn_id().to_string();
        if self.subscribers.contains_key(&conn_id) {
            return Err(QueryError::AlreadySubscribed { query: self.query.clone(), conn_id });
        }

        sink.send(ServerMessage::SubscribeSearch(SubscribeSearchRsp { query: self.query.clone() }));
        self.subscribers.insert(conn_id.clone(), sink.clone());
        info!(conn_id, subscribers = self.subscribers.len(), "search subscribed");

        if self.refresh().await {
            self.broadcast();
        } else if let Some(snapshot) = &self.snapshot {
            sink.send(ServerMessage::SearchResults(snapshot.clone()));
        }
        Ok(self.snapshot.clone())
    }

    fn unsubscribe(&mut self, conn_id: &str) {
        if self.subscribers.remove(conn_id).is_none() {
            debug!(conn_id, "unsubscribe for unknown search subscriber");
            return;
        }
        info!(conn_id, subscribers = self.subscribers.len(), "search unsubscribed");
    }

    /// Re-runs the query. Returns true when the snapshot changed.
    async fn refresh(&mut self) -> bool {
        match self.store.query(&self.query).await {
            Ok(page) => {
                let fresh = results_from_page(&self.query, page);
                if self.snapshot.as_ref() == Some(&fresh) {
                    debug!("search results unchanged");
                    return false;
                }
                debug!(total = fresh.total, "search results changed");
                self.snapshot = Some(fresh);
                true
            }
            Err(err) => {
                metrics::increment_query_failures();
                warn!(error = %err, "live query refresh failed; keeping previous results");
                false
            }
        }
    }

    fn broadcast(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        for sink in self.subscribers.values() {
            sink.send(ServerMessage::SearchResults(snapshot.clone()));
        }
    }

    async fn shutdown(self) {
        let LiveQuery { query, generation, mut mailbox, done, .. } = self;

        mailbox.close();
        while let Some(message) = mailbox.recv().await {
            if let QueryMessage::Subscribe { reply, .. } = message {
                let _ = reply.send(Err(QueryError::Stopped));
            }
        }

        info!("live query stopped");
        let _ = done.send(Terminated { query, generation });
    }
}
