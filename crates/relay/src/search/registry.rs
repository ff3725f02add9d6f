use std::collections::HashMap;
use std::time::Duration;

use onde_common::protocol::ws::SearchResultsRsp;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, Instrument};

use super::live_query::{spawn_live_query, LiveQueryHandle, Terminated};
use super::QueryError;
use crate::metrics;
use crate::store::EntityStore;
use crate::ws::SessionSink;

type SubscribeReply =
    oneshot::Sender<Result<(LiveQueryHandle, Option<SearchResultsRsp>), QueryError>>;

enum RegistryCommand {
    Subscribe { query: String, sink: SessionSink, reply: SubscribeReply },
    Count { reply: oneshot::Sender<usize> },
}

/// Maps query strings to their live query actor.
#[derive(Debug, Clone)]
pub struct QueryRegistry {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl QueryRegistry {
    pub fn spawn(store: EntityStore, interval: Duration) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            store,
            interval,
            queries: HashMap::new(),
            next_generation: 0,
            done_tx,
        };
        tokio::spawn(coordinator.run(commands, done_rx).instrument(info_span!("relay.searches")));
        Self { tx }
    }

    pub async fn subscribe(
        &self,
        query: &str,
        sink: SessionSink,
    ) -> Result<(LiveQueryHandle, Option<SearchResultsRsp>), QueryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Subscribe { query: query.to_string(), sink, reply })
            .map_err(|_| QueryError::Stopped)?;
        rx.await.map_err(|_| QueryError::Stopped)?
    }

    pub fn unsubscribe(&self, handle: &LiveQueryHandle, conn_id: &str) {
        handle.unsubscribe(conn_id);
    }

    pub async fn live_count(&self) -> Result<usize, QueryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Count { reply }).map_err(|_| QueryError::Stopped)?;
        rx.await.map_err(|_| QueryError::Stopped)
    }
}

struct Coordinator {
    store: EntityStore,
    interval: Duration,
    queries: HashMap<String, LiveQueryHandle>,
    next_generation: u64,
    done_tx: mpsc::UnboundedSender<Terminated>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RegistryCommand>,
        mut done_rx: mpsc::UnboundedReceiver<Terminated>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(terminated) = done_rx.recv() => self.on_terminated(terminated),
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        RegistryCommand::Subscribe { query, sink, reply } => {
                            let _ = reply.send(self.subscribe(query, sink).await);
                        }
                        RegistryCommand::Count { reply } => {
                            let _ = reply.send(self.queries.len());
                        }
                    }
                }
            }
        }
        debug!("query registry stopped");
    }

    async fn subscribe(
        &mut self,
        query: String,
        sink: SessionSink,
    ) -> Result<(LiveQueryHandle, Option<SearchResultsRsp>), QueryError> {
        if let Some(handle) = self.queries.get(&query).cloned() {
            match handle.subscribe(sink.clone()).await {
                Ok(snapshot) => return Ok((handle, snapshot)),
                Err(QueryError::Stopped) => {
                    debug!(query = %query, generation = handle.generation(), "replacing retiring live query");
                    self.queries.remove(&query);
                }
                Err(err) => return Err(err),
            }
        }

        self.next_generation += 1;
        let handle = spawn_live_query(
            query.clone(),
            self.next_generation,
            self.store.clone(),
            self.interval,
            self.done_tx.clone(),
        );
        self.queries.insert(query.clone(), handle.clone());
        metrics::set_live_queries(self.queries.len());
        info!(query = %query, live = self.queries.len(), "live query registered");

        let snapshot = handle.subscribe(sink).await?;
        Ok((handle, snapshot))
    }

    fn on_terminated(&mut self, terminated: Terminated) {
        let current = self.queries.get(&terminated.query).map(LiveQueryHandle::generation);
        if current != Some(terminated.generation) {
            debug!(query = %terminated.query, "ignoring termination of replaced live query");
            return;
        }
        self.queries.remove(&terminated.query);
        metrics::set_live_queries(self.queries.len());
        info!(query = %terminated.query, live = self.queries.len(), "live query removed");
    }
}
