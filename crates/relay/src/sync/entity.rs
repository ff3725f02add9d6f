// One actor per open card.
//
// The actor owns the card's properties and revision history, serialises
// every subscribe, unsubscribe and revise against them, and fans committed
// revisions out to subscribed sessions. Snapshots are handed to a companion
// persister task that always writes the newest one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use onde_common::ot::{apply, transform, OtError};
use onde_common::protocol::ws::{ReviseRsp, ServerMessage, SubscribeCardRsp};
use onde_common::types::{Change, PropertySnapshot};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::metrics;
use crate::store::EntityStore;
use crate::ws::SessionSink;

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("revision {rev} is not in the card history (head is {head})")]
    StaleRevision { rev: i64, head: i64 },

    #[error(transparent)]
    Algebra(#[from] OtError),

    #[error("subscription {sub_id} already exists on this connection")]
    AlreadySubscribed { conn_id: String, sub_id: i64 },

    #[error("subscription {sub_id} is not held by this connection")]
    NotSubscribed { conn_id: String, sub_id: i64 },

    #[error("card actor has stopped")]
    Stopped,
}

/// A client edit as received, before transformation.
#[derive(Debug, Clone)]
pub struct Revision {
    pub conn_id: String,
    pub sub_id: i64,
    /// Number of history entries the client had seen when it made the edit.
    pub rev: i64,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub rev: i64,
    pub props: PropertySnapshot,
}

/// Sent to the registry once an actor has stopped for good.
#[derive(Debug, Clone)]
pub struct Terminated {
    pub id: String,
    pub generation: u64,
}

enum EntityMessage {
    Subscribe {
        sink: SessionSink,
        sub_id: i64,
        reply: oneshot::Sender<Result<EntitySnapshot, EntityError>>,
    },
    Unsubscribe {
        conn_id: String,
        sub_id: i64,
    },
    Revise {
        revision: Revision,
        reply: oneshot::Sender<Result<i64, EntityError>>,
    },
    Snapshot {
        reply: oneshot::Sender<EntitySnapshot>,
    },
}

impl EntityMessage {
    /// Answers a message that arrived after the actor decided to stop.
    fn reject(self) {
        match self {
            Self::Subscribe { reply, .. } => {
                let _ = reply.send(Err(EntityError::Stopped));
            }
            Self::Revise { reply, .. } => {
                let _ = reply.send(Err(EntityError::Stopped));
            }
            Self::Unsubscribe { .. } | Self::Snapshot { .. } => {}
        }
    }
}

/// Cheap, cloneable address of a card actor.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    id: Arc<str>,
    generation: u64,
    tx: mpsc::UnboundedSender<EntityMessage>,
}

impl EntityHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Registers `sink` under `sub_id`. The actor queues the
    /// `SubscribeCardRsp` on the sink itself, ahead of any revision
    /// broadcast that follows.
    pub(crate) async fn subscribe(
        &self,
        sink: SessionSink,
        sub_id: i64,
    ) -> Result<EntitySnapshot, EntityError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EntityMessage::Subscribe { sink, sub_id, reply })
            .map_err(|_| EntityError::Stopped)?;
        rx.await.map_err(|_| EntityError::Stopped)?
    }

    pub fn unsubscribe(&self, conn_id: &str, sub_id: i64) {
        let message = EntityMessage::Unsubscribe { conn_id: conn_id.to_string(), sub_id };
        if self.tx.send(message).is_err() {
            debug!(entity_id = %self.id, conn_id, sub_id, "unsubscribe after card actor stopped");
        }
    }

    /// Transforms, applies and broadcasts `revision`. Returns the new head
    /// revision.
    pub async fn revise(&self, revision: Revision) -> Result<i64, EntityError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EntityMessage::Revise { revision, reply })
            .map_err(|_| EntityError::Stopped)?;
        rx.await.map_err(|_| EntityError::Stopped)?
    }

    pub async fn snapshot(&self) -> Result<EntitySnapshot, EntityError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EntityMessage::Snapshot { reply }).map_err(|_| EntityError::Stopped)?;
        rx.await.map_err(|_| EntityError::Stopped)
    }
}

/// Properties plus the ordered history of committed changes.
#[derive(Debug, Clone)]
pub struct EntityState {
    id: String,
    props: PropertySnapshot,
    history: Vec<Change>,
}

impl EntityState {
    pub fn new(id: impl Into<String>, props: PropertySnapshot) -> Self {
        Self { id: id.into(), props, history: Vec::new() }
    }

    pub fn head(&self) -> i64 {
        self.history.len() as i64
    }

    pub fn props(&self) -> &PropertySnapshot {
        &self.props
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot { rev: self.head(), props: self.props.clone() }
    }

    /// Carries `change` from revision `rev` to the head, applies it and
    /// appends the transformed change to the history.
    ///
    /// Nothing is modified unless the whole change applies.
    pub fn commit(&mut self, rev: i64, change: Change) -> Result<Change, EntityError> {
        let head = self.head();
        if rev < 0 || rev > head {
            return Err(EntityError::StaleRevision { rev, head });
        }

        let Change { prop, mut ops } = change;
        for prior in &self.history[rev as usize..] {
            if prior.prop == prop {
                // History takes the priority side: its inserts land first on ties.
                (_, ops) = transform(&prior.ops, &ops)?;
            }
        }

        match self.props.get_mut(&prop) {
            Some(text) => apply(text, &ops)?,
            None => {
                let mut text = String::new();
                apply(&mut text, &ops)?;
                self.props.insert(prop.clone(), text);
            }
        }

        let committed = Change { prop, ops };
        self.history.push(committed.clone());
        Ok(committed)
    }
}

struct Subscriber {
    sink: SessionSink,
    sub_ids: BTreeSet<i64>,
}

struct EntityActor {
    state: EntityState,
    generation: u64,
    subscribers: HashMap<String, Subscriber>,
    mailbox: mpsc::UnboundedReceiver<EntityMessage>,
    done: mpsc::UnboundedSender<Terminated>,
    persist_tx: watch::Sender<PropertySnapshot>,
    persister: JoinHandle<()>,
}

/// Starts an actor for a card that was just loaded from `store`.
pub(crate) fn spawn_entity(
    id: String,
    props: PropertySnapshot,
    generation: u64,
    store: EntityStore,
    done: mpsc::UnboundedSender<Terminated>,
) -> EntityHandle {
    let (tx, mailbox) = mpsc::unbounded_channel();
    let (persist_tx, persist_rx) = watch::channel(props.clone());
    let persister = tokio::spawn(
        persist_loop(id.clone(), store, persist_rx)
            .instrument(info_span!("relay.card.persist", entity_id = %id)),
    );

    let actor = EntityActor {
        state: EntityState::new(id.clone(), props),
        generation,
        subscribers: HashMap::new(),
        mailbox,
        done,
        persist_tx,
        persister,
    };
    tokio::spawn(actor.run().instrument(info_span!("relay.card", entity_id = %id, generation)));

    EntityHandle { id: id.into(), generation, tx }
}

impl EntityActor {
    async fn run(mut self) {
        info!("card actor started");

        while let Some(message) = self.mailbox.recv().await {
            match message {
                EntityMessage::Subscribe { sink, sub_id, reply } => {
                    let _ = reply.send(self.subscribe(sink, sub_id));
                }
                EntityMessage::Unsubscribe { conn_id, sub_id } => {
                    self.unsubscribe(&conn_id, sub_id);
                    if self.subscribers.is_empty() {
                        break;
                    }
                }
                EntityMessage::Revise { revision, reply } => {
                    let _ = reply.send(self.revise(revision));
                }
                EntityMessage::Snapshot { reply } => {
                    let _ = reply.send(self.state.snapshot());
                }
            }
        }

        self.shutdown().await;
    }

    fn subscribe(&mut self, sink: SessionSink, sub_id: i64) -> Result<EntitySnapshot, EntityError> {
        let conn_id = sink.conn_id().to_string();
        let subscriber = self
            .subscribers
            .entry(conn_id.clone())
            .or_insert_with(|| Subscriber { sink, sub_ids: BTreeSet::new() });
        if !subscriber.sub_ids.insert(sub_id) {
            return Err(EntityError::AlreadySubscribed { conn_id, sub_id });
        }

        let snapshot = self.state.snapshot();
        subscriber.sink.send(ServerMessage::SubscribeCard(SubscribeCardRsp {
            card_id: self.state.id.clone(),
            sub_id,
            rev: snapshot.rev,
            props: snapshot.props.clone(),
        }));

        info!(conn_id, sub_id, subscribers = self.subscription_count(), "card subscribed");
        Ok(snapshot)
    }

    fn unsubscribe(&mut self, conn_id: &str, sub_id: i64) {
        let Some(subscriber) = self.subscribers.get_mut(conn_id) else {
            debug!(conn_id, sub_id, "unsubscribe for unknown connection");
            return;
        };
        if !subscriber.sub_ids.remove(&sub_id) {
            debug!(conn_id, sub_id, "unsubscribe for unknown subscription");
            return;
        }
        if subscriber.sub_ids.is_empty() {
            self.subscribers.remove(conn_id);
        }
        info!(conn_id, sub_id, subscribers = self.subscription_count(), "card unsubscribed");
    }

    fn revise(&mut self, revision: Revision) -> Result<i64, EntityError> {
        let Revision { conn_id, sub_id, rev, change } = revision;
        let holds_sub = self
            .subscribers
            .get(&conn_id)
            .is_some_and(|subscriber| subscriber.sub_ids.contains(&sub_id));
        if !holds_sub {
            return Err(EntityError::NotSubscribed { conn_id, sub_id });
        }

        let committed = match self.state.commit(rev, change) {
            Ok(committed) => committed,
            Err(err @ EntityError::Algebra(_)) => {
                error!(conn_id, sub_id, rev, error = %err, "change rejected by text algebra");
                return Err(err);
            }
            Err(err) => {
                warn!(conn_id, sub_id, rev, error = %err, "revision rejected");
                return Err(err);
            }
        };

        metrics::increment_revisions_committed();
        debug!(conn_id, sub_id, rev, head = self.state.head(), prop = %committed.prop, "revision committed");

        for subscriber in self.subscribers.values() {
            subscriber.sink.send(ServerMessage::Revise(ReviseRsp {
                orig_conn_id: conn_id.clone(),
                orig_sub_id: sub_id,
                card_id: self.state.id.clone(),
                sub_ids: subscriber.sub_ids.iter().copied().collect(),
                rev,
                change: committed.clone(),
            }));
        }

        self.persist_tx.send_replace(self.state.props.clone());
        Ok(self.state.head())
    }

    fn subscription_count(&self) -> usize {
        self.subscribers.values().map(|subscriber| subscriber.sub_ids.len()).sum()
    }

    /// Flushes the last snapshot, refuses whatever is still queued and
    /// tells the registry this generation is gone.
    async fn shutdown(self) {
        let EntityActor { state, generation, mut mailbox, done, persist_tx, persister, .. } = self;

        drop(persist_tx);
        if let Err(err) = persister.await {
            warn!(error = %err, "card persister task failed");
        }

        mailbox.close();
        while let Some(message) = mailbox.recv().await {
            message.reject();
        }

        info!(head = state.head(), "card actor stopped");
        let _ = done.send(Terminated { id: state.id, generation });
    }
}

async fn persist_loop(id: String, store: EntityStore, mut rx: watch::Receiver<PropertySnapshot>) {
    while rx.changed().await.is_ok() {
        let props = rx.borrow_and_update().clone();
        match store.upsert(&id, &props, true).await {
            Ok(()) => debug!(props = props.len(), "card persisted"),
            Err(err) => {
                metrics::increment_persist_failures();
                warn!(error = %err, "failed to persist card");
            }
        }
    }
}
