// Coordinator that guarantees at most one live actor per card id.
//
// Every lookup, creation and teardown is serialised through a single task.
// Actors report their own termination tagged with a generation, so a late
// report from a retired actor never evicts its successor.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, Instrument};

use super::entity::{spawn_entity, EntityError, EntityHandle, EntitySnapshot, Terminated};
use crate::metrics;
use crate::store::{EntityStore, StoreError};
use crate::ws::SessionSink;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error("card registry has stopped")]
    Stopped,
}

type SubscribeReply = oneshot::Sender<Result<(EntityHandle, EntitySnapshot), RegistryError>>;

enum RegistryCommand {
    Subscribe { id: String, sink: SessionSink, sub_id: i64, reply: SubscribeReply },
    Count { reply: oneshot::Sender<usize> },
}

#[derive(Debug, Clone)]
pub struct EntityRegistry {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl EntityRegistry {
    pub fn spawn(store: EntityStore) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            store,
            entities: HashMap::new(),
            next_generation: 0,
            done_tx,
        };
        tokio::spawn(coordinator.run(commands, done_rx).instrument(info_span!("relay.cards")));
        Self { tx }
    }

    /// Subscribes `sink` to card `id`, loading the card first if no actor
    /// holds it. The returned handle stays valid for the life of the
    /// subscription.
    pub async fn subscribe(
        &self,
        id: &str,
        sink: SessionSink,
        sub_id: i64,
    ) -> Result<(EntityHandle, EntitySnapshot), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Subscribe { id: id.to_string(), sink, sub_id, reply })
            .map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)?
    }

    /// Drops one subscription. The actor retires itself once its last
    /// subscription goes.
    pub fn unsubscribe(&self, handle: &EntityHandle, conn_id: &str, sub_id: i64) {
        handle.unsubscribe(conn_id, sub_id);
    }

    pub async fn live_count(&self) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Count { reply }).map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)
    }
}

struct Coordinator {
    store: EntityStore,
    entities: HashMap<String, EntityHandle>,
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
                        RegistryCommand::Subscribe { id, sink, sub_id, reply } => {
                            let _ = reply.send(self.subscribe(id, sink, sub_id).await);
                        }
                        RegistryCommand::Count { reply } => {
                            let _ = reply.send(self.entities.len());
                        }
                    }
                }
            }
        }
        debug!("card registry stopped");
    }

    async fn subscribe(
        &mut self,
        id: String,
        sink: SessionSink,
        sub_id: i64,
    ) -> Result<(EntityHandle, EntitySnapshot), RegistryError> {
        if let Some(handle) = self.entities.get(&id).cloned() {
            match handle.subscribe(sink.clone(), sub_id).await {
                Ok(snapshot) => return Ok((handle, snapshot)),
                Err(EntityError::Stopped) => {
                    // Retiring actor; its final snapshot is already persisted.
                    debug!(entity_id = %id, generation = handle.generation(), "replacing retiring card actor");
                    self.entities.remove(&id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let props = self.store.get_by_id(&id).await?;
        self.next_generation += 1;
        let handle = spawn_entity(
            id.clone(),
            props,
            self.next_generation,
            self.store.clone(),
            self.done_tx.clone(),
        );
        self.entities.insert(id.clone(), handle.clone());
        metrics::set_live_entities(self.entities.len());
        info!(entity_id = %id, generation = handle.generation(), live = self.entities.len(), "card loaded");

        let snapshot = handle.subscribe(sink, sub_id).await?;
        Ok((handle, snapshot))
    }

    fn on_terminated(&mut self, terminated: Terminated) {
        let current = self.entities.get(&terminated.id).map(EntityHandle::generation);
        if current != Some(terminated.generation) {
            debug!(
                entity_id = %terminated.id,
                generation = terminated.generation,
                "ignoring termination of replaced card actor"
            );
            return;
        }
        self.entities.remove(&terminated.id);
        metrics::set_live_entities(self.entities.len());
        info!(entity_id = %terminated.id, live = self.entities.len(), "card unloaded");
    }
}
