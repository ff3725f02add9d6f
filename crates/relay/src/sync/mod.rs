pub mod entity;
pub mod registry;

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use onde_common::types::{PropertySnapshot, BODY_PROP};
use sha2::{Digest, Sha256};
use tracing::info;

pub use entity::{EntityError, EntityHandle, Revision};
pub use registry::{EntityRegistry, RegistryError};

use crate::store::{EntityStore, StoreError};

/// Derives a card id from the creating connection and the current time.
pub fn new_card_id(conn_id: &str, nanos: u128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conn_id.as_bytes());
    hasher.update(nanos.to_be_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..8])
}

/// Writes a new card and returns its id. The write is committed so the
/// card is immediately subscribable and searchable.
pub async fn create_entity(
    store: &EntityStore,
    conn_id: &str,
    mut props: PropertySnapshot,
) -> Result<String, StoreError> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let id = new_card_id(conn_id, nanos);

    if props.is_empty() {
        props.insert(BODY_PROP.to_string(), String::new());
    }
    store.upsert(&id, &props, true).await?;
    info!(entity_id = %id, conn_id, "card created");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use onde_common::types::PropertySnapshot;

    use super::{create_entity, new_card_id};
    use crate::store::{EntityStore, MemoryStore, StoreError};

    #[test]
    fn card_ids_are_short_url_safe_and_distinct() {
        let first = new_card_id("conn-a", 1);
        let second = new_card_id("conn-a", 2);
        let third = new_card_id("conn-b", 1);

        assert_eq!(first.len(), 11);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(first, second);
        assert_ne!(first, third);
        assert_eq!(first, new_card_id("conn-a", 1));
    }

    #[tokio::test]
    async fn empty_props_create_an_empty_body() {
        let memory = MemoryStore::new("onde");
        let store = EntityStore::Memory(memory.clone());

        let id = create_entity(&store, "conn-a", PropertySnapshot::new()).await.expect("create");
        let props = memory.get_by_id(&id).await.expect("stored");
        assert_eq!(props.get("body").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn given_props_are_stored_verbatim() {
        let memory = MemoryStore::new("onde");
        let store = EntityStore::Memory(memory.clone());
        let props = PropertySnapshot::from([
            ("title".to_string(), "Groceries".to_string()),
            ("body".to_string(), "milk".to_string()),
        ]);

        let id = create_entity(&store, "conn-a", props.clone()).await.expect("create");
        assert_eq!(memory.get_by_id(&id).await.expect("stored"), props);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let memory = MemoryStore::new("onde");
        memory.set_failing(true);
        let err = create_entity(&EntityStore::Memory(memory), "conn-a", PropertySnapshot::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
