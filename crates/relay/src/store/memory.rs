use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use onde_common::types::{PropertySnapshot, SearchHit, BODY_PROP};
use tokio::sync::RwLock;

use super::{split_field, QueryPage, StoreError, PROP_PREFIX};

/// In-process store for development and tests.
///
/// Writes are visible immediately. Queries are case-insensitive substring
/// matches against the body, or against `<name>` for `prop_<name>:` queries.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    collection: String,
    records: Arc<RwLock<HashMap<String, PropertySnapshot>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            records: Arc::new(RwLock::new(HashMap::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<PropertySnapshot, StoreError> {
        self.check_available()?;
        self.records.read().await.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            collection: self.collection.clone(),
            id: id.to_string(),
        })
    }

    pub async fn upsert(&self, id: &str, props: &PropertySnapshot) -> Result<(), StoreError> {
        self.check_available()?;
        self.records.write().await.insert(id.to_string(), props.clone());
        Ok(())
    }

    pub async fn query(&self, query: &str) -> Result<QueryPage, StoreError> {
        self.check_available()?;
        let (field, text) = split_field(query);
        let prop = field.and_then(|field| field.strip_prefix(PROP_PREFIX)).unwrap_or(BODY_PROP);
        let needle = text.trim().to_lowercase();

        let records = self.records.read().await;
        let mut hits: Vec<SearchHit> = records
            .iter()
            .filter(|(_, props)| {
                props.get(prop).is_some_and(|value| value.to_lowercase().contains(&needle))
            })
            .map(|(id, props)| SearchHit { id: id.clone(), props: props.clone() })
            .collect();
        hits.sort_by(|left, right| left.id.cmp(&right.id));

        Ok(QueryPage { total: hits.len(), hits })
    }
}

#[cfg(test)]
mod tests {
    use onde_common::types::PropertySnapshot;

    use super::MemoryStore;
    use crate::store::StoreError;

    fn props(pairs: &[(&str, &str)]) -> PropertySnapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn upsert_replaces_whole_record() {
        let store = MemoryStore::new("onde");
        store.upsert("c1", &props(&[("body", "a"), ("title", "t")])).await.expect("first write");
        store.upsert("c1", &props(&[("body", "b")])).await.expect("second write");

        assert_eq!(store.get_by_id("c1").await.expect("record exists"), props(&[("body", "b")]));
    }

    #[tokio::test]
    async fn query_matches_body_case_insensitively() {
        let store = MemoryStore::new("onde");
        store.upsert("b", &props(&[("body", "Hello World")])).await.expect("write");
        store.upsert("a", &props(&[("body", "say hello")])).await.expect("write");
        store.upsert("user|ada", &props(&[("pass", "hello")])).await.expect("write");

        let page = store.query("HELLO").await.expect("query");
        let ids: Vec<_> = page.hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page.total, 2);

        let titled = store.query("prop_pass:hello").await.expect("query");
        assert_eq!(titled.hits.len(), 1);
    }

    #[tokio::test]
    async fn fault_switch_fails_every_call() {
        let store = MemoryStore::new("onde");
        store.set_failing(true);
        assert!(matches!(store.get_by_id("x").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.query("x").await, Err(StoreError::Unavailable(_))));

        store.set_failing(false);
        assert!(matches!(store.get_by_id("x").await, Err(StoreError::NotFound { .. })));
    }
}
