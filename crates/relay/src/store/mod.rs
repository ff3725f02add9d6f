// Persistence and search backends for card snapshots and user records.
//
// The relay only ever needs three things from a store: fetch one record,
// replace one record and run a free-text query. Each backend is a variant of
// `EntityStore` so callers stay backend-agnostic without boxing.

pub mod memory;
pub mod solr;

use onde_common::types::{PropertySnapshot, SearchHit};
use thiserror::Error;

pub use memory::MemoryStore;
pub use solr::SolrStore;

/// Prefix the search index puts in front of every card property.
pub const PROP_PREFIX: &str = "prop_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not decode store response: {0}")]
    Decode(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    /// Total matches in the index, which may exceed `hits.len()`.
    pub total: usize,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub enum EntityStore {
    Solr(SolrStore),
    Memory(MemoryStore),
}

impl EntityStore {
    pub fn collection(&self) -> &str {
        match self {
            Self::Solr(store) => store.collection(),
            Self::Memory(store) => store.collection(),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<PropertySnapshot, StoreError> {
        match self {
            Self::Solr(store) => store.get_by_id(id).await,
            Self::Memory(store) => store.get_by_id(id).await,
        }
    }

    /// Replaces the record `id` with `props`. With `force_visible` the write
    /// is committed so that queries see it right away.
    pub async fn upsert(
        &self,
        id: &str,
        props: &PropertySnapshot,
        force_visible: bool,
    ) -> Result<(), StoreError> {
        match self {
            Self::Solr(store) => store.upsert(id, props, force_visible).await,
            Self::Memory(store) => store.upsert(id, props).await,
        }
    }

    pub async fn query(&self, query: &str) -> Result<QueryPage, StoreError> {
        match self {
            Self::Solr(store) => store.query(query).await,
            Self::Memory(store) => store.query(query).await,
        }
    }
}

/// Splits an optional `prop_<name>:` field prefix off a query. Unscoped
/// queries target the body.
pub(crate) fn split_field(query: &str) -> (Option<&str>, &str) {
    match query.split_once(':') {
        Some((field, rest)) if is_field_name(field) => (Some(field), rest),
        _ => (None, query),
    }
}

fn is_field_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::split_field;

    #[test]
    fn split_field_detects_prefix() {
        assert_eq!(split_field("prop_title:hello"), (Some("prop_title"), "hello"));
        assert_eq!(split_field("hello world"), (None, "hello world"));
        assert_eq!(split_field("http://x"), (Some("http"), "//x"));
        assert_eq!(split_field("a b:c"), (None, "a b:c"));
    }
}
