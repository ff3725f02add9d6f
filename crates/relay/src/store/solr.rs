// Solr-backed store.
//
// Cards live in one collection as flat documents: the card id plus one
// `prop_<name>` text field per property. User records share the collection
// under `user|<id>` ids.

use std::{error::Error as _, io, time::Duration};

use onde_common::types::{PropertySnapshot, SearchHit, BODY_PROP};
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::{split_field, QueryPage, StoreError, PROP_PREFIX};

const SELECT_HANDLER: &str = "select";
const UPDATE_HANDLER: &str = "update";
/// `_version_ = 0` tells Solr to overwrite without an optimistic-lock check.
const DOC_VERSION: i64 = 0;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Backoff for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(2),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SolrStore {
    client: Client,
    base_url: Url,
    collection: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct SelectEnvelope {
    response: SelectResponse,
}

#[derive(Deserialize)]
struct SelectResponse {
    #[serde(rename = "numFound")]
    num_found: usize,
    #[serde(default)]
    docs: Vec<Map<String, Value>>,
}

impl SolrStore {
    pub fn new(base_url: &str, collection: impl Into<String>) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|err| {
            StoreError::Unavailable(format!("invalid store url `{base_url}`: {err}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Unavailable(format!("store url `{base_url}` cannot be a base")));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self { client, base_url, collection: collection.into(), retry: RetryPolicy::default() })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn get_by_id(&self, id: &str) -> Result<PropertySnapshot, StoreError> {
        let term = format!("{{!term f=id}}{id}");
        let url = self.endpoint(SELECT_HANDLER, &[("q", term.as_str()), ("rows", "1")])?;
        let envelope: SelectEnvelope = self.send(|| self.client.get(url.clone())).await?;

        let page = into_page(envelope)?;
        page.hits.into_iter().next().map(|hit| hit.props).ok_or_else(|| StoreError::NotFound {
            collection: self.collection.clone(),
            id: id.to_string(),
        })
    }

    pub async fn upsert(
        &self,
        id: &str,
        props: &PropertySnapshot,
        force_visible: bool,
    ) -> Result<(), StoreError> {
        let mut doc = Map::new();
        doc.insert("id".into(), Value::String(id.to_string()));
        doc.insert("_version_".into(), json!(DOC_VERSION));
        for (name, text) in props {
            doc.insert(format!("{PROP_PREFIX}{name}"), Value::String(text.clone()));
        }
        let body = serde_json::to_vec(&json!({ "add": { "doc": doc } }))
            .map_err(|err| StoreError::Decode(err.to_string()))?;

        let params: &[(&str, &str)] = if force_visible { &[("commit", "true")] } else { &[] };
        let url = self.endpoint(UPDATE_HANDLER, params)?;
        let _: Value = self
            .send(|| {
                self.client
                    .post(url.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;

        debug!(id, props = props.len(), force_visible, "store record written");
        Ok(())
    }

    pub async fn query(&self, query: &str) -> Result<QueryPage, StoreError> {
        let scoped = match split_field(query) {
            (Some(_), _) => query.to_string(),
            (None, text) => format!("{PROP_PREFIX}{BODY_PROP}:{text}"),
        };
        let url = self.endpoint(SELECT_HANDLER, &[("q", scoped.as_str())])?;
        let envelope: SelectEnvelope = self.send(|| self.client.get(url.clone())).await?;
        into_page(envelope)
    }

    fn endpoint(&self, handler: &str, params: &[(&str, &str)]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                StoreError::Unavailable(format!("store url `{}` cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .push(&self.collection)
            .push(handler);
        url.query_pairs_mut().append_pair("wt", "json").extend_pairs(params.iter());
        Ok(url)
    }

    async fn send<T, F>(&self, build: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let response = loop {
            match build().send().await {
                Ok(response) => break response,
                Err(err) if retries < self.retry.max_attempts && is_transient(&err) => {
                    retries += 1;
                    let delay = self.retry.delay_for(retries);
                    warn!(
                        retry = retries,
                        max_retries = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status: status.as_u16(), body: truncate(&body) });
        }

        response.json::<T>().await.map_err(|err| StoreError::Decode(err.to_string()))
    }
}

fn into_page(envelope: SelectEnvelope) -> Result<QueryPage, StoreError> {
    let hits = envelope
        .response
        .docs
        .into_iter()
        .map(doc_to_hit)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryPage { total: envelope.response.num_found, hits })
}

fn doc_to_hit(doc: Map<String, Value>) -> Result<SearchHit, StoreError> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Decode("document without a string id".into()))?
        .to_string();

    let props = doc
        .into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(PROP_PREFIX)?.to_string();
            // Multi-valued fields come back as arrays; the first value wins.
            let text = match value {
                Value::String(text) => text,
                Value::Array(values) => values.into_iter().find_map(|value| match value {
                    Value::String(text) => Some(text),
                    _ => None,
                })?,
                _ => return None,
            };
            Some((name, text))
        })
        .collect();

    Ok(SearchHit { id, props })
}

fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use axum::{
        extract::Query,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    use super::{RetryPolicy, SolrStore};
    use crate::store::StoreError;

    type Params = HashMap<String, String>;

    async fn spawn_solr(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock solr should serve");
        });
        format!("http://{addr}/solr")
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 2,
        }
    }

    #[test]
    fn retry_delays_double_from_base_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(4), Duration::from_millis(160));
        assert_eq!(policy.delay_for(30), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn get_by_id_uses_term_query_and_strips_prop_prefix() {
        let seen = Arc::new(Mutex::new(Vec::<Params>::new()));
        let recorded = Arc::clone(&seen);
        let router = Router::new().route(
            "/solr/onde/select",
            get(move |Query(params): Query<Params>| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().expect("params lock").push(params);
                    Json(json!({
                        "response": {
                            "numFound": 1,
                            "docs": [{
                                "id": "card-1",
                                "_version_": 17,
                                "prop_body": "hello",
                                "prop_title": ["Greeting"],
                            }]
                        }
                    }))
                }
            }),
        );
        let store = SolrStore::new(&spawn_solr(router).await, "onde").expect("store should build");

        let props = store.get_by_id("card-1").await.expect("card should load");
        assert_eq!(props.get("body").map(String::as_str), Some("hello"));
        assert_eq!(props.get("title").map(String::as_str), Some("Greeting"));
        assert_eq!(props.len(), 2);

        let params = seen.lock().expect("params lock");
        assert_eq!(params[0]["q"], "{!term f=id}card-1");
        assert_eq!(params[0]["rows"], "1");
        assert_eq!(params[0]["wt"], "json");
    }

    #[tokio::test]
    async fn get_by_id_maps_empty_result_to_not_found() {
        let router = Router::new().route(
            "/solr/onde/select",
            get(|| async { Json(json!({ "response": { "numFound": 0, "docs": [] } })) }),
        );
        let store = SolrStore::new(&spawn_solr(router).await, "onde").expect("store should build");

        let err = store.get_by_id("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id, .. } if id == "missing"));
    }

    #[tokio::test]
    async fn upsert_posts_prefixed_document_and_commits_when_forced() {
        let seen = Arc::new(Mutex::new(Vec::<(Params, Value)>::new()));
        let recorded = Arc::clone(&seen);
        let router = Router::new().route(
            "/solr/onde/update",
            post(move |Query(params): Query<Params>, Json(body): Json<Value>| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().expect("update lock").push((params, body));
                    Json(json!({ "responseHeader": { "status": 0 } }))
                }
            }),
        );
        let store = SolrStore::new(&spawn_solr(router).await, "onde").expect("store should build");

        let mut props = onde_common::types::PropertySnapshot::new();
        props.insert("body".into(), "text".into());
        store.upsert("card-9", &props, true).await.expect("forced upsert");
        store.upsert("card-9", &props, false).await.expect("lazy upsert");

        let updates = seen.lock().expect("update lock");
        assert_eq!(updates[0].0.get("commit").map(String::as_str), Some("true"));
        assert!(!updates[1].0.contains_key("commit"));
        assert_eq!(
            updates[0].1,
            json!({ "add": { "doc": { "id": "card-9", "_version_": 0, "prop_body": "text" } } })
        );
    }

    #[tokio::test]
    async fn query_scopes_bare_text_to_body() {
        let seen = Arc::new(Mutex::new(Vec::<Params>::new()));
        let recorded = Arc::clone(&seen);
        let router = Router::new().route(
            "/solr/onde/select",
            get(move |Query(params): Query<Params>| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().expect("params lock").push(params);
                    Json(json!({
                        "response": { "numFound": 12, "docs": [{ "id": "a", "prop_body": "x" }] }
                    }))
                }
            }),
        );
        let store = SolrStore::new(&spawn_solr(router).await, "onde").expect("store should build");

        let page = store.query("hello").await.expect("query should succeed");
        assert_eq!(page.total, 12);
        assert_eq!(page.hits.len(), 1);
        store.query("prop_title:hello").await.expect("scoped query should succeed");

        let params = seen.lock().expect("params lock");
        assert_eq!(params[0]["q"], "prop_body:hello");
        assert_eq!(params[1]["q"], "prop_title:hello");
    }

    #[tokio::test]
    async fn http_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let router = Router::new().route(
            "/solr/onde/select",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::INTERNAL_SERVER_ERROR, "x".repeat(2_000))
                }
            }),
        );
        let store = SolrStore::new(&spawn_solr(router).await, "onde")
            .expect("store should build")
            .with_retry_policy(fast_retries());

        let err = store.query("hello").await.unwrap_err();
        match err {
            StoreError::Http { status, body } => {
                assert_eq!(status, 500);
                assert!(body.len() < 600);
            }
            other => panic!("expected http error, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_failures_surface_as_transport_errors_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        drop(listener);

        let store = SolrStore::new(&format!("http://{addr}/solr"), "onde")
            .expect("store should build")
            .with_retry_policy(fast_retries());

        let err = store.get_by_id("card").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(SolrStore::new("not a url", "onde"), Err(StoreError::Unavailable(_))));
    }
}
