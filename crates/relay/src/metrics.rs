use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    revisions_committed_total: AtomicU64,
    persist_failures_total: AtomicU64,
    query_failures_total: AtomicU64,
    live_entities: AtomicU64,
    live_queries: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(message_type: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(message_type, is_error);
    }
}

pub fn increment_revisions_committed() {
    if let Some(metrics) = global_metrics() {
        metrics.revisions_committed_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_persist_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_query_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.query_failures_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn set_live_entities(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_live_entities(count);
    }
}

pub fn set_live_queries(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_live_queries(count);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, message_type: &str, is_error: bool) {
        let label = normalize_ws_type(message_type);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn set_live_entities(&self, count: usize) {
        self.live_entities.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_live_queries(&self, count: usize) {
        self.live_queries.store(count as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total websocket requests by message type.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", &self.ws_rate_total);

        output.push_str(
            "# HELP relay_ws_errors_total Total websocket requests answered with an error.\n",
        );
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        append_scalar(
            &mut output,
            "revisions_committed_total",
            "counter",
            "Total revisions committed across all cards.",
            &self.revisions_committed_total,
        );
        append_scalar(
            &mut output,
            "persist_failures_total",
            "counter",
            "Total card snapshots that failed to persist.",
            &self.persist_failures_total,
        );
        append_scalar(
            &mut output,
            "query_failures_total",
            "counter",
            "Total live query refreshes that failed.",
            &self.query_failures_total,
        );
        append_scalar(
            &mut output,
            "live_entities",
            "gauge",
            "Cards with a running actor.",
            &self.live_entities,
        );
        append_scalar(
            &mut output,
            "live_queries",
            "gauge",
            "Queries with a running actor.",
            &self.live_queries,
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let segments: Vec<String> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}".to_string()
            } else if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}".to_string()
            } else {
                segment.to_string()
            }
        })
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_ws_type(message_type: &str) -> String {
    let normalized = message_type.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_scalar(output: &mut String, name: &str, kind: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{type=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
