#![allow(dead_code)]

use {
    axum::{
        body::Bytes,
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, put},
        Json, Router,
    },
    base64::{engine::general_purpose::STANDARD as BASE64, Engine as _},
    rust_consul_client::client::{Config, ConsulClient},
    serde_json::{json, Value},
    std::{
        collections::{BTreeMap, HashMap},
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        net::TcpListener,
        sync::{watch, Mutex},
    },
};

const INDEX_HEADER: &str = "X-Consul-Index";

static TRACING: std::sync::Once = std::sync::Once::new();

/// Installs a subscriber honoring `RUST_LOG`, once per test binary.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Server-side wait applied when a blocking request does not name one.
/// Deliberately short so tests never hang on the real default.
const DEFAULT_WAIT: Duration = Duration::from_secs(5);

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
struct StoredKv {
    value: Vec<u8>,
    flags: u64,
    session: Option<String>,
    create_index: u64,
    modify_index: u64,
}

#[derive(Default)]
struct Store {
    index: u64,
    services_index: u64,
    kv: BTreeMap<String, StoredKv>,
    services: BTreeMap<String, Vec<String>>,
}

struct AgentState {
    store: Mutex<Store>,
    change: watch::Sender<u64>,
    failing: AtomicBool,
    strip_index: AtomicBool,
}

///
/// In-process Consul look-alike covering exactly the surface this crate
/// exercises: blocking KV reads, KV writes, the service catalog and the
/// transaction endpoint, including all-or-nothing semantics and the
/// `X-Consul-Index` header.
///
pub struct MockAgent {
    addr: SocketAddr,
    state: Arc<AgentState>,
}

impl MockAgent {
    pub async fn spawn() -> MockAgent {
        init_tracing();
        let (change, _) = watch::channel(0);
        let state = Arc::new(AgentState {
            store: Mutex::new(Store::default()),
            change,
            failing: AtomicBool::new(false),
            strip_index: AtomicBool::new(false),
        });
        let app = Router::new()
            .route(
                "/v1/kv/{*key}",
                get(kv_get).put(kv_put).delete(kv_delete),
            )
            .route("/v1/catalog/services", get(catalog_services))
            .route("/v1/txn", put(txn))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock agent");
        let addr = listener.local_addr().expect("mock agent local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock agent died");
        });
        MockAgent { addr, state }
    }

    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn client(&self) -> ConsulClient {
        ConsulClient::new(Config::new(self.address()))
    }

    pub fn client_with_timeout(&self, timeout: Duration) -> ConsulClient {
        ConsulClient::new(Config::new(self.address()).with_timeout(timeout))
    }

    /// While on, every request is answered with 503.
    pub fn set_failing(&self, on: bool) {
        self.state.failing.store(on, Ordering::Release);
    }

    /// While on, responses omit the index header.
    pub fn strip_index_header(&self, on: bool) {
        self.state.strip_index.store(on, Ordering::Release);
    }
}

fn parse_wait(raw: &str) -> Duration {
    if let Some(mins) = raw.strip_suffix('m') {
        Duration::from_secs(mins.parse::<u64>().unwrap_or(0) * 60)
    } else if let Some(secs) = raw.strip_suffix('s') {
        Duration::from_secs(secs.parse::<u64>().unwrap_or(0))
    } else {
        DEFAULT_WAIT
    }
}

fn wire_kv(key: &str, entry: &StoredKv, with_value: bool) -> Value {
    json!({
        "Key": key,
        "Value": if with_value { Value::String(BASE64.encode(&entry.value)) } else { Value::Null },
        "Flags": entry.flags,
        "Session": entry.session,
        "CreateIndex": entry.create_index,
        "ModifyIndex": entry.modify_index,
        "LockIndex": 0,
    })
}

impl AgentState {
    fn indexed(&self, status: StatusCode, index: u64, body: Option<Value>) -> Response {
        let mut headers = HeaderMap::new();
        if !self.strip_index.load(Ordering::Acquire) {
            headers.insert(
                INDEX_HEADER,
                HeaderValue::from_str(&index.to_string()).expect("numeric header"),
            );
        }
        match body {
            Some(body) => (status, headers, Json(body)).into_response(),
            None => (status, headers).into_response(),
        }
    }
}

/// Computes the resource index and matching entries for one KV read.
fn kv_snapshot(store: &Store, key: &str, recurse: bool) -> (u64, Vec<Value>) {
    let matches: Vec<(&String, &StoredKv)> = if recurse {
        store
            .kv
            .range(key.to_string()..)
            .take_while(|(k, _)| k.starts_with(key))
            .collect()
    } else {
        store.kv.get_key_value(key).into_iter().collect()
    };
    let resource_index = matches
        .iter()
        .map(|(_, e)| e.modify_index)
        .max()
        .unwrap_or(store.index);
    let entries = matches
        .into_iter()
        .map(|(k, e)| wire_kv(k, e, true))
        .collect();
    (resource_index, entries)
}

async fn kv_get(
    State(state): State<Arc<AgentState>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.failing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response();
    }
    let recurse = params.contains_key("recurse");
    let want: u64 = params
        .get("index")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let wait = params
        .get("wait")
        .map(|raw| parse_wait(raw))
        .unwrap_or(DEFAULT_WAIT);
    let deadline = tokio::time::Instant::now() + wait;
    let mut change_rx = state.change.subscribe();
    loop {
        let (resource_index, entries) = {
            let store = state.store.lock().await;
            kv_snapshot(&store, &key, recurse)
        };
        let expired = tokio::time::Instant::now() >= deadline;
        if want == 0 || resource_index > want || expired {
            return if entries.is_empty() {
                state.indexed(StatusCode::NOT_FOUND, resource_index, None)
            } else {
                state.indexed(StatusCode::OK, resource_index, Some(Value::Array(entries)))
            };
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            changed = change_rx.changed() => {
                if changed.is_err() {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    }
}

async fn kv_put(
    State(state): State<Arc<AgentState>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if state.failing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response();
    }
    let flags: u64 = params
        .get("flags")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let cas: Option<u64> = params.get("cas").and_then(|raw| raw.parse().ok());
    let mut store = state.store.lock().await;
    let allowed = match cas {
        Some(0) => !store.kv.contains_key(&key),
        Some(expected) => store
            .kv
            .get(&key)
            .map(|e| e.modify_index == expected)
            .unwrap_or(false),
        None => true,
    };
    if allowed {
        store.index += 1;
        let index = store.index;
        let create_index = store.kv.get(&key).map(|e| e.create_index).unwrap_or(index);
        store.kv.insert(
            key,
            StoredKv {
                value: body.to_vec(),
                flags,
                session: None,
                create_index,
                modify_index: index,
            },
        );
        let _ = state.change.send(index);
    }
    (StatusCode::OK, if allowed { "true" } else { "false" }).into_response()
}

async fn kv_delete(
    State(state): State<Arc<AgentState>>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.failing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response();
    }
    let recurse = params.contains_key("recurse");
    let mut store = state.store.lock().await;
    if recurse {
        store.kv.retain(|k, _| !k.starts_with(&key));
    } else {
        store.kv.remove(&key);
    }
    store.index += 1;
    let index = store.index;
    let _ = state.change.send(index);
    (StatusCode::OK, "true").into_response()
}

async fn catalog_services(
    State(state): State<Arc<AgentState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.failing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response();
    }
    let want: u64 = params
        .get("index")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let wait = params
        .get("wait")
        .map(|raw| parse_wait(raw))
        .unwrap_or(DEFAULT_WAIT);
    let deadline = tokio::time::Instant::now() + wait;
    let mut change_rx = state.change.subscribe();
    loop {
        let (resource_index, body) = {
            let store = state.store.lock().await;
            let index = if store.services_index > 0 {
                store.services_index
            } else {
                store.index
            };
            (index, json!(store.services))
        };
        let expired = tokio::time::Instant::now() >= deadline;
        if want == 0 || resource_index > want || expired {
            return state.indexed(StatusCode::OK, resource_index, Some(body));
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            changed = change_rx.changed() => {
                if changed.is_err() {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            }
        }
    }
}

fn str_field<'a>(op: &'a Value, field: &str) -> &'a str {
    op.get(field).and_then(Value::as_str).unwrap_or("")
}

/// Transaction endpoint: validate every operation first, apply only if no
/// operation was rejected. Any rejection yields a 409 with zero results.
async fn txn(State(state): State<Arc<AgentState>>, body: Bytes) -> Response {
    if state.failing.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "injected failure").into_response();
    }
    let ops: Vec<Value> = match serde_json::from_slice(&body) {
        Ok(ops) => ops,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut store = state.store.lock().await;
    let mut errors = Vec::new();
    for (op_index, op) in ops.iter().enumerate() {
        if let Some(kv) = op.get("KV") {
            let verb = str_field(kv, "Verb");
            let key = str_field(kv, "Key");
            let index = kv.get("Index").and_then(Value::as_u64).unwrap_or(0);
            match verb {
                "set" | "delete" | "delete-tree" | "get-tree" => {}
                "cas" | "delete-cas" => {
                    let current = store.kv.get(key).map(|e| e.modify_index).unwrap_or(0);
                    if current != index {
                        errors.push((
                            op_index,
                            format!(
                                "failed index check for key {key:?}, current modify index {current}"
                            ),
                        ));
                    }
                }
                "check-index" => match store.kv.get(key) {
                    None => errors.push((op_index, format!("key {key:?} doesn't exist"))),
                    Some(e) if e.modify_index != index => errors.push((
                        op_index,
                        format!(
                            "current modify index {} does not match {index} for key {key:?}",
                            e.modify_index
                        ),
                    )),
                    Some(_) => {}
                },
                "get" => {
                    if !store.kv.contains_key(key) {
                        errors.push((op_index, format!("key {key:?} doesn't exist")));
                    }
                }
                "lock" | "unlock" | "check-session" => {
                    if str_field(kv, "Session").is_empty() {
                        errors.push((op_index, format!("missing session for key {key:?}")));
                    }
                }
                other => errors.push((op_index, format!("unknown KV verb {other:?}"))),
            }
        } else if let Some(svc) = op.get("Service") {
            let verb = str_field(svc, "Verb");
            let name = svc
                .pointer("/Service/Service")
                .and_then(Value::as_str)
                .unwrap_or("");
            match verb {
                "set" | "delete" => {}
                "cas" | "get" | "delete-cas" => {
                    if !store.services.contains_key(name) {
                        errors.push((op_index, format!("service {name:?} doesn't exist")));
                    }
                }
                other => errors.push((op_index, format!("unknown Service verb {other:?}"))),
            }
        } else {
            errors.push((op_index, "unknown operation kind".to_string()));
        }
    }

    if !errors.is_empty() {
        let errors: Vec<Value> = errors
            .into_iter()
            .map(|(op_index, what)| json!({"OpIndex": op_index, "What": what}))
            .collect();
        return (
            StatusCode::CONFLICT,
            Json(json!({"Results": Value::Null, "Errors": errors})),
        )
            .into_response();
    }

    store.index += 1;
    let index = store.index;
    let mut results = Vec::new();
    let mut touched_services = false;
    for op in &ops {
        if let Some(kv) = op.get("KV") {
            let verb = str_field(kv, "Verb");
            let key = str_field(kv, "Key").to_string();
            match verb {
                "set" | "cas" | "lock" | "unlock" => {
                    let value = BASE64
                        .decode(str_field(kv, "Value"))
                        .unwrap_or_default();
                    let flags = kv.get("Flags").and_then(Value::as_u64).unwrap_or(0);
                    let session = Some(str_field(kv, "Session").to_string())
                        .filter(|s| !s.is_empty());
                    let create_index =
                        store.kv.get(&key).map(|e| e.create_index).unwrap_or(index);
                    let entry = StoredKv {
                        value,
                        flags,
                        session,
                        create_index,
                        modify_index: index,
                    };
                    results.push(json!({"KV": wire_kv(&key, &entry, false)}));
                    store.kv.insert(key, entry);
                }
                "get" => {
                    if let Some(entry) = store.kv.get(&key) {
                        results.push(json!({"KV": wire_kv(&key, entry, true)}));
                    }
                }
                "get-tree" => {
                    let (_, entries) = kv_snapshot(&store, &key, true);
                    results.extend(entries.into_iter().map(|e| json!({"KV": e})));
                }
                "delete" | "delete-cas" => {
                    store.kv.remove(&key);
                }
                "delete-tree" => {
                    store.kv.retain(|k, _| !k.starts_with(&key));
                }
                // check-index / check-session assert only, no result entry
                _ => {}
            }
        } else if let Some(svc) = op.get("Service") {
            let verb = str_field(svc, "Verb");
            let desc = svc.get("Service").cloned().unwrap_or(Value::Null);
            let name = desc
                .get("Service")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            match verb {
                "set" | "cas" => {
                    let tags: Vec<String> = desc
                        .get("Tags")
                        .and_then(Value::as_array)
                        .map(|tags| {
                            tags.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    store.services.insert(name, tags);
                    touched_services = true;
                    results.push(json!({"Service": desc}));
                }
                "get" => results.push(json!({"Service": desc})),
                "delete" | "delete-cas" => {
                    store.services.remove(&name);
                    touched_services = true;
                }
                _ => {}
            }
        }
    }
    if touched_services {
        store.services_index = index;
    }
    let _ = state.change.send(index);
    (
        StatusCode::OK,
        Json(json!({"Results": results, "Errors": Value::Null})),
    )
        .into_response()
}
