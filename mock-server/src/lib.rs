//! In-memory emulation of an Invenio-style search API.
//!
//! Records live in a `Vec` so listings keep insertion order. Every handler
//! answers with JSON except `DELETE` (empty 204) and `/api/status/{code}`
//! (plain text).

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// Number of records `app()` starts with.
pub const SEED_RECORDS: usize = 35;

const DEFAULT_SIZE: usize = 10;
const TIMESTAMP: &str = "2024-01-01T00:00:00+00:00";

/// Facets the listing can aggregate on, with their labels.
const FACETS: [(&str, &str); 2] = [("kind", "Kind"), ("year", "Year")];
const KINDS: [&str; 3] = ["article", "dataset", "software"];

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub metadata: Value,
    pub revision: u64,
    pub created: String,
    pub updated: String,
}

impl StoredRecord {
    fn new(id: String, metadata: Value) -> Self {
        Self {
            id,
            metadata,
            revision: 1,
            created: TIMESTAMP.to_string(),
            updated: TIMESTAMP.to_string(),
        }
    }

    /// Wire shape: the stored fields plus `links.self`.
    fn to_json(&self, base: &str) -> Value {
        json!({
            "id": self.id,
            "metadata": self.metadata,
            "revision": self.revision,
            "created": self.created,
            "updated": self.updated,
            "links": {"self": format!("{base}/api/records/{}", self.id)},
        })
    }
}

#[derive(Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Default)]
pub struct Store {
    records: Vec<StoredRecord>,
    /// Calls seen per flaky endpoint name.
    attempts: HashMap<String, u32>,
}

impl Store {
    pub fn seeded(count: usize) -> Self {
        let records = (1..=count)
            .map(|i| {
                StoredRecord::new(
                    i.to_string(),
                    json!({
                        "title": format!("Record {i}"),
                        "kind": KINDS[i % KINDS.len()],
                        "year": 2020 + (i % 4),
                    }),
                )
            })
            .collect();
        Self {
            records,
            attempts: HashMap::new(),
        }
    }
}

pub type Db = Arc<RwLock<Store>>;

pub fn app() -> Router {
    app_with_records(SEED_RECORDS)
}

pub fn app_with_records(count: usize) -> Router {
    let db: Db = Arc::new(RwLock::new(Store::seeded(count)));
    Router::new()
        .route(
            "/api/records/",
            get(list_records)
                .post(create_record)
                .options(collection_options),
        )
        .route(
            "/api/records/{id}",
            get(get_record).patch(patch_record).delete(delete_record),
        )
        .route("/api/status/{code}", get(status))
        .route("/api/flaky/{name}", get(flaky))
        .route("/api/slow", get(slow))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Listing parameters. Repeated keys are allowed, so the raw pairs are
/// folded by hand.
#[derive(Debug, PartialEq)]
pub struct ListParams {
    pub page: usize,
    pub size: usize,
    /// `None` without a `facets` key; an empty list asks for every facet.
    pub facets: Option<Vec<String>>,
    pub kind: Option<String>,
    pub q: Option<String>,
}

impl ListParams {
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut params = ListParams {
            page: 1,
            size: DEFAULT_SIZE,
            facets: None,
            kind: None,
            q: None,
        };
        for (key, value) in pairs {
            match key.as_str() {
                "page" => params.page = value.parse::<usize>().unwrap_or(1).max(1),
                "size" => params.size = value.parse::<usize>().unwrap_or(DEFAULT_SIZE),
                "facets" => {
                    let selected = params.facets.get_or_insert_with(Vec::new);
                    if !value.is_empty() {
                        selected.push(value.clone());
                    }
                }
                "kind" => params.kind = Some(value.clone()),
                "q" => params.q = Some(value.clone()),
                _ => {}
            }
        }
        params
    }

    fn matches(&self, record: &StoredRecord) -> bool {
        let kind_ok = self
            .kind
            .as_deref()
            .map_or(true, |kind| record.metadata["kind"] == kind);
        let q_ok = self.q.as_deref().map_or(true, |q| {
            record.metadata["title"]
                .as_str()
                .is_some_and(|title| title.to_lowercase().contains(&q.to_lowercase()))
        });
        kind_ok && q_ok
    }
}

fn base_url(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{host}"))
        .unwrap_or_default()
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"status": 404, "message": "PID does not exist."})),
    )
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": 400, "message": message})),
    )
}

/// Buckets of distinct values of `metadata[field]`, sorted by key.
fn aggregate(records: &[&StoredRecord], field: &str) -> Value {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for record in records {
        let key = match &record.metadata[field] {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        *counts.entry(key).or_default() += 1;
    }
    let buckets: Vec<Value> = counts
        .into_iter()
        .map(|(key, doc_count)| json!({"key": key, "doc_count": doc_count}))
        .collect();
    json!({ "buckets": buckets })
}

async fn list_records(
    State(db): State<Db>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Json<Value> {
    let params = ListParams::from_pairs(&pairs);
    let store = db.read().await;
    let matching: Vec<&StoredRecord> = store
        .records
        .iter()
        .filter(|r| params.matches(r))
        .collect();

    let base = base_url(&headers);
    let hits: Vec<Value> = matching
        .iter()
        .skip((params.page - 1) * params.size)
        .take(params.size)
        .map(|r| r.to_json(&base))
        .collect();

    let mut aggregations = serde_json::Map::new();
    if let Some(selected) = &params.facets {
        for (code, _) in FACETS {
            if selected.is_empty() || selected.iter().any(|s| s == code) {
                aggregations.insert(code.to_string(), aggregate(&matching, code));
            }
        }
    }

    let next = params.page * params.size < matching.len();
    let mut links = json!({
        "self": format!("{base}/api/records/?page={}&size={}", params.page, params.size),
    });
    if next {
        links["next"] = json!(format!(
            "{base}/api/records/?page={}&size={}",
            params.page + 1,
            params.size
        ));
    }

    Json(json!({
        "hits": {"hits": hits, "total": matching.len()},
        "aggregations": aggregations,
        "links": links,
    }))
}

async fn collection_options() -> Json<Value> {
    let facets: Vec<Value> = FACETS
        .iter()
        .map(|(code, label)| json!({"code": code, "facet": {"label": label}}))
        .collect();
    Json(json!({
        "facets": facets,
        "filters": [{"code": "q", "label": "Search"}],
    }))
}

async fn create_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Json(input): Json<Value>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let metadata = match input.get("metadata") {
        Some(metadata) if metadata.is_object() => metadata.clone(),
        _ => return Err(bad_request("metadata must be an object".to_string())),
    };
    let record = StoredRecord::new(Uuid::new_v4().simple().to_string(), metadata);
    let base = base_url(&headers);
    let location = format!("{base}/api/records/{}", record.id);
    let body = record.to_json(&base);
    tracing::debug!(id = %record.id, "record created");
    db.write().await.records.push(record);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(body)).into_response())
}

async fn get_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let store = db.read().await;
    store
        .records
        .iter()
        .find(|r| r.id == id)
        .map(|r| Json(r.to_json(&base_url(&headers))))
        .ok_or_else(not_found)
}

async fn patch_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(ops): Json<Vec<PatchOp>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut store = db.write().await;
    let record = store
        .records
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(not_found)?;

    let mut doc = json!({ "metadata": record.metadata });
    apply_patch(&mut doc, &ops).map_err(bad_request)?;
    record.metadata = doc["metadata"].take();
    record.revision += 1;
    Ok(Json(record.to_json(&base_url(&headers))))
}

async fn delete_record(
    State(db): State<Db>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    let mut store = db.write().await;
    let idx = store
        .records
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(not_found)?;
    store.records.remove(idx);
    Ok(StatusCode::NO_CONTENT)
}

/// Apply `add`, `replace` and `remove` operations addressed by JSON pointer.
pub fn apply_patch(doc: &mut Value, ops: &[PatchOp]) -> Result<(), String> {
    for op in ops {
        let (parent, key) = op
            .path
            .rsplit_once('/')
            .ok_or_else(|| format!("invalid path {}", op.path))?;
        let target = doc
            .pointer_mut(parent)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| format!("no object at {parent:?}"))?;
        match op.op.as_str() {
            "add" | "replace" => {
                target.insert(key.to_string(), op.value.clone());
            }
            "remove" => {
                target
                    .remove(key)
                    .ok_or_else(|| format!("nothing to remove at {}", op.path))?;
            }
            other => return Err(format!("unsupported op {other}")),
        }
    }
    Ok(())
}

/// Answer with the requested status and its canonical reason as text.
async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    let reason = status.canonical_reason().unwrap_or("Unknown");
    (status, reason.to_string()).into_response()
}

#[derive(Deserialize)]
struct FlakyParams {
    #[serde(default = "one")]
    fail: u32,
}

fn one() -> u32 {
    1
}

/// Fail the first `fail` calls per `name` with 503, then succeed.
async fn flaky(
    State(db): State<Db>,
    Path(name): Path<String>,
    Query(params): Query<FlakyParams>,
) -> (StatusCode, Json<Value>) {
    let mut store = db.write().await;
    let attempts = store.attempts.entry(name).or_default();
    *attempts += 1;
    if *attempts <= params.fail {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": 503, "message": "try again"})),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({"status": "ok", "attempts": *attempts})),
        )
    }
}

#[derive(Deserialize)]
struct SlowParams {
    #[serde(default)]
    ms: u64,
    #[serde(default)]
    tag: String,
}

async fn slow(Query(params): Query<SlowParams>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Json(json!({"tag": params.tag}))
}
