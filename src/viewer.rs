//! Web viewer and tracking API
//!
//! One axum router serves the JSON API that clients log runs through, the
//! HTML pages for browsing experiments, runs and artifacts, and the artifact
//! blob endpoint.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::blob::{ArtifactStore, FILE_SCHEME};
use crate::hierarchy::{assemble, NestedRunView, OpenBranches};
use crate::paths::{infer_artifact_type, validate_artifact_path};
use crate::storage::Database;
use crate::tree::{build_tree, ArtifactTreeNode};
use crate::{ArtifactRecord, Error, MetricSeries, ParamValue, Result, Run, RunId};

/// Largest accepted artifact upload body
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub store: Arc<ArtifactStore>,
}

impl AppState {
    pub fn new(db: Database, store: ArtifactStore) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            store: Arc::new(store),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/experiments/{uuid}", get(experiment_handler))
        .route("/runs/{uuid}", get(run_overview_handler))
        .route("/runs/{uuid}/overview", get(run_overview_handler))
        .route("/runs/{uuid}/notes", post(run_notes_form_handler))
        .route("/runs/{uuid}/artifacts", get(run_artifacts_handler))
        .route("/artifacts", get(artifact_handler))
        .route("/artifacts/blob", get(blob_handler))
        .route("/api/experiments", post(create_experiment_handler))
        .route("/api/runs", post(create_run_handler))
        .route("/api/runs/notes", post(update_notes_handler))
        .route("/api/params", post(log_param_handler))
        .route("/api/metrics", post(log_metrics_handler))
        .route(
            "/api/artifacts",
            post(upload_artifact_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub async fn start_viewer(state: AppState, host: [u8; 4], port: u16) -> Result<()> {
    let app = router(state);

    let addr = SocketAddr::from((host, port));
    info!("Apparatus listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        "{} {} {} {}ms",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Percent-encode a query parameter value
fn query_escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%b %d, %H:%M").to_string()
}

/// Stable DOM id for an artifact tree node
fn node_id(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    hex::encode(&digest[..8])
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("invalid JSON: {}", e)))
}

fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("txt" | "log" | "csv" | "md") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Fill `{{KEY}}` placeholders in a single pass.
///
/// Substituted values are copied through untouched, so placeholder-like text
/// inside them stays literal. Unknown keys are left as they are.
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let value = after.find("}}").and_then(|end| {
            let key = &after[..end];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, end + 2))
        });
        match value {
            Some((v, consumed)) => {
                out.push_str(v);
                rest = &after[consumed..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(fill(PAGE_HTML, &[("TITLE", &escape_html(title)), ("BODY", body)]))
}

/// Run blocking filesystem work on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

// ---------------------------------------------------------------------------
// JSON API
// ---------------------------------------------------------------------------

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct CreateExperimentQuery {
    #[serde(default)]
    name: String,
}

async fn create_experiment_handler(
    State(state): State<AppState>,
    Query(q): Query<CreateExperimentQuery>,
) -> Result<Json<serde_json::Value>> {
    if q.name.is_empty() {
        return Err(Error::Validation("missing required field: name".into()));
    }
    let experiment = state.db.lock().await.insert_experiment(&q.name)?;
    info!("Created experiment {} ({})", experiment.name, experiment.uuid);
    Ok(Json(json!({ "id": experiment.uuid, "name": experiment.name })))
}

#[derive(Debug, Default, Deserialize)]
struct CreateRunQuery {
    #[serde(default)]
    name: String,
    experiment_uuid: Option<String>,
    parent_run_uuid: Option<String>,
}

async fn create_run_handler(
    State(state): State<AppState>,
    Query(q): Query<CreateRunQuery>,
) -> Result<Json<serde_json::Value>> {
    let mut db = state.db.lock().await;

    let parent = match non_empty(q.parent_run_uuid.as_deref()) {
        Some(uuid) => Some(
            db.run_by_uuid(uuid)?
                .ok_or_else(|| Error::Validation(format!("invalid parent run {}", uuid)))?,
        ),
        None => None,
    };

    // Nested runs stay in their parent's experiment unless told otherwise
    let experiment_id = match non_empty(q.experiment_uuid.as_deref()) {
        Some(uuid) => db
            .experiment_id_by_uuid(uuid)?
            .ok_or_else(|| Error::Validation(format!("invalid experiment {}", uuid)))?,
        None => match &parent {
            Some(parent) => parent.experiment_id,
            None => db.default_experiment_id()?,
        },
    };

    let run = db.insert_run(&q.name, experiment_id, parent.map(|p| p.id))?;
    info!("Created run {} ({}) at level {}", run.name, run.uuid, run.nesting_level);

    Ok(Json(json!({
        "id": run.uuid,
        "name": run.name,
        "nesting_level": run.nesting_level,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogParamQuery {
    run_uuid: String,
    key: String,
    value: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn log_param_handler(
    State(state): State<AppState>,
    Query(q): Query<LogParamQuery>,
) -> Result<Json<serde_json::Value>> {
    if q.key.is_empty() {
        return Err(Error::Validation("missing required field: key".into()));
    }
    let value = ParamValue::parse(&q.kind, &q.value)?;

    let db = state.db.lock().await;
    let run = db.require_run(&q.run_uuid)?;
    db.upsert_parameter(run.id, &q.key, &value)?;
    debug!("Logged param {}={} for run {}", q.key, value, run.uuid);

    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct MetricValue {
    x_value: f64,
    y_value: f64,
}

#[derive(Debug, Default, Deserialize)]
struct LogMetricsRequest {
    #[serde(default)]
    run_uuid: String,
    #[serde(default)]
    key: String,
    values: Option<Vec<MetricValue>>,
    logged_at_epoch_millis: Option<i64>,
}

async fn log_metrics_handler(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let req: LogMetricsRequest = parse_json(&body)?;

    let mut missing = Vec::new();
    if req.run_uuid.is_empty() {
        missing.push("run_uuid");
    }
    if req.key.is_empty() {
        missing.push("key");
    }
    if req.values.is_none() {
        missing.push("values");
    }
    if req.logged_at_epoch_millis.is_none() {
        missing.push("logged_at_epoch_millis");
    }
    if !missing.is_empty() {
        let body = json!({ "error": "Missing required fields", "missing_fields": missing });
        return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
    }

    let logged_at = req
        .logged_at_epoch_millis
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| Error::Validation("logged_at_epoch_millis is out of range".into()))?;
    let points: Vec<(f64, f64)> = req
        .values
        .unwrap_or_default()
        .iter()
        .map(|v| (v.x_value, v.y_value))
        .collect();

    let mut db = state.db.lock().await;
    let run = db.require_run(&req.run_uuid)?;
    db.insert_metrics(run.id, &req.key, &points, logged_at)?;

    Ok(Json(json!({ "status": "ok" })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateNotesRequest {
    run_uuid: String,
    notes: String,
}

async fn update_notes_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let req: UpdateNotesRequest = parse_json(&body)?;
    if req.run_uuid.is_empty() {
        return Err(Error::Validation("missing required field: run_uuid".into()));
    }

    let db = state.db.lock().await;
    let run = db.require_run(&req.run_uuid)?;
    db.update_run_notes(run.id, &req.notes)?;

    Ok(Json(json!({ "status": "ok" })))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> Error {
    Error::Validation(format!("failed to parse multipart form: {}", e))
}

/// Multipart fields `run_uuid`, `path` and `file`
async fn upload_artifact_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let mut run_uuid = String::new();
    let mut path = String::new();
    let mut content: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("run_uuid") => run_uuid = field.text().await.map_err(multipart_error)?,
            Some("path") => path = field.text().await.map_err(multipart_error)?,
            Some("file") => content = Some(field.bytes().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    if run_uuid.is_empty() || path.is_empty() {
        return Err(Error::Validation(
            "missing required fields: run_uuid, path".into(),
        ));
    }
    validate_artifact_path(&path)?;

    let run = {
        let db = state.db.lock().await;
        let run = db.require_run(&run_uuid)?;
        db.check_artifact_path(run.id, &path)?;
        run
    };

    let content = content.ok_or_else(|| Error::Validation("no file uploaded".into()))?;
    let size = content.len();

    let uri = {
        let store = Arc::clone(&state.store);
        let run_uuid = run.uuid.clone();
        let path = path.clone();
        blocking(move || store.store_artifact(&run_uuid, &path, &content[..])).await?
    };

    let record = ArtifactRecord::new(&path, &uri, infer_artifact_type(&path));
    record_artifact(&state, run.id, &record).await?;
    info!("Stored artifact {} for run {} ({})", path, run.uuid, format_bytes(size as u64));

    Ok(Json(json!({ "status": "ok", "path": path, "uri": uri })))
}

/// Record freshly written artifact bytes.
///
/// A conflicting path can still be recorded between the upload's first check
/// and this insert; the file just written is then removed again.
async fn record_artifact(state: &AppState, run_id: RunId, record: &ArtifactRecord) -> Result<()> {
    let result = state.db.lock().await.upsert_artifact(run_id, record);
    if let Err(Error::ArtifactPathConflict { .. }) = &result {
        if let Some(file) = record.uri.strip_prefix(FILE_SCHEME) {
            warn!("Removing unrecorded artifact file {}", file);
            if let Err(e) = tokio::fs::remove_file(file).await {
                warn!("Failed to remove {}: {}", file, e);
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Artifact blobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BlobQuery {
    uri: String,
}

async fn blob_handler(
    State(state): State<AppState>,
    Query(q): Query<BlobQuery>,
) -> Result<Response> {
    let path = {
        let store = Arc::clone(&state.store);
        let uri = q.uri.clone();
        blocking(move || store.resolve_blob(&uri)).await?
    };

    let not_found = || Error::NotFound(format!("artifact {}", q.uri));
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    if !file.metadata().await?.is_file() {
        return Err(not_found());
    }

    debug!("Serving blob {:?}", path);
    let headers = [
        (header::CONTENT_TYPE, content_type_for(&path)),
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

// ---------------------------------------------------------------------------
// Page handlers
// ---------------------------------------------------------------------------

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>> {
    let experiments = state.db.lock().await.all_experiments()?;

    let total_runs: u64 = experiments.iter().map(|e| e.run_count).sum();
    let cards: String = experiments
        .iter()
        .map(|e| {
            let last = e
                .most_recent_run_at
                .map(|ts| format!("last run {}", format_ts(ts)))
                .unwrap_or_else(|| "no runs yet".to_string());
            format!(
                r#"<a href="/experiments/{uuid}" class="card">
                <div class="card-title">{name}</div>
                <div class="meta"><span>{runs} runs</span><span>{last}</span><span>created {created}</span></div>
            </a>"#,
                uuid = escape_html(&e.uuid),
                name = escape_html(&e.name),
                runs = e.run_count,
                last = last,
                created = format_ts(e.created_at),
            )
        })
        .collect();

    let body = fill(
        INDEX_HTML,
        &[
            ("TOTAL_EXPERIMENTS", &experiments.len().to_string()),
            ("TOTAL_RUNS", &total_runs.to_string()),
            ("EXPERIMENTS", &cards),
        ],
    );
    Ok(page("Apparatus", &body))
}

#[derive(Debug, Default, Deserialize)]
struct OpenQuery {
    open_l0: Option<String>,
    open_l1: Option<String>,
}

async fn experiment_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(q): Query<OpenQuery>,
) -> Result<Html<String>> {
    let (experiment, runs) = {
        let db = state.db.lock().await;
        let experiment = db
            .experiment_by_uuid(&uuid)?
            .ok_or_else(|| Error::NotFound(format!("experiment {}", uuid)))?;
        let roots = db.runs_by_experiment_and_level(experiment.id, 0)?;
        let open = OpenBranches::new(q.open_l0.as_deref(), q.open_l1.as_deref());
        let runs = assemble(roots, &open, &*db)?;
        (experiment, runs)
    };

    let base = format!("/experiments/{}", experiment.uuid);
    let runs_html = if runs.is_empty() {
        r#"<p class="dim">No runs yet</p>"#.to_string()
    } else {
        render_run_tree(&runs, &base)
    };

    let body = fill(
        EXPERIMENT_HTML,
        &[
            ("NAME", &escape_html(&experiment.name)),
            ("RUN_COUNT", &experiment.run_count.to_string()),
            ("RUNS", &runs_html),
        ],
    );
    Ok(page(&experiment.name, &body))
}

fn render_run_tree(roots: &[NestedRunView], base: &str) -> String {
    let mut out = String::from(r#"<ul class="runs">"#);
    for root in roots {
        let root_q = query_escape(&root.run.uuid);
        let toggle = if root.is_expanded() {
            base.to_string()
        } else {
            format!("{}?open_l0={}", base, root_q)
        };
        out.push_str("<li>");
        out.push_str(&run_item(root, Some(toggle)));

        if root.is_expanded() {
            out.push_str(r#"<ul class="runs">"#);
            for child in &root.children {
                let toggle = if child.is_expanded() {
                    format!("{}?open_l0={}", base, root_q)
                } else {
                    format!(
                        "{}?open_l0={}&open_l1={}",
                        base,
                        root_q,
                        query_escape(&child.run.uuid)
                    )
                };
                out.push_str("<li>");
                out.push_str(&run_item(child, Some(toggle)));
                if child.is_expanded() {
                    out.push_str(r#"<ul class="runs">"#);
                    for grandchild in &child.children {
                        out.push_str("<li>");
                        out.push_str(&run_item(grandchild, None));
                        out.push_str("</li>");
                    }
                    out.push_str("</ul>");
                }
                out.push_str("</li>");
            }
            out.push_str("</ul>");
        }
        out.push_str("</li>");
    }
    out.push_str("</ul>");
    out
}

fn run_item(view: &NestedRunView, toggle_href: Option<String>) -> String {
    let toggle = match toggle_href.filter(|_| view.child_count > 0) {
        Some(href) => format!(
            r#"<a class="toggle" href="{}">{}</a>"#,
            escape_html(&href),
            if view.is_expanded() { "&#9662;" } else { "&#9656;" }
        ),
        None => r#"<span class="toggle"></span>"#.to_string(),
    };
    let nested = if view.child_count > 0 {
        format!("<span>{} nested</span>", view.child_count)
    } else {
        String::new()
    };
    format!(
        r#"{toggle}<a class="run-name" href="/runs/{uuid}">{name}</a><span class="meta">{nested}<span>{created}</span></span>"#,
        toggle = toggle,
        uuid = escape_html(&view.run.uuid),
        name = display_name(&view.run),
        nested = nested,
        created = format_ts(view.run.created_at),
    )
}

fn display_name(run: &Run) -> String {
    if run.name.is_empty() {
        escape_html(&run.uuid[..run.uuid.len().min(8)])
    } else {
        escape_html(&run.name)
    }
}

fn run_header(run: &Run, parent: Option<&Run>, grandparent: Option<&Run>, experiment: Option<&crate::Experiment>, tab: &str) -> String {
    let mut crumbs = vec![r#"<a href="/">Experiments</a>"#.to_string()];
    if let Some(e) = experiment {
        crumbs.push(format!(
            r#"<a href="/experiments/{}">{}</a>"#,
            escape_html(&e.uuid),
            escape_html(&e.name)
        ));
    }
    for ancestor in [grandparent, parent].into_iter().flatten() {
        crumbs.push(format!(
            r#"<a href="/runs/{}">{}</a>"#,
            escape_html(&ancestor.uuid),
            display_name(ancestor)
        ));
    }

    let uuid = escape_html(&run.uuid);
    let tab_class = |name: &str| if name == tab { "tab on" } else { "tab" };
    format!(
        r#"<nav class="crumbs">{crumbs}</nav>
<div class="hdr"><h1>{name}</h1><div class="uuid">{uuid}</div></div>
<div class="tabs"><a class="{overview}" href="/runs/{uuid}/overview">Overview</a><a class="{artifacts}" href="/runs/{uuid}/artifacts">Artifacts</a></div>"#,
        crumbs = crumbs.join(r#" <span class="sep">/</span> "#),
        name = display_name(run),
        uuid = uuid,
        overview = tab_class("overview"),
        artifacts = tab_class("artifacts"),
    )
}

async fn run_overview_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Html<String>> {
    let (run, parent, grandparent, experiment, params, metrics) = {
        let db = state.db.lock().await;
        let run = db.require_run(&uuid)?;
        let parent = match run.parent_run_id {
            Some(id) => db.run_by_id(id)?,
            None => None,
        };
        let grandparent = match parent.as_ref().and_then(|p| p.parent_run_id) {
            Some(id) => db.run_by_id(id)?,
            None => None,
        };
        let experiment = db.experiment_for_run(&run.uuid)?;
        let params = db.parameters(run.id)?;
        let metrics = db.metrics(run.id)?;
        (run, parent, grandparent, experiment, params, metrics)
    };
    let stored = {
        let store = Arc::clone(&state.store);
        let run_uuid = run.uuid.clone();
        blocking(move || Ok(store.run_size_bytes(&run_uuid))).await?
    };

    let params_html = if params.is_empty() {
        r#"<p class="dim">No parameters logged</p>"#.to_string()
    } else {
        let rows: String = params
            .iter()
            .map(|p| {
                format!(
                    "<tr><td>{}</td><td>{}</td><td class=\"dim\">{}</td></tr>",
                    escape_html(&p.key),
                    escape_html(&p.value.to_string()),
                    p.value.type_name()
                )
            })
            .collect();
        format!(r#"<table><tr><th>Key</th><th>Value</th><th>Type</th></tr>{}</table>"#, rows)
    };

    let metrics_html = if metrics.is_empty() {
        r#"<p class="dim">No metrics logged</p>"#.to_string()
    } else {
        let rows: String = metrics
            .iter()
            .map(|m| {
                let last = m.points.last().map(|p| p.y.to_string()).unwrap_or_default();
                format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"dim\">{}</td></tr>",
                    escape_html(&m.key),
                    sparkline(m),
                    escape_html(&last),
                    m.points.len()
                )
            })
            .collect();
        format!(
            r#"<table><tr><th>Key</th><th>Series</th><th>Last</th><th>Points</th></tr>{}</table>"#,
            rows
        )
    };

    let header = run_header(&run, parent.as_ref(), grandparent.as_ref(), experiment.as_ref(), "overview");
    let body = fill(
        RUN_OVERVIEW_HTML,
        &[
            ("HEADER", &header),
            ("UUID", &escape_html(&run.uuid)),
            ("LEVEL", &run.nesting_level.to_string()),
            ("CREATED", &format_ts(run.created_at)),
            ("STORED", &format_bytes(stored)),
            ("METRICS", &metrics_html),
            ("PARAMS", &params_html),
            ("NOTES", &escape_html(&run.notes)),
        ],
    );
    Ok(page(&run.name, &body))
}

fn sparkline(series: &MetricSeries) -> String {
    const W: f64 = 160.0;
    const H: f64 = 32.0;

    let (x_min, x_max, y_min, y_max) = series.points.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), p| (x0.min(p.x), x1.max(p.x), y0.min(p.y), y1.max(p.y)),
    );
    let span = |lo: f64, hi: f64| if hi > lo { hi - lo } else { 1.0 };

    let points: Vec<String> = series
        .points
        .iter()
        .map(|p| {
            let x = (p.x - x_min) / span(x_min, x_max) * W;
            let y = H - (p.y - y_min) / span(y_min, y_max) * H;
            format!("{:.1},{:.1}", x, y)
        })
        .collect();

    format!(
        r#"<svg class="spark" width="{w}" height="{h}" viewBox="0 0 {w} {h}"><polyline points="{points}"/></svg>"#,
        w = W,
        h = H,
        points = points.join(" ")
    )
}

#[derive(Debug, Default, Deserialize)]
struct NotesForm {
    #[serde(default)]
    notes: String,
}

async fn run_notes_form_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Form(form): Form<NotesForm>,
) -> Result<Redirect> {
    let db = state.db.lock().await;
    let run = db.require_run(&uuid)?;
    db.update_run_notes(run.id, &form.notes)?;
    Ok(Redirect::to(&format!("/runs/{}/overview", run.uuid)))
}

#[derive(Debug, Default, Deserialize)]
struct RunArtifactsQuery {
    current_artifact_path: Option<String>,
}

async fn run_artifacts_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(q): Query<RunArtifactsQuery>,
) -> Result<Html<String>> {
    let (run, parent, grandparent, experiment, records) = {
        let db = state.db.lock().await;
        let run = db.require_run(&uuid)?;
        let parent = match run.parent_run_id {
            Some(id) => db.run_by_id(id)?,
            None => None,
        };
        let grandparent = match parent.as_ref().and_then(|p| p.parent_run_id) {
            Some(id) => db.run_by_id(id)?,
            None => None,
        };
        let experiment = db.experiment_for_run(&run.uuid)?;
        let records = db.artifacts(run.id)?;
        (run, parent, grandparent, experiment, records)
    };

    let tree = build_tree(&run.uuid, &records)?;
    let current_path = non_empty(q.current_artifact_path.as_deref());
    let current = current_path.and_then(|p| records.iter().find(|r| r.path == p));

    let tree_html = if records.is_empty() {
        r#"<p class="dim">No artifacts uploaded</p>"#.to_string()
    } else {
        let mut out = String::new();
        render_tree(&tree, "", &run.uuid, current_path, &mut out);
        out
    };
    let preview = match current {
        Some(record) => render_artifact(&state.store, record),
        None => r#"<p class="dim">Select an artifact to preview it</p>"#.to_string(),
    };

    let header = run_header(&run, parent.as_ref(), grandparent.as_ref(), experiment.as_ref(), "artifacts");
    let body = fill(
        RUN_ARTIFACTS_HTML,
        &[
            ("HEADER", &header),
            ("COUNT", &tree.leaf_count().to_string()),
            ("TREE", &tree_html),
            ("PREVIEW", &preview),
        ],
    );
    Ok(page(&run.name, &body))
}

fn render_tree(
    node: &ArtifactTreeNode,
    prefix: &str,
    run_uuid: &str,
    current: Option<&str>,
    out: &mut String,
) {
    out.push_str(r#"<ul class="tree">"#);
    for (name, child) in &node.children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        let id = node_id(&path);

        if let Some(leaf) = &child.artifact {
            let href = format!(
                "/runs/{}/artifacts?current_artifact_path={}",
                run_uuid,
                query_escape(&leaf.path)
            );
            let class = if current == Some(leaf.path.as_str()) {
                "leaf current"
            } else {
                "leaf"
            };
            out.push_str(&format!(
                r#"<li id="node-{}" class="{}"><a href="{}">{}</a></li>"#,
                id,
                class,
                escape_html(&href),
                escape_html(name)
            ));
        } else {
            let dir_prefix = format!("{}/", path);
            let open = current.map_or(true, |c| c.starts_with(&dir_prefix));
            out.push_str(&format!(
                r#"<li id="node-{}" class="dir"><details{}><summary>{}/</summary>"#,
                id,
                if open { " open" } else { "" },
                escape_html(name)
            ));
            render_tree(child, &path, run_uuid, current, out);
            out.push_str("</details></li>");
        }
    }
    out.push_str("</ul>");
}

fn render_artifact(store: &ArtifactStore, record: &ArtifactRecord) -> String {
    let Some(locator) = store.blob_locator(&record.uri) else {
        return format!(
            r#"<p class="dim">{} is not in the artifact store</p>"#,
            escape_html(&record.path)
        );
    };
    let src = escape_html(&format!("/artifacts/blob?uri={}", query_escape(&locator)));
    let path = escape_html(&record.path);

    if record.is_image() {
        format!(
            r#"<figure><img src="{src}" alt="{path}"><figcaption>{path}</figcaption></figure>"#,
            src = src,
            path = path
        )
    } else {
        format!(
            r#"<div class="file"><span>{path}</span><a href="{src}" download>Download</a></div>"#,
            src = src,
            path = path
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArtifactQuery {
    run_uuid: String,
    path: String,
}

async fn artifact_handler(
    State(state): State<AppState>,
    Query(q): Query<ArtifactQuery>,
) -> Result<Html<String>> {
    if q.run_uuid.is_empty() {
        return Err(Error::Validation("missing required parameter: run_uuid".into()));
    }

    let record = {
        let db = state.db.lock().await;
        let run = db.require_run(&q.run_uuid)?;
        db.artifact_by_path(run.id, &q.path)?
            .ok_or_else(|| Error::NotFound(format!("artifact {}", q.path)))?
    };

    Ok(page(&record.path, &render_artifact(&state.store, &record)))
}

// ---------------------------------------------------------------------------
// HTML Templates
// ---------------------------------------------------------------------------

const PAGE_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8"><meta name="viewport" content="width=device-width,initial-scale=1">
<title>{{TITLE}}</title>
<style>
:root{--bg:#fafafa;--card:#fff;--accent:#6366f1;--text:#111;--dim:#6b7280;--border:#e5e7eb;--hover:#f3f4f6;--radius:10px}
*{box-sizing:border-box;margin:0;padding:0}
body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI','Inter',sans-serif;background:var(--bg);color:var(--text);padding:40px 24px;line-height:1.6;-webkit-font-smoothing:antialiased}
a{color:inherit}
.wrap{max-width:960px;margin:0 auto}
header{margin-bottom:32px}
h1{font-size:1.5rem;font-weight:700;letter-spacing:-.02em}
h2{font-size:.8rem;font-weight:600;text-transform:uppercase;letter-spacing:.05em;color:var(--dim);margin:28px 0 12px}
.dim{color:var(--dim);font-size:.85rem}
.stats{display:flex;gap:32px;margin-bottom:32px;padding-bottom:24px;border-bottom:1px solid var(--border)}
.stat-label{font-size:.7rem;color:var(--dim);text-transform:uppercase;letter-spacing:.05em}
.stat-value{font-size:1.5rem;font-weight:700}
.card{display:block;background:var(--card);border:1px solid var(--border);border-radius:var(--radius);padding:16px 20px;margin-bottom:8px;text-decoration:none;transition:background .15s}
.card:hover{background:var(--hover)}
.card-title{font-weight:600}
.meta{display:inline-flex;gap:16px;font-size:.8rem;color:var(--dim);margin-left:12px}
.card .meta{margin-left:0}
ul.runs{list-style:none;padding-left:20px}
.wrap>ul.runs{padding-left:0}
ul.runs li{padding:3px 0}
.toggle{display:inline-block;width:18px;text-decoration:none;color:var(--dim)}
.run-name{font-weight:500;text-decoration:none}
.run-name:hover{text-decoration:underline}
.crumbs{font-size:.85rem;color:var(--dim);margin-bottom:16px}
.crumbs a{text-decoration:none}
.sep{opacity:.5}
.hdr{margin-bottom:20px}
.uuid{font-family:'SF Mono',SFMono-Regular,Menlo,monospace;font-size:.75rem;color:var(--dim)}
.tabs{display:flex;gap:4px;border-bottom:1px solid var(--border);margin-bottom:20px}
.tab{padding:6px 14px;text-decoration:none;color:var(--dim);border-bottom:2px solid transparent}
.tab.on{color:var(--text);border-bottom-color:var(--accent)}
table{border-collapse:collapse;width:100%;background:var(--card);border:1px solid var(--border);border-radius:var(--radius)}
th,td{text-align:left;padding:6px 12px;border-bottom:1px solid var(--border);font-size:.85rem}
th{font-size:.7rem;text-transform:uppercase;color:var(--dim)}
svg.spark polyline{fill:none;stroke:var(--accent);stroke-width:1.5}
textarea{width:100%;min-height:90px;padding:8px;border:1px solid var(--border);border-radius:6px;font:inherit}
button{margin-top:8px;padding:6px 14px;border:1px solid var(--text);background:var(--text);color:#fff;border-radius:6px;cursor:pointer}
.split{display:flex;gap:24px}
.split>div:first-child{min-width:240px}
ul.tree{list-style:none;padding-left:14px;font-family:'SF Mono',SFMono-Regular,Menlo,monospace;font-size:.8rem}
.split>div>ul.tree{padding-left:0}
li.current>a{font-weight:700;color:var(--accent)}
summary{cursor:pointer}
figure img{max-width:100%;border:1px solid var(--border);border-radius:6px}
figcaption{font-size:.75rem;color:var(--dim)}
.file{display:flex;gap:16px;align-items:center}
</style>
</head>
<body>
<div class="wrap">
{{BODY}}
</div>
</body>
</html>"##;

const INDEX_HTML: &str = r##"<header>
<h1>Apparatus</h1>
<p class="dim">Experiment tracking</p>
</header>
<div class="stats">
<div><div class="stat-label">Experiments</div><div class="stat-value">{{TOTAL_EXPERIMENTS}}</div></div>
<div><div class="stat-label">Runs</div><div class="stat-value">{{TOTAL_RUNS}}</div></div>
</div>
<h2>Experiments</h2>
{{EXPERIMENTS}}"##;

const EXPERIMENT_HTML: &str = r##"<nav class="crumbs"><a href="/">Experiments</a></nav>
<header>
<h1>{{NAME}}</h1>
<p class="dim">{{RUN_COUNT}} runs</p>
</header>
{{RUNS}}"##;

const RUN_OVERVIEW_HTML: &str = r##"{{HEADER}}
<div class="stats">
<div><div class="stat-label">Created</div><div class="stat-value">{{CREATED}}</div></div>
<div><div class="stat-label">Level</div><div class="stat-value">{{LEVEL}}</div></div>
<div><div class="stat-label">Artifacts</div><div class="stat-value">{{STORED}}</div></div>
</div>
<h2>Parameters</h2>
{{PARAMS}}
<h2>Metrics</h2>
{{METRICS}}
<h2>Notes</h2>
<form method="post" action="/runs/{{UUID}}/notes">
<textarea name="notes">{{NOTES}}</textarea>
<button type="submit">Save notes</button>
</form>"##;

const RUN_ARTIFACTS_HTML: &str = r##"{{HEADER}}
<div class="split">
<div><h2>{{COUNT}} artifacts</h2>{{TREE}}</div>
<div>{{PREVIEW}}</div>
</div>"##;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
