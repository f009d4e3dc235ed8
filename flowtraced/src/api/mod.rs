pub mod ws;

use crate::analyzer::AnalyzerContext;
use crate::filter::{FilterState, FiveTuple};
use crate::locator::Locator;
use crate::metrics::Metrics;
use crate::query;
use crate::sockets;
use crate::store::{FunctionStore, PacketStore};
use axum::{
    Router,
    body::Body,
    extract::{Form, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub struct AppState {
    pub func_store: Arc<FunctionStore>,
    pub packet_store: Arc<PacketStore>,
    pub filter: Arc<FilterState>,
    pub metrics: Arc<Metrics>,
    pub attach_finished: Arc<AtomicBool>,
    pub func_table_path: PathBuf,
    pub analyzer: Option<Arc<AnalyzerContext>>,
    pub locator: Arc<Locator>,
}

/// Structured error for bad query input: `{"error": ..., "details": [...]}`.
pub struct ApiError {
    pub error: String,
    pub details: Vec<String>,
}

impl ApiError {
    fn new(error: &str, details: Vec<String>) -> Self {
        Self {
            error: error.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": self.error, "details": self.details})),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct TupleForm {
    srcip: String,
    dstip: String,
    sport: String,
    dport: String,
    #[serde(default)]
    ipver: Option<String>,
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    since: Option<String>,
}

struct ParsedTuple {
    src: IpAddr,
    dst: IpAddr,
    sport: i64,
    dport: i64,
}

impl ParsedTuple {
    /// Canonical address strings, matching what the consumers persisted.
    fn srcip(&self) -> String {
        self.src.to_string()
    }

    fn dstip(&self) -> String {
        self.dst.to_string()
    }
}

/// Parse and normalize the form tuple.
fn parse_tuple(form: &TupleForm) -> Result<ParsedTuple, ApiError> {
    let mut details = Vec::new();
    let src = match form.srcip.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            details.push(format!("bad srcip: {}", form.srcip));
            IpAddr::from([0, 0, 0, 0])
        }
    };
    let dst = match form.dstip.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            details.push(format!("bad dstip: {}", form.dstip));
            IpAddr::from([0, 0, 0, 0])
        }
    };
    let mut port = |name: &str, raw: &str| -> i64 {
        match raw.parse::<i64>() {
            Ok(p) if (0..=65535).contains(&p) => p,
            _ => {
                details.push(format!("bad {name}: {raw}"));
                -1
            }
        }
    };
    let sport = port("sport", &form.sport);
    let dport = port("dport", &form.dport);
    if !details.is_empty() {
        return Err(ApiError::new("Validation failed", details));
    }
    Ok(ParsedTuple {
        src,
        dst,
        sport,
        dport,
    })
}

fn parse_ipver(form: &TupleForm) -> Result<u8, ApiError> {
    match form.ipver.as_deref() {
        Some("4") => Ok(4),
        Some("6") => Ok(6),
        other => Err(ApiError::new(
            "Validation failed",
            vec![format!("bad ipver: {:?}", other)],
        )),
    }
}

fn parse_count(form: &TupleForm) -> Result<usize, ApiError> {
    match form.count.as_deref().map(str::parse::<usize>) {
        Some(Ok(count)) => Ok(count),
        other => Err(ApiError::new(
            "Validation failed",
            vec![format!("bad count: {:?}", other)],
        )),
    }
}

fn parse_since(form: &TupleForm) -> f64 {
    form.since
        .as_deref()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(0.0)
}

async fn use_post() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "Please Use POST")
}

async fn query_sock_list() -> Json<Value> {
    Json(sockets::list_all())
}

async fn get_func_table(State(state): State<Arc<AppState>>) -> Response {
    match std::fs::read_to_string(&state.func_table_path) {
        Ok(contents) => (
            [(header::CONTENT_TYPE, "application/json")],
            contents,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "function table unavailable", "details": [err.to_string()]})),
        )
            .into_response(),
    }
}

async fn set_filter(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    // -1 is the explicit "no filter" sentinel.
    if form.sport.trim() == "-1" || form.dport.trim() == "-1" {
        state.filter.clear();
        return "Filter Unset!".into_response();
    }
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    state.filter.set(FiveTuple {
        srcip: tuple.src,
        dstip: tuple.dst,
        sport: tuple.sport as u16,
        dport: tuple.dport as u16,
    });
    "Filter Set!".into_response()
}

async fn unset_filter(State(state): State<Arc<AppState>>) -> &'static str {
    state.filter.clear();
    "Filter Unset!"
}

async fn clear_data(State(state): State<Arc<AppState>>) -> &'static str {
    state.filter.raise_clear_flags();
    "Flag Set!"
}

async fn is_attach_finished(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!([state.attach_finished.load(Ordering::Relaxed)]))
}

/// Store failures force a truncation pass and degrade to an empty result.
fn empty_on_store_error(state: &AppState, err: sqlx::Error) -> Json<Value> {
    log::warn!("[api] store query failed: {err}");
    state.metrics.inc_store_error();
    state.filter.raise_clear_flags();
    Json(json!([]))
}

async fn query_func_send(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    match query::query_func_send(
        state.func_store.pool(),
        tuple.sport,
        tuple.dport,
        &tuple.srcip(),
        &tuple.dstip(),
    )
    .await
    {
        Ok(traversals) => Json(json!(traversals)).into_response(),
        Err(err) => empty_on_store_error(&state, err).into_response(),
    }
}

async fn query_func_recv(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    match query::query_func_recv(
        state.func_store.pool(),
        tuple.sport,
        tuple.dport,
        &tuple.srcip(),
        &tuple.dstip(),
    )
    .await
    {
        Ok(traversals) => Json(json!(traversals)).into_response(),
        Err(err) => empty_on_store_error(&state, err).into_response(),
    }
}

async fn query_packet(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    let ipver = match parse_ipver(&form) {
        Ok(ipver) => ipver,
        Err(err) => return err.into_response(),
    };
    match query::query_packets(
        state.packet_store.pool(),
        tuple.sport,
        tuple.dport,
        &tuple.srcip(),
        &tuple.dstip(),
        ipver,
    )
    .await
    {
        Ok(rows) => Json(json!(rows)).into_response(),
        Err(err) => empty_on_store_error(&state, err).into_response(),
    }
}

async fn get_recent_map(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    let count = match parse_count(&form) {
        Ok(count) => count,
        Err(err) => return err.into_response(),
    };
    let since = parse_since(&form);
    match query::recent_maps(
        state.func_store.pool(),
        tuple.sport,
        tuple.dport,
        &tuple.srcip(),
        &tuple.dstip(),
        count,
        since,
    )
    .await
    {
        Ok((recv, send)) => Json(json!([recv, send])).into_response(),
        Err(err) => empty_on_store_error(&state, err).into_response(),
    }
}

async fn get_recent_packet(
    State(state): State<Arc<AppState>>,
    Form(form): Form<TupleForm>,
) -> Response {
    let tuple = match parse_tuple(&form) {
        Ok(tuple) => tuple,
        Err(err) => return err.into_response(),
    };
    let ipver = match parse_ipver(&form) {
        Ok(ipver) => ipver,
        Err(err) => return err.into_response(),
    };
    let count = match parse_count(&form) {
        Ok(count) => count,
        Err(err) => return err.into_response(),
    };
    let since = parse_since(&form);
    match query::recent_packets(
        state.packet_store.pool(),
        tuple.sport,
        tuple.dport,
        &tuple.srcip(),
        &tuple.dstip(),
        ipver,
        count,
        since,
    )
    .await
    {
        Ok(rows) => Json(json!(rows)).into_response(),
        Err(err) => empty_on_store_error(&state, err).into_response(),
    }
}

#[derive(Deserialize)]
struct TraceQuery {
    target: String,
    #[serde(default)]
    cache: Option<String>,
}

fn cache_enabled(raw: &Option<String>) -> bool {
    !matches!(raw.as_deref(), Some("false") | Some("0"))
}

/// Streaming trace: one JSON object per line, one line per hop.
async fn api_trace(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TraceQuery>,
) -> Response {
    let use_cache = cache_enabled(&params.cache);
    match Arc::clone(&state.locator).trace(&params.target, use_cache).await {
        Ok(rx) => {
            let stream = UnboundedReceiverStream::new(rx).map(|hop| {
                let mut line = serde_json::to_string(&hop).unwrap_or_else(|_| "{}".into());
                line.push('\n');
                Ok::<_, std::convert::Infallible>(line)
            });
            (
                [(header::CONTENT_TYPE, "application/x-ndjson")],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(err) => {
            ApiError::new("trace failed", vec![err.to_string()]).into_response()
        }
    }
}

async fn api_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TraceQuery>,
) -> Response {
    match state.locator.resolve_target(&params.target).await {
        Ok(ip) => Json(json!(state.locator.history(&ip))).into_response(),
        Err(err) => ApiError::new("history failed", vec![err.to_string()]).into_response(),
    }
}

async fn api_analyze(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TraceQuery>,
) -> Response {
    let use_cache = cache_enabled(&params.cache);
    match Arc::clone(&state.locator).analyze(&params.target, use_cache).await {
        Ok(report) => Json(json!(report)).into_response(),
        Err(err) => ApiError::new("analyze failed", vec![err.to_string()]).into_response(),
    }
}

pub fn all_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/QuerySockList", get(query_sock_list))
        .route("/GetFuncTable", get(get_func_table))
        .route("/SetFilter", get(use_post).post(set_filter))
        .route("/UnsetFilter", get(unset_filter))
        .route("/ClearData", get(clear_data))
        .route("/IsAttachFinished", get(is_attach_finished))
        .route("/QueryFuncSend", get(use_post).post(query_func_send))
        .route("/QueryFuncRecv", get(use_post).post(query_func_recv))
        .route("/QueryPacket", get(use_post).post(query_packet))
        .route("/GetRecentMap", get(use_post).post(get_recent_map))
        .route("/GetRecentPacket", get(use_post).post(get_recent_packet))
        .route("/api/trace", get(api_trace))
        .route("/api/history", get(api_history))
        .route("/api/analyze", get(api_analyze))
        .route("/analyzer", get(ws::ws_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocatorConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> Arc<AppState> {
        let func_store = Arc::new(FunctionStore::open_memory().await.unwrap());
        let packet_store = Arc::new(PacketStore::open_memory().await.unwrap());
        let table_path = dir.join("func_table.json");
        std::fs::write(&table_path, r#"{"200007": {"id": 200007, "name": "tcp_sendmsg"}}"#)
            .unwrap();
        Arc::new(AppState {
            func_store,
            packet_store,
            filter: Arc::new(FilterState::new()),
            metrics: Arc::new(Metrics::new()),
            attach_finished: Arc::new(AtomicBool::new(true)),
            func_table_path: table_path,
            analyzer: None,
            locator: Arc::new(Locator::new(LocatorConfig {
                history_dir: dir.join("history"),
                ..LocatorConfig::default()
            })),
        })
    }

    fn form_request(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn set_and_unset_filter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(form_request(
                "/SetFilter",
                "srcip=127.0.0.1&dstip=127.0.0.1&sport=45290&dport=43483",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.filter.snapshot().unwrap().sport, 45290);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::get("/UnsetFilter")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.filter.is_empty());
    }

    #[tokio::test]
    async fn bad_ip_yields_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);

        let response = app
            .oneshot(form_request(
                "/SetFilter",
                "srcip=not-an-ip&dstip=127.0.0.1&sport=1&dport=2",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Validation failed");
        assert!(body["details"][0].as_str().unwrap().contains("srcip"));
    }

    #[tokio::test]
    async fn minus_one_port_clears_the_filter() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.filter.set(FiveTuple {
            srcip: "127.0.0.1".parse().unwrap(),
            dstip: "127.0.0.1".parse().unwrap(),
            sport: 1,
            dport: 2,
        });
        let app = all_routes(Arc::clone(&state));
        let response = app
            .oneshot(form_request(
                "/SetFilter",
                "srcip=127.0.0.1&dstip=127.0.0.1&sport=-1&dport=-1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.filter.is_empty());
    }

    #[tokio::test]
    async fn clear_data_raises_both_flags() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(Arc::clone(&state));
        let response = app
            .oneshot(
                axum::http::Request::get("/ClearData")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.filter.take_clear_func());
        assert!(state.filter.take_clear_packet());
    }

    #[tokio::test]
    async fn get_on_post_endpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::get("/QueryFuncSend")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_store_queries_return_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);
        let response = app
            .oneshot(form_request(
                "/QueryFuncSend",
                "srcip=127.0.0.1&dstip=127.0.0.1&sport=45290&dport=43483",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn func_table_is_served_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::get("/GetFuncTable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["200007"]["name"], "tcp_sendmsg");
    }

    #[tokio::test]
    async fn attach_flag_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);
        let response = app
            .oneshot(
                axum::http::Request::get("/IsAttachFinished")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body, json!([true]));
    }

    #[tokio::test]
    async fn recent_map_requires_count() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = all_routes(state);
        let response = app
            .oneshot(form_request(
                "/GetRecentMap",
                "srcip=127.0.0.1&dstip=127.0.0.1&sport=1&dport=2",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
