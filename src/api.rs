use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        ConnectInfo, Path, Query, Request, State,
    },
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info, warn};
use serde::Deserialize;

use crate::update::{UpdateRequest, Updater, Verdict};

pub struct AppState {
    pub updater: Updater,
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateQuery {
    pub domains: Option<String>,
    pub token: Option<String>,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub verbose: Option<String>,
    pub clear: Option<String>,
    pub txt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePath {
    pub domains: String,
    pub token: String,
    #[serde(default)]
    pub ip: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/update", get(update_query))
        .route("/update/{domains}/{token}", get(update_path))
        .route("/update/{domains}/{token}/{ip}", get(update_path))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(state.clone(), access_log))
        .with_state(state)
}

async fn access_log(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let start = Instant::now();

    // Extract request info
    let method = request.method().clone();
    let path = redact(request.uri().path(), request.uri().query());
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = log_ip(request.headers(), peer, state.trust_forwarded_headers);

    // Process request
    let response = next.run(request).await;

    // Extract response info
    let status = response.status().as_u16();
    let length = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    let duration = start.elapsed();

    // Access log format: method path "user-agent" ip status length duration
    info!(
        target: "access",
        "{} {} \"{}\" {} {} {} {:.3}ms",
        method, path, user_agent, ip, status, length, duration.as_secs_f64() * 1000.0
    );

    response
}

/// Masks the token in both request shapes before it reaches the log.
fn redact(path: &str, query: Option<&str>) -> String {
    let path = match path.strip_prefix("/update/") {
        Some(rest) => {
            let mut parts: Vec<&str> = rest.split('/').collect();
            if parts.len() >= 2 {
                parts[1] = "***";
            }
            format!("/update/{}", parts.join("/"))
        }
        None => path.to_string(),
    };

    match query {
        Some(q) => {
            let q: Vec<String> = q
                .split('&')
                .map(|pair| {
                    let key = url::form_urlencoded::parse(pair.as_bytes()).next().map(|(k, _)| k);
                    if key.as_deref() == Some("token") {
                        "token=***".to_string()
                    } else {
                        pair.to_string()
                    }
                })
                .collect();
            format!("{}?{}", path, q.join("&"))
        }
        None => path,
    }
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

async fn update_query(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<UpdateQuery>, QueryRejection>,
) -> Verdict {
    let Query(query) = match query {
        Ok(query) => query,
        Err(e) => {
            warn!("Rejected malformed update query: {}", e);
            return Verdict::Ko;
        }
    };
    respond(state, normalize(None, query), &headers, peer).await
}

async fn update_path(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    path: Result<Path<UpdatePath>, PathRejection>,
    query: Result<Query<UpdateQuery>, QueryRejection>,
) -> Verdict {
    let (Path(path), Query(query)) = match (path, query) {
        (Ok(path), Ok(query)) => (path, query),
        (Err(e), _) => {
            warn!("Rejected malformed update path: {}", e);
            return Verdict::Ko;
        }
        (_, Err(e)) => {
            warn!("Rejected malformed update query: {}", e);
            return Verdict::Ko;
        }
    };
    respond(state, normalize(Some(path), query), &headers, peer).await
}

async fn respond(
    state: Arc<AppState>,
    request: UpdateRequest,
    headers: &HeaderMap,
    peer: SocketAddr,
) -> Verdict {
    let source_ip = source_ip(headers, peer, state.trust_forwarded_headers);
    let updater = state.updater.clone();

    // A panic inside one request must still produce an answer
    match tokio::spawn(async move { updater.handle(request, &source_ip).await }).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("Unexpected error while handling update: {}", e);
            Verdict::Ko
        }
    }
}

/// Folds the path and query shapes into one request.
///
/// Path values are used only when the path carries both domains and token;
/// flags always come from the query string.
pub fn normalize(path: Option<UpdatePath>, query: UpdateQuery) -> UpdateRequest {
    let flags = UpdateRequest {
        ipv6: non_empty(query.ipv6),
        txt: flag(query.txt.as_deref()),
        clear: flag(query.clear.as_deref()),
        verbose: flag(query.verbose.as_deref()),
        ..UpdateRequest::default()
    };

    match path {
        Some(path) if !path.domains.is_empty() && !path.token.is_empty() => UpdateRequest {
            domains: Some(path.domains),
            token: Some(path.token),
            ip: non_empty(path.ip),
            ..flags
        },
        _ => UpdateRequest {
            domains: non_empty(query.domains),
            token: non_empty(query.token),
            ip: non_empty(query.ip),
            ..flags
        },
    }
}

fn flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or("").trim().to_string())
            .filter(|s| !s.is_empty())
    };

    header_value("x-real-ip").or_else(|| header_value("x-forwarded-for"))
}

/// Address used when the request carries no explicit IP.
pub fn source_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_headers: bool) -> String {
    if trust_forwarded_headers {
        if let Some(ip) = forwarded_ip(headers) {
            return ip;
        }
    }
    peer.ip().to_canonical().to_string()
}

/// Client address for the access log; `-` when nothing trustworthy is known.
fn log_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_headers: bool) -> String {
    match peer {
        Some(peer) => source_ip(headers, peer, trust_forwarded_headers),
        None if trust_forwarded_headers => forwarded_ip(headers).unwrap_or_else(|| "-".to_string()),
        None => "-".to_string(),
    }
}

impl IntoResponse for Verdict {
    fn into_response(self) -> Response {
        // Always 200; clients only read the body
        ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], self.as_str()).into_response()
    }
}
