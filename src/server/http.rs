//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling; one spawned task per
//! connection and hand-rolled method/path routing.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::catalog::CatalogSync;
use crate::config::Args;
use crate::db::Datastore;
use crate::events::EventBus;
use crate::facts::FactService;
use crate::identify::IdentifyService;
use crate::lifecycle::LifecycleService;
use crate::remote::images::ImageSearch;
use crate::routes;
use crate::types::RookeryError;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub store: Arc<dyn Datastore>,
    pub catalog: Arc<CatalogSync>,
    pub facts: Arc<FactService>,
    pub identify: Arc<IdentifyService>,
    pub lifecycle: Arc<LifecycleService>,
    /// Absent when no image search key is configured
    pub images: Option<Arc<dyn ImageSearch>>,
    pub events: EventBus,
    /// Whether the datastore behind `store` is the real MongoDB backend
    pub datastore_connected: bool,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Spawn the scheduled catalog reconciliation task. Each tick re-checks the
/// staleness marker, so a short interval stays cheap.
pub fn spawn_catalog_task(state: Arc<AppState>) {
    let interval = std::time::Duration::from_secs(state.args.catalog_sync_interval_secs.max(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let region = state.args.region.clone();
            match state
                .catalog
                .reconcile_if_stale(&region, chrono::Utc::now())
                .await
            {
                Ok(outcome) if outcome.skipped => {}
                Ok(outcome) => info!(
                    region,
                    added = outcome.added.len(),
                    removed = outcome.removed.len(),
                    "scheduled catalog pass applied changes"
                ),
                Err(e) => warn!(region, error = %e, "scheduled catalog pass failed"),
            }
        }
    });
}

pub async fn run(state: Arc<AppState>) -> Result<(), RookeryError> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(|e| RookeryError::Internal(format!("bind {}: {e}", state.args.listen)))?;

    info!("Rookery listening on {}", state.args.listen);
    if state.args.dev_mode {
        warn!("Development mode enabled - in-memory datastore, relaxed auth");
    }

    spawn_catalog_task(Arc::clone(&state));

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    info!("{} {}", method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)))
        }

        // Readiness probe
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            to_boxed(routes::readiness_check(Arc::clone(&state)))
        }

        (Method::GET, "/version") => to_boxed(routes::version_info()),

        (Method::OPTIONS, _) => to_boxed(preflight_response()),

        (Method::POST, "/api/v1/identify") => {
            let body = read_body(req).await?;
            to_boxed(routes::handle_identify(Arc::clone(&state), body).await)
        }

        (Method::GET, p) if p.starts_with("/api/v1/catalog/") => {
            let region = p.trim_start_matches("/api/v1/catalog/");
            to_boxed(routes::handle_catalog(Arc::clone(&state), region).await)
        }

        (Method::POST, p) if p.starts_with("/api/v1/catalog/") && p.ends_with("/sync") => {
            let region = p
                .trim_start_matches("/api/v1/catalog/")
                .trim_end_matches("/sync");
            to_boxed(routes::handle_catalog_sync(Arc::clone(&state), region).await)
        }

        (Method::GET, p) if p.starts_with("/api/v1/birds/") => {
            let bird_id = p.trim_start_matches("/api/v1/birds/");
            to_boxed(routes::handle_bird(Arc::clone(&state), bird_id).await)
        }

        // /api/v1/accounts/{id}/quota/{capability}
        (Method::GET, p)
            if p.starts_with("/api/v1/accounts/") && p.contains("/quota/") =>
        {
            let rest = p.trim_start_matches("/api/v1/accounts/");
            match rest.split_once("/quota/") {
                Some((account_id, capability)) => to_boxed(
                    routes::handle_quota(Arc::clone(&state), account_id, capability).await,
                ),
                None => to_boxed(not_found_response(&path)),
            }
        }

        (Method::POST, p)
            if p.starts_with("/api/v1/accounts/") && p.contains("/quota/") =>
        {
            let rest = p.trim_start_matches("/api/v1/accounts/");
            match rest.split_once("/quota/") {
                Some((account_id, capability)) => to_boxed(
                    routes::handle_quota_consume(Arc::clone(&state), account_id, capability)
                        .await,
                ),
                None => to_boxed(not_found_response(&path)),
            }
        }

        (Method::POST, "/api/v1/accounts") => {
            let body = read_body(req).await?;
            to_boxed(routes::handle_provision(Arc::clone(&state), body).await)
        }

        (Method::DELETE, p) if p.starts_with("/api/v1/accounts/") => {
            let account_id = p.trim_start_matches("/api/v1/accounts/");
            to_boxed(routes::handle_retire(Arc::clone(&state), account_id).await)
        }

        (Method::POST, "/api/v1/events") => {
            let body = read_body(req).await?;
            to_boxed(routes::handle_event(Arc::clone(&state), body).await)
        }

        (Method::GET, "/api/v1/images") => {
            to_boxed(routes::handle_image_search(Arc::clone(&state), query.as_deref()).await)
        }

        _ => to_boxed(not_found_response(&path)),
    };

    Ok(response)
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, hyper::Error> {
    Ok(req.into_body().collect().await?.to_bytes())
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
