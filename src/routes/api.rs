//! API route handlers
//!
//! Thin JSON shims over the core services. Handlers parse the request,
//! delegate, and map [`RookeryError`] onto HTTP statuses; no domain logic
//! lives here.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

use crate::events::DomainEvent;
use crate::identify::IdentifyRequest;
use crate::quota::{self, Capability};
use crate::remote::call_with_retry;
use crate::routes::health::json_response;
use crate::server::AppState;
use crate::types::RookeryError;

fn error_response(err: &RookeryError) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*");

    let body = match err {
        RookeryError::ResourceExhausted {
            capability,
            retry_after,
        } => {
            builder = builder.header("Retry-After", retry_after.as_secs().to_string());
            serde_json::json!({
                "error": err.public_message(),
                "capability": capability,
                "retry_after_ms": retry_after.as_millis() as u64,
            })
        }
        _ => serde_json::json!({ "error": err.public_message() }),
    };

    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn bad_json(context: &str) -> Response<Full<Bytes>> {
    error_response(&RookeryError::InvalidArgument(format!(
        "malformed request body: {context}"
    )))
}

// -- identification ----------------------------------------------------------

#[derive(Deserialize)]
struct IdentifyBody {
    /// Verified subject injected by the fronting gateway
    account_id: Option<String>,
    /// Base64-encoded JPEG
    image: String,
    lat: f64,
    lng: f64,
    locality: Option<String>,
}

pub async fn handle_identify(state: Arc<AppState>, body: Bytes) -> Response<Full<Bytes>> {
    let parsed: IdentifyBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return bad_json(&e.to_string()),
    };
    let Some(account_id) = parsed.account_id.filter(|id| !id.is_empty()) else {
        return error_response(&RookeryError::Unauthenticated);
    };

    let request = IdentifyRequest {
        account_id,
        image_b64: parsed.image,
        lat: parsed.lat,
        lng: parsed.lng,
        locality: parsed.locality,
    };
    match state.identify.identify(request, Utc::now()).await {
        Ok(outcome) => json_response(StatusCode::OK, &outcome),
        Err(e) => error_response(&e),
    }
}

// -- catalog -----------------------------------------------------------------

pub async fn handle_catalog(state: Arc<AppState>, region: &str) -> Response<Full<Bytes>> {
    if region.is_empty() || region.contains('/') {
        return error_response(&RookeryError::InvalidArgument("bad region code".into()));
    }

    // Serving the catalog refreshes it first when the marker has gone stale
    if let Err(e) = state.catalog.reconcile_if_stale(region, Utc::now()).await {
        return error_response(&e);
    }

    let marker = match state.store.get_marker(region).await {
        Ok(Some(m)) => m,
        Ok(None) => {
            return error_response(&RookeryError::NotFound(format!("catalog {region}")))
        }
        Err(e) => return error_response(&e),
    };
    let birds = match state.store.list_birds(&marker.species_ids).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };

    // Cached fact sheets only; the listing never triggers generation
    let mut entries = Vec::with_capacity(birds.len());
    for bird in birds {
        let facts = match state.store.get_fact_sheet(&bird.id).await {
            Ok(sheet) => sheet,
            Err(e) => return error_response(&e),
        };
        let regulatory = match state.store.get_regulatory_sheet(&bird.id).await {
            Ok(sheet) => sheet,
            Err(e) => return error_response(&e),
        };
        entries.push(serde_json::json!({
            "bird": bird,
            "facts": facts,
            "regulatory": regulatory,
        }));
    }
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "region": region,
            "updated_at": marker.updated_at,
            "birds": entries,
        }),
    )
}

pub async fn handle_catalog_sync(state: Arc<AppState>, region: &str) -> Response<Full<Bytes>> {
    if region.is_empty() || region.contains('/') {
        return error_response(&RookeryError::InvalidArgument("bad region code".into()));
    }
    match state.catalog.reconcile(region, Utc::now()).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "region": region,
                "added": outcome.added,
                "removed": outcome.removed,
                "updated": outcome.updated,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_bird(state: Arc<AppState>, bird_id: &str) -> Response<Full<Bytes>> {
    if bird_id.is_empty() || bird_id.contains('/') {
        return error_response(&RookeryError::InvalidArgument("bad bird id".into()));
    }

    let bird = match state.store.get_bird(bird_id).await {
        Ok(Some(b)) => b,
        Ok(None) => return error_response(&RookeryError::NotFound(format!("bird {bird_id}"))),
        Err(e) => return error_response(&e),
    };
    match state.facts.get_or_refresh(bird_id, Utc::now()).await {
        Ok((facts, regulatory)) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "bird": bird,
                "facts": facts,
                "regulatory": regulatory,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

// -- accounts ----------------------------------------------------------------

pub async fn handle_quota(
    state: Arc<AppState>,
    account_id: &str,
    capability: &str,
) -> Response<Full<Bytes>> {
    let Some(capability) = Capability::parse(capability) else {
        return error_response(&RookeryError::InvalidArgument(format!(
            "unknown capability {capability}"
        )));
    };
    match quota::peek(state.store.as_ref(), account_id, capability, Utc::now()).await {
        Ok(view) => json_response(StatusCode::OK, &quota_body(capability, &view)),
        Err(e) => error_response(&e),
    }
}

/// Internal consume surface for trusted backend callers
pub async fn handle_quota_consume(
    state: Arc<AppState>,
    account_id: &str,
    capability: &str,
) -> Response<Full<Bytes>> {
    let Some(capability) = Capability::parse(capability) else {
        return error_response(&RookeryError::InvalidArgument(format!(
            "unknown capability {capability}"
        )));
    };
    match quota::try_consume(state.store.as_ref(), account_id, capability, Utc::now()).await {
        Ok(decision) if decision.allowed => {
            json_response(StatusCode::OK, &quota_body(capability, &decision))
        }
        Ok(decision) => error_response(&RookeryError::ResourceExhausted {
            capability: capability.as_str().to_string(),
            retry_after: decision.retry_after.unwrap_or_default(),
        }),
        Err(e) => error_response(&e),
    }
}

fn quota_body(capability: Capability, decision: &quota::QuotaDecision) -> serde_json::Value {
    serde_json::json!({
        "capability": capability.as_str(),
        "allowed": decision.allowed,
        "remaining": decision.remaining_after,
        "max": capability.max_uses(),
        "retry_after_ms": decision.retry_after.map(|d| d.as_millis() as u64),
    })
}

#[derive(Deserialize)]
struct ProvisionBody {
    account_id: String,
}

pub async fn handle_provision(state: Arc<AppState>, body: Bytes) -> Response<Full<Bytes>> {
    let parsed: ProvisionBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return bad_json(&e.to_string()),
    };
    if parsed.account_id.is_empty() {
        return error_response(&RookeryError::InvalidArgument("empty account id".into()));
    }
    match state.lifecycle.provision(&parsed.account_id, Utc::now()).await {
        Ok(created) => json_response(
            if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            },
            &serde_json::json!({ "account_id": parsed.account_id, "created": created }),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_retire(state: Arc<AppState>, account_id: &str) -> Response<Full<Bytes>> {
    if account_id.is_empty() || account_id.contains('/') {
        return error_response(&RookeryError::InvalidArgument("bad account id".into()));
    }
    match state.lifecycle.retire(account_id).await {
        Ok(report) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "account_removed": report.account_removed,
                "documents_removed": report.documents_removed,
                "threads_removed": report.threads_removed,
            }),
        ),
        Err(e) => error_response(&e),
    }
}

// -- events ------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventBody {
    EntryLogged {
        account_id: String,
        entry_id: String,
    },
    EntryDeleted {
        account_id: String,
        points_earned: i64,
        #[serde(default)]
        was_duplicate: bool,
    },
    MediaDeleted {
        account_id: String,
        entry_id: String,
    },
    AccountCreated {
        account_id: String,
    },
    AccountDeleted {
        account_id: String,
    },
}

/// Webhook for trusted backend and identity-provider events. Collection
/// events go through the async dispatcher; lifecycle events run inline so
/// the caller sees their outcome.
pub async fn handle_event(state: Arc<AppState>, body: Bytes) -> Response<Full<Bytes>> {
    let parsed: EventBody = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return bad_json(&e.to_string()),
    };
    let event = match parsed {
        EventBody::EntryLogged {
            account_id,
            entry_id,
        } => DomainEvent::EntryLogged {
            account_id,
            entry_id,
        },
        EventBody::EntryDeleted {
            account_id,
            points_earned,
            was_duplicate,
        } => DomainEvent::EntryDeleted {
            account_id,
            points_earned,
            was_duplicate,
        },
        EventBody::MediaDeleted {
            account_id,
            entry_id,
        } => DomainEvent::MediaDeleted {
            account_id,
            entry_id,
        },
        EventBody::AccountCreated { account_id } => {
            return match state.lifecycle.provision(&account_id, Utc::now()).await {
                Ok(created) => json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({ "accepted": true, "created": created }),
                ),
                Err(e) => error_response(&e),
            };
        }
        EventBody::AccountDeleted { account_id } => {
            return match state.lifecycle.retire(&account_id).await {
                Ok(report) => json_response(
                    StatusCode::ACCEPTED,
                    &serde_json::json!({
                        "accepted": true,
                        "documents_removed": report.documents_removed,
                    }),
                ),
                Err(e) => error_response(&e),
            };
        }
    };
    state.events.publish(event);
    json_response(StatusCode::ACCEPTED, &serde_json::json!({ "accepted": true }))
}

// -- image search ------------------------------------------------------------

pub async fn handle_image_search(
    state: Arc<AppState>,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let Some(images) = &state.images else {
        return error_response(&RookeryError::Upstream("image search not configured".into()));
    };
    let Some(term) = query.and_then(|q| query_param(q, "query")).filter(|t| !t.is_empty())
    else {
        return error_response(&RookeryError::InvalidArgument(
            "missing query parameter".into(),
        ));
    };

    let policy = state.args.retry_policy(state.args.images_timeout());
    match call_with_retry("image-search", &policy, || images.search(&term, 10)).await {
        Ok(hits) => json_response(StatusCode::OK, &serde_json::json!({ "hits": hits })),
        Err(e) => error_response(&e),
    }
}

/// Pull one parameter out of a raw query string, decoding `+` and `%XX`
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(percent_decode(value))
        } else {
            None
        }
    })
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
