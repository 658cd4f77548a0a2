//! Photo identification flow
//!
//! The full pipeline behind one identification request: argument checks,
//! quota spend, the vision call, parsing the model's labeled-line reply,
//! verifying the species against the regional catalog, resolving the
//! sighting location, and recording the verified identification. The quota
//! is spent before the vision call and is not refunded on a miss.

use base64::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::db::schemas::IdentificationRecord;
use crate::db::Datastore;
use crate::location;
use crate::quota::{self, Capability};
use crate::remote::{call_with_retry, ContentGenerator, RetryPolicy};
use crate::types::{Result, RookeryError};

const UNKNOWN: &str = "Unknown";

const IDENTIFY_PROMPT: &str = "Identify the bird species in this photograph. \
Reply with exactly five lines in this format:\n\
ID: <eBird species code>\n\
Common Name: <name>\n\
Scientific Name: <name>\n\
Family: <family>\n\
Species: <species epithet>\n\
If you cannot identify a bird, reply with the single line: ID: Unknown";

#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub account_id: String,
    /// Base64-encoded JPEG
    pub image_b64: String,
    pub lat: f64,
    pub lng: f64,
    pub locality: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentifyOutcome {
    pub verified: bool,
    pub common_name: String,
    pub scientific_name: String,
    pub family: String,
    pub species: String,
    /// Catalog id, present only when verified against the region
    pub bird_id: Option<String>,
    pub location_id: String,
    pub quota_remaining: i64,
    /// Display line for clients; unverified results carry an `ID: Unknown`
    /// prefix ahead of whatever the model reported
    pub result: String,
}

fn result_echo(verified: bool, parsed: &ParsedReply) -> String {
    if verified {
        format!("{} ({})", parsed.common_name, parsed.scientific_name)
    } else if parsed.is_unknown() {
        "ID: Unknown".to_string()
    } else {
        format!(
            "ID: Unknown - {} ({})",
            parsed.common_name, parsed.scientific_name
        )
    }
}

/// Fields parsed out of the model's labeled-line reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    /// Provider species code from the `ID:` line
    pub id: String,
    pub common_name: String,
    pub scientific_name: String,
    pub family: String,
    pub species: String,
}

impl ParsedReply {
    fn all_unknown() -> Self {
        ParsedReply {
            id: UNKNOWN.to_string(),
            common_name: UNKNOWN.to_string(),
            scientific_name: UNKNOWN.to_string(),
            family: UNKNOWN.to_string(),
            species: UNKNOWN.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN && self.common_name == UNKNOWN
    }
}

/// Parse the labeled-line reply, tolerating extra prose and missing lines.
/// Any field the reply does not carry comes back as `Unknown`; an explicit
/// `ID: Unknown` reply yields all-unknown fields.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let mut parsed = ParsedReply::all_unknown();

    for line in reply.lines() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("ID: Unknown") {
            return ParsedReply::all_unknown();
        }
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match label.trim().to_ascii_lowercase().as_str() {
            "id" => parsed.id = value.to_string(),
            "common name" => parsed.common_name = value.to_string(),
            "scientific name" => parsed.scientific_name = value.to_string(),
            "family" => parsed.family = value.to_string(),
            "species" => parsed.species = value.to_string(),
            _ => {}
        }
    }
    parsed
}

pub struct IdentifyService {
    store: Arc<dyn Datastore>,
    generator: Arc<dyn ContentGenerator>,
    policy: RetryPolicy,
}

impl IdentifyService {
    pub fn new(
        store: Arc<dyn Datastore>,
        generator: Arc<dyn ContentGenerator>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            generator,
            policy,
        }
    }

    pub async fn identify(
        &self,
        request: IdentifyRequest,
        now: DateTime<Utc>,
    ) -> Result<IdentifyOutcome> {
        if request.image_b64.is_empty() {
            return Err(RookeryError::InvalidArgument("empty image payload".into()));
        }
        if base64::engine::general_purpose::STANDARD
            .decode(&request.image_b64)
            .is_err()
        {
            return Err(RookeryError::InvalidArgument(
                "image payload is not valid base64".into(),
            ));
        }
        location::validate_coordinates(request.lat, request.lng)?;

        let decision = quota::try_consume(
            self.store.as_ref(),
            &request.account_id,
            Capability::Identification,
            now,
        )
        .await?;
        if !decision.allowed {
            return Err(RookeryError::ResourceExhausted {
                capability: Capability::Identification.as_str().to_string(),
                retry_after: decision.retry_after.unwrap_or_default(),
            });
        }

        let reply = call_with_retry("vision-identifier", &self.policy, || {
            self.generator
                .identify_image(IDENTIFY_PROMPT, &request.image_b64)
        })
        .await?;
        let parsed = parse_reply(&reply);

        let loc = location::resolve(
            self.store.as_ref(),
            request.lat,
            request.lng,
            request.locality.as_deref(),
        )
        .await?;

        if parsed.is_unknown() {
            info!(account_id = %request.account_id, "identification came back unknown");
            return Ok(IdentifyOutcome {
                verified: false,
                result: result_echo(false, &parsed),
                common_name: parsed.common_name,
                scientific_name: parsed.scientific_name,
                family: parsed.family,
                species: parsed.species,
                bird_id: None,
                location_id: loc.id,
                quota_remaining: decision.remaining_after,
            });
        }

        // Species verification against the regional catalog: the reported
        // species code first, then the name pair
        let mut bird = if parsed.id == UNKNOWN {
            None
        } else {
            self.store.get_bird(&parsed.id).await?
        };
        if bird.is_none() {
            bird = self
                .store
                .find_bird_by_names(&parsed.common_name, &parsed.scientific_name)
                .await?;
        }

        let (verified, bird_id) = match &bird {
            Some(b) => (true, Some(b.id.clone())),
            None => (false, None),
        };

        if let Some(bird) = &bird {
            self.store
                .insert_identification(IdentificationRecord {
                    id: Uuid::new_v4().to_string(),
                    owner_id: request.account_id.clone(),
                    bird_id: bird.id.clone(),
                    common_name: bird.common_name.clone(),
                    scientific_name: bird.scientific_name.clone(),
                    family: bird.family.clone(),
                    species: bird.species.clone(),
                    location_id: loc.id.clone(),
                    verified: true,
                    recorded_at: now,
                })
                .await?;
        }

        info!(
            account_id = %request.account_id,
            common_name = %parsed.common_name,
            verified,
            "identification completed"
        );
        Ok(IdentifyOutcome {
            verified,
            result: result_echo(verified, &parsed),
            common_name: parsed.common_name,
            scientific_name: parsed.scientific_name,
            family: parsed.family,
            species: parsed.species,
            bird_id,
            location_id: loc.id,
            quota_remaining: decision.remaining_after,
        })
    }
}
