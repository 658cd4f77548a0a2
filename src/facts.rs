//! AI fact sheets with a 30-day store-backed cache
//!
//! Two sheets per species: a general sheet of free-form field/value pairs
//! and a regulatory sheet with a fixed field set. Reads go to the store
//! first; generation runs only when a sheet is missing, expired, degraded,
//! or (for regulatory sheets) incomplete. The two sheets refresh
//! concurrently and independently.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::{BirdRecord, FactSheet, RegulatoryFactSheet};
use crate::db::Datastore;
use crate::remote::{call_with_retry, ContentGenerator, RetryPolicy};
use crate::types::{Result, RookeryError};

/// Sheets older than this regenerate on the next read
const SHEET_LIFETIME_DAYS: i64 = 30;

/// Fixed pointer to the regional regulator, stamped on every regulatory sheet
const AGENCY_LINK: &str = "https://www.fws.gov/library/collections/bird-hunting-regulations";

const GENERAL_FIELDS: &[&str] = &[
    "description",
    "diet",
    "habitat",
    "behavior",
    "nesting",
    "migration",
    "conservation_status",
    "fun_fact",
];

/// A sheet generated at `generated_at` is stale once strictly more than the
/// lifetime has elapsed; exactly at the boundary it is still fresh.
pub fn is_expired(generated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(generated_at) > ChronoDuration::days(SHEET_LIFETIME_DAYS)
}

pub struct FactService {
    store: Arc<dyn Datastore>,
    generator: Arc<dyn ContentGenerator>,
    policy: RetryPolicy,
}

impl FactService {
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

    /// Serve both sheets for a species, regenerating whichever is missing or
    /// stale. A terminal generation failure degrades that sheet rather than
    /// failing the read: the previous stale sheet is served as-is, or a
    /// placeholder with an error marker is stored and served when there was
    /// nothing cached.
    pub async fn get_or_refresh(
        &self,
        bird_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(FactSheet, RegulatoryFactSheet)> {
        let bird = self
            .store
            .get_bird(bird_id)
            .await?
            .ok_or_else(|| RookeryError::NotFound(format!("bird {bird_id}")))?;

        let (general, regulatory) = tokio::join!(
            self.ensure_general(&bird, now),
            self.ensure_regulatory(&bird, now),
        );
        Ok((general?, regulatory?))
    }

    async fn ensure_general(&self, bird: &BirdRecord, now: DateTime<Utc>) -> Result<FactSheet> {
        let cached = self.store.get_fact_sheet(&bird.id).await?;
        if let Some(sheet) = &cached {
            if sheet.error.is_none() && !is_expired(sheet.generated_at, now) {
                return Ok(sheet.clone());
            }
        }

        info!(bird_id = %bird.id, "regenerating general fact sheet");
        let prompt = general_prompt(bird);
        let generated = call_with_retry("fact-generator", &self.policy, || {
            self.generator.complete_json(&prompt, 600)
        })
        .await;

        match generated {
            Ok(json) => {
                let sheet = FactSheet {
                    bird_id: bird.id.clone(),
                    generated_at: now,
                    fields: flatten_fields(&json),
                    error: None,
                };
                self.store.upsert_fact_sheet(sheet.clone()).await?;
                Ok(sheet)
            }
            Err(e) => {
                warn!(bird_id = %bird.id, error = %e, "general fact generation failed");
                if let Some(stale) = cached {
                    return Ok(stale);
                }
                let degraded = FactSheet {
                    bird_id: bird.id.clone(),
                    generated_at: now,
                    fields: BTreeMap::new(),
                    error: Some("fact generation unavailable".to_string()),
                };
                self.store.upsert_fact_sheet(degraded.clone()).await?;
                Ok(degraded)
            }
        }
    }

    async fn ensure_regulatory(
        &self,
        bird: &BirdRecord,
        now: DateTime<Utc>,
    ) -> Result<RegulatoryFactSheet> {
        let cached = self.store.get_regulatory_sheet(&bird.id).await?;
        if let Some(sheet) = &cached {
            // Incomplete sheets retry on every read until a real answer lands
            if sheet.error.is_none() && sheet.is_complete() && !is_expired(sheet.generated_at, now)
            {
                return Ok(sheet.clone());
            }
        }

        info!(bird_id = %bird.id, "regenerating regulatory fact sheet");
        let prompt = regulatory_prompt(bird);
        let generated = call_with_retry("fact-generator", &self.policy, || {
            self.generator.complete_json(&prompt, 500)
        })
        .await;

        match generated {
            Ok(json) => {
                let sheet = regulatory_from_json(&bird.id, &json, now);
                self.store.upsert_regulatory_sheet(sheet.clone()).await?;
                Ok(sheet)
            }
            Err(e) => {
                warn!(bird_id = %bird.id, error = %e, "regulatory fact generation failed");
                if let Some(stale) = cached {
                    return Ok(stale);
                }
                let degraded = RegulatoryFactSheet {
                    bird_id: bird.id.clone(),
                    generated_at: now,
                    legal_status: String::new(),
                    season: String::new(),
                    license_requirements: String::new(),
                    federal_protections: String::new(),
                    not_huntable_statement: String::new(),
                    is_endangered: String::new(),
                    relevant_regulations: String::new(),
                    agency_link: AGENCY_LINK.to_string(),
                    error: Some("regulatory generation unavailable".to_string()),
                };
                self.store.upsert_regulatory_sheet(degraded.clone()).await?;
                Ok(degraded)
            }
        }
    }
}

fn general_prompt(bird: &BirdRecord) -> String {
    format!(
        "Provide factual information about the bird species {} ({}). \
         Respond with a JSON object containing exactly these string fields: {}. \
         Keep each field to one or two sentences.",
        bird.common_name,
        bird.scientific_name,
        GENERAL_FIELDS.join(", ")
    )
}

fn regulatory_prompt(bird: &BirdRecord) -> String {
    format!(
        "Provide United States hunting regulation information for {} ({}). \
         Respond with a JSON object containing exactly these string fields: \
         legal_status, season, license_requirements, federal_protections, \
         not_huntable_statement, is_endangered, relevant_regulations. \
         If the species may not be hunted, say so in not_huntable_statement \
         and set season to \"Closed\". Never answer \"N/A\" for legal_status.",
        bird.common_name, bird.scientific_name
    )
}

/// Collapse the generator's JSON object into string fields, stringifying any
/// non-string values it takes liberties with.
fn flatten_fields(json: &JsonValue) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    if let Some(object) = json.as_object() {
        for (key, value) in object {
            let text = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            fields.insert(key.clone(), text);
        }
    }
    fields
}

fn str_field(json: &JsonValue, key: &str) -> String {
    json.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn regulatory_from_json(bird_id: &str, json: &JsonValue, now: DateTime<Utc>) -> RegulatoryFactSheet {
    RegulatoryFactSheet {
        bird_id: bird_id.to_string(),
        generated_at: now,
        legal_status: str_field(json, "legal_status"),
        season: str_field(json, "season"),
        license_requirements: str_field(json, "license_requirements"),
        federal_protections: str_field(json, "federal_protections"),
        not_huntable_statement: str_field(json, "not_huntable_statement"),
        is_endangered: str_field(json, "is_endangered"),
        relevant_regulations: str_field(json, "relevant_regulations"),
        agency_link: AGENCY_LINK.to_string(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::remote::retry::RemoteError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct ScriptedGenerator {
        calls: AtomicU32,
        response: std::result::Result<JsonValue, ()>,
    }

    impl ScriptedGenerator {
        fn ok(value: JsonValue) -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: Ok(value),
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: Err(()),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn complete_json(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> std::result::Result<JsonValue, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response
                .clone()
                .map_err(|_| RemoteError::Fatal("scripted failure".into()))
        }

        async fn identify_image(
            &self,
            _prompt: &str,
            _image_b64: &str,
        ) -> std::result::Result<String, RemoteError> {
            Err(RemoteError::Fatal("not scripted".into()))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 8, 0, 0).unwrap()
    }

    fn bird() -> BirdRecord {
        BirdRecord {
            id: "amecro".into(),
            common_name: "American Crow".into(),
            scientific_name: "Corvus brachyrhynchos".into(),
            family: "Corvidae".into(),
            species: "brachyrhynchos".into(),
            is_endangered: false,
            can_hunt: true,
            last_seen_at: None,
            last_seen_lat: None,
            last_seen_lng: None,
            last_seen_location_id: None,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    fn full_regulatory_json() -> JsonValue {
        json!({
            "legal_status": "Legal to hunt with a valid license",
            "season": "Sep 1 - Mar 31",
            "license_requirements": "State small game license",
            "federal_protections": "Migratory Bird Treaty Act",
            "not_huntable_statement": "",
            "is_endangered": "No",
            "relevant_regulations": "50 CFR 20",
        })
    }

    async fn service_with(
        generator: Arc<ScriptedGenerator>,
    ) -> (Arc<MemoryStore>, FactService) {
        let store = Arc::new(MemoryStore::new());
        store
            .apply_catalog_batch(&[bird()], &[])
            .await
            .unwrap();
        let service = FactService::new(store.clone(), generator, policy());
        (store, service)
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let generated_at = t0();
        let lifetime = ChronoDuration::days(SHEET_LIFETIME_DAYS);
        assert!(!is_expired(generated_at, generated_at + lifetime));
        assert!(is_expired(
            generated_at,
            generated_at + lifetime + ChronoDuration::milliseconds(1)
        ));
        assert!(!is_expired(
            generated_at,
            generated_at + lifetime - ChronoDuration::milliseconds(1)
        ));
    }

    #[tokio::test]
    async fn fresh_sheets_skip_generation() {
        let generator = Arc::new(ScriptedGenerator::ok(json!({"description": "a crow"})));
        let (store, service) = service_with(generator.clone()).await;

        store
            .upsert_fact_sheet(FactSheet {
                bird_id: "amecro".into(),
                generated_at: t0(),
                fields: BTreeMap::from([("description".into(), "cached".into())]),
                error: None,
            })
            .await
            .unwrap();
        store
            .upsert_regulatory_sheet(regulatory_from_json(
                "amecro",
                &full_regulatory_json(),
                t0(),
            ))
            .await
            .unwrap();

        let (general, _) = service
            .get_or_refresh("amecro", t0() + ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(general.fields["description"], "cached");
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn expired_sheet_regenerates() {
        let generator = Arc::new(ScriptedGenerator::ok(json!({"description": "fresh copy"})));
        let (store, service) = service_with(generator.clone()).await;

        store
            .upsert_fact_sheet(FactSheet {
                bird_id: "amecro".into(),
                generated_at: t0(),
                fields: BTreeMap::from([("description".into(), "old".into())]),
                error: None,
            })
            .await
            .unwrap();

        let later = t0() + ChronoDuration::days(SHEET_LIFETIME_DAYS) + ChronoDuration::seconds(1);
        let (general, _) = service.get_or_refresh("amecro", later).await.unwrap();
        assert_eq!(general.fields["description"], "fresh copy");
        assert_eq!(general.generated_at, later);
    }

    #[tokio::test]
    async fn incomplete_regulatory_sheet_retries() {
        let generator = Arc::new(ScriptedGenerator::ok(full_regulatory_json()));
        let (store, service) = service_with(generator.clone()).await;

        let incomplete = regulatory_from_json(
            "amecro",
            &json!({"legal_status": "N/A", "season": "N/A"}),
            t0(),
        );
        assert!(!incomplete.is_complete());
        store.upsert_regulatory_sheet(incomplete).await.unwrap();

        let (_, regulatory) = service
            .get_or_refresh("amecro", t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert!(regulatory.is_complete());
        assert_eq!(regulatory.season, "Sep 1 - Mar 31");
    }

    #[tokio::test]
    async fn terminal_failure_serves_stale_sheet() {
        let generator = Arc::new(ScriptedGenerator::failing());
        let (store, service) = service_with(generator).await;

        store
            .upsert_fact_sheet(FactSheet {
                bird_id: "amecro".into(),
                generated_at: t0(),
                fields: BTreeMap::from([("description".into(), "stale but real".into())]),
                error: None,
            })
            .await
            .unwrap();
        store
            .upsert_regulatory_sheet(regulatory_from_json(
                "amecro",
                &full_regulatory_json(),
                t0(),
            ))
            .await
            .unwrap();

        let later = t0() + ChronoDuration::days(40);
        let (general, regulatory) = service.get_or_refresh("amecro", later).await.unwrap();
        assert_eq!(general.fields["description"], "stale but real");
        assert!(general.error.is_none());
        assert!(regulatory.is_complete());
    }

    #[tokio::test]
    async fn terminal_failure_with_no_cache_degrades() {
        let generator = Arc::new(ScriptedGenerator::failing());
        let (store, service) = service_with(generator).await;

        let (general, regulatory) = service.get_or_refresh("amecro", t0()).await.unwrap();
        assert!(general.error.is_some());
        assert!(general.fields.is_empty());
        assert!(regulatory.error.is_some());
        assert_eq!(regulatory.agency_link, AGENCY_LINK);

        // Degraded sheets persist so the next read sees and retries them
        let stored = store.get_fact_sheet("amecro").await.unwrap().unwrap();
        assert!(stored.error.is_some());
    }

    #[tokio::test]
    async fn unknown_bird_is_not_found() {
        let generator = Arc::new(ScriptedGenerator::ok(json!({})));
        let (_, service) = service_with(generator).await;
        let err = service.get_or_refresh("nosuch", t0()).await.unwrap_err();
        assert!(matches!(err, RookeryError::NotFound(_)));
    }
}
