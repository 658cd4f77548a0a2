//! Regional catalog synchronization
//!
//! Reconciles the stored species catalog against the observation provider's
//! live feeds. A per-region marker records the id set and timestamp of the
//! last committed pass; the marker is only written after the record batch
//! commits, so a crash mid-pass leaves the catalog marked stale and the next
//! pass redoes the work.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::{BirdRecord, CatalogMarker};
use crate::db::Datastore;
use crate::location;
use crate::remote::{call_with_retry, Observation, ObservationProvider, RetryPolicy};
use crate::types::Result;

/// Markers older than this force a reconciliation pass
const MARKER_LIFETIME_HOURS: i64 = 72;

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Pass skipped because the marker was fresh and non-empty
    pub skipped: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

pub struct CatalogSync {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn ObservationProvider>,
    policy: RetryPolicy,
}

impl CatalogSync {
    pub fn new(
        store: Arc<dyn Datastore>,
        provider: Arc<dyn ObservationProvider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            policy,
        }
    }

    /// Reconcile unless the marker shows a recent committed pass. An empty
    /// id set never counts as fresh: a region that once reconciled to
    /// nothing retries on every call.
    pub async fn reconcile_if_stale(
        &self,
        region: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        if let Some(marker) = self.store.get_marker(region).await? {
            let age = now.signed_duration_since(marker.updated_at);
            if age < ChronoDuration::hours(MARKER_LIFETIME_HOURS) && !marker.species_ids.is_empty()
            {
                return Ok(ReconcileOutcome {
                    skipped: true,
                    ..Default::default()
                });
            }
        }
        self.reconcile(region, now).await
    }

    /// Unconditional reconciliation pass.
    pub async fn reconcile(&self, region: &str, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        info!(region, "starting catalog reconciliation");

        let (species_codes, taxonomy, observations) = tokio::try_join!(
            call_with_retry("observation-provider", &self.policy, || {
                self.provider.region_species(region)
            }),
            call_with_retry("observation-provider", &self.policy, || {
                self.provider.taxonomy()
            }),
            call_with_retry("observation-provider", &self.policy, || {
                self.provider.recent_observations(region)
            }),
        )?;

        let taxa: HashMap<&str, _> = taxonomy
            .iter()
            .map(|t| (t.species_code.as_str(), t))
            .collect();
        let latest = latest_observations(&observations);

        let mut records = Vec::new();
        for code in &species_codes {
            let Some(taxon) = taxa.get(code.as_str()) else {
                warn!(region, species_code = %code, "species missing from taxonomy, skipping");
                continue;
            };
            let seen = latest.get(code.as_str());
            records.push(BirdRecord {
                id: taxon.species_code.clone(),
                common_name: taxon.common_name.clone(),
                scientific_name: taxon.scientific_name.clone(),
                family: taxon.family.clone(),
                species: species_epithet(&taxon.scientific_name),
                is_endangered: false,
                can_hunt: false,
                last_seen_at: seen.and_then(|o| o.observed_at_utc()),
                last_seen_lat: seen.and_then(|o| o.lat),
                last_seen_lng: seen.and_then(|o| o.lng),
                last_seen_location_id: None,
            });
        }
        records.sort_by(|a, b| a.common_name.cmp(&b.common_name));

        let previous: HashSet<String> = match self.store.get_marker(region).await? {
            Some(marker) => marker.species_ids.into_iter().collect(),
            None => HashSet::new(),
        };
        let current: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();

        let mut added: Vec<String> = current.difference(&previous).cloned().collect();
        let mut removed: Vec<String> = previous.difference(&current).cloned().collect();
        let mut updated: Vec<String> = current.intersection(&previous).cloned().collect();
        added.sort();
        removed.sort();
        updated.sort();

        self.store.apply_catalog_batch(&records, &removed).await?;

        // Marker goes in only once the batch is durably committed
        let mut species_ids: Vec<String> = current.into_iter().collect();
        species_ids.sort();
        self.store
            .put_marker(CatalogMarker {
                region: region.to_string(),
                species_ids,
                updated_at: now,
            })
            .await?;

        // Location references resolve lazily after the commit; a failure here
        // degrades one record, not the pass
        for record in &records {
            let (Some(lat), Some(lng)) = (record.last_seen_lat, record.last_seen_lng) else {
                continue;
            };
            let locality = latest.get(record.id.as_str()).and_then(|o| o.locality.as_deref());
            match location::resolve(self.store.as_ref(), lat, lng, locality).await {
                Ok(loc) => {
                    if let Err(e) = self.store.set_bird_location(&record.id, &loc.id).await {
                        warn!(bird_id = %record.id, error = %e, "location patch failed");
                    }
                }
                Err(e) => {
                    warn!(bird_id = %record.id, error = %e, "location resolution failed");
                }
            }
        }

        info!(
            region,
            added = added.len(),
            removed = removed.len(),
            updated = updated.len(),
            "catalog reconciliation committed"
        );
        Ok(ReconcileOutcome {
            skipped: false,
            added,
            removed,
            updated,
        })
    }
}

/// Newest observation with usable coordinates per species
fn latest_observations(observations: &[Observation]) -> HashMap<&str, &Observation> {
    let mut latest: HashMap<&str, &Observation> = HashMap::new();
    for obs in observations {
        if !obs.has_coordinates() {
            continue;
        }
        let Some(at) = obs.observed_at_utc() else {
            continue;
        };
        match latest.get(obs.species_code.as_str()) {
            Some(existing) if existing.observed_at_utc() >= Some(at) => {}
            _ => {
                latest.insert(obs.species_code.as_str(), obs);
            }
        }
    }
    latest
}

fn species_epithet(scientific_name: &str) -> String {
    scientific_name
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schemas::FactSheet;
    use crate::remote::retry::RemoteError;
    use crate::remote::TaxonEntry;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProvider {
        species: Mutex<Vec<String>>,
        taxonomy: Vec<TaxonEntry>,
        observations: Vec<Observation>,
    }

    impl ScriptedProvider {
        fn new(species: &[&str]) -> Self {
            let taxonomy = ["amecro", "norcar", "blujay", "dowwoo"]
                .iter()
                .map(|code| TaxonEntry {
                    species_code: code.to_string(),
                    common_name: format!("{code} common"),
                    scientific_name: format!("Genus {code}"),
                    family: "Family".into(),
                })
                .collect();
            Self {
                species: Mutex::new(species.iter().map(|s| s.to_string()).collect()),
                taxonomy,
                observations: Vec::new(),
            }
        }

        fn set_species(&self, species: &[&str]) {
            *self.species.lock().unwrap() = species.iter().map(|s| s.to_string()).collect();
        }
    }

    #[async_trait]
    impl ObservationProvider for ScriptedProvider {
        async fn region_species(
            &self,
            _region: &str,
        ) -> std::result::Result<Vec<String>, RemoteError> {
            Ok(self.species.lock().unwrap().clone())
        }

        async fn taxonomy(&self) -> std::result::Result<Vec<TaxonEntry>, RemoteError> {
            Ok(self.taxonomy.clone())
        }

        async fn recent_observations(
            &self,
            _region: &str,
        ) -> std::result::Result<Vec<Observation>, RemoteError> {
            Ok(self.observations.clone())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(5))
    }

    fn sync_with(provider: Arc<ScriptedProvider>) -> (Arc<MemoryStore>, CatalogSync) {
        let store = Arc::new(MemoryStore::new());
        let sync = CatalogSync::new(store.clone(), provider, policy());
        (store, sync)
    }

    #[tokio::test]
    async fn first_pass_adds_everything() {
        let provider = Arc::new(ScriptedProvider::new(&["amecro", "norcar"]));
        let (store, sync) = sync_with(provider);

        let outcome = sync.reconcile("US-ME", t0()).await.unwrap();
        assert_eq!(outcome.added, vec!["amecro", "norcar"]);
        assert!(outcome.removed.is_empty());
        assert!(outcome.updated.is_empty());

        let marker = store.get_marker("US-ME").await.unwrap().unwrap();
        assert_eq!(marker.species_ids, vec!["amecro", "norcar"]);
        assert_eq!(marker.updated_at, t0());
        assert!(store.get_bird("amecro").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn diff_classifies_added_removed_updated() {
        let provider = Arc::new(ScriptedProvider::new(&["amecro", "norcar", "blujay"]));
        let (store, sync) = sync_with(provider.clone());
        sync.reconcile("US-ME", t0()).await.unwrap();

        provider.set_species(&["amecro", "blujay", "dowwoo"]);
        let outcome = sync
            .reconcile("US-ME", t0() + ChronoDuration::days(4))
            .await
            .unwrap();

        assert_eq!(outcome.added, vec!["dowwoo"]);
        assert_eq!(outcome.removed, vec!["norcar"]);
        assert_eq!(outcome.updated, vec!["amecro", "blujay"]);
        assert!(store.get_bird("norcar").await.unwrap().is_none());
        assert!(store.get_bird("dowwoo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removal_drops_fact_sheets() {
        let provider = Arc::new(ScriptedProvider::new(&["amecro", "norcar"]));
        let (store, sync) = sync_with(provider.clone());
        sync.reconcile("US-ME", t0()).await.unwrap();
        store
            .upsert_fact_sheet(FactSheet {
                bird_id: "norcar".into(),
                generated_at: t0(),
                fields: BTreeMap::new(),
                error: None,
            })
            .await
            .unwrap();

        provider.set_species(&["amecro"]);
        sync.reconcile("US-ME", t0() + ChronoDuration::days(4))
            .await
            .unwrap();
        assert!(store.get_fact_sheet("norcar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_marker_skips_the_pass() {
        let provider = Arc::new(ScriptedProvider::new(&["amecro"]));
        let (_, sync) = sync_with(provider.clone());
        sync.reconcile("US-ME", t0()).await.unwrap();

        provider.set_species(&["norcar"]);
        let outcome = sync
            .reconcile_if_stale("US-ME", t0() + ChronoDuration::hours(71))
            .await
            .unwrap();
        assert!(outcome.skipped);

        // Past the lifetime the pass runs and picks up the change
        let outcome = sync
            .reconcile_if_stale("US-ME", t0() + ChronoDuration::hours(73))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.added, vec!["norcar"]);
    }

    #[tokio::test]
    async fn empty_marker_never_counts_as_fresh() {
        let provider = Arc::new(ScriptedProvider::new(&[]));
        let (_, sync) = sync_with(provider.clone());
        sync.reconcile("US-ME", t0()).await.unwrap();

        provider.set_species(&["amecro"]);
        let outcome = sync
            .reconcile_if_stale("US-ME", t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert!(!outcome.skipped);
        assert_eq!(outcome.added, vec!["amecro"]);
    }

    #[tokio::test]
    async fn observations_drive_last_seen_and_location() {
        let mut provider = ScriptedProvider::new(&["amecro"]);
        provider.observations = vec![
            Observation {
                species_code: "amecro".into(),
                observed_at: "2026-04-30 07:00".into(),
                lat: Some(44.3106),
                lng: Some(-69.7795),
                locality: Some("Augusta".into()),
            },
            // Older sighting must lose to the newer one
            Observation {
                species_code: "amecro".into(),
                observed_at: "2026-04-28 09:00".into(),
                lat: Some(43.6591),
                lng: Some(-70.2568),
                locality: Some("Portland".into()),
            },
            // No coordinates, ignored entirely
            Observation {
                species_code: "amecro".into(),
                observed_at: "2026-05-01 05:00".into(),
                lat: None,
                lng: None,
                locality: None,
            },
        ];
        let (store, sync) = sync_with(Arc::new(provider));

        sync.reconcile("US-ME", t0()).await.unwrap();
        let bird = store.get_bird("amecro").await.unwrap().unwrap();
        assert_eq!(bird.last_seen_lat, Some(44.3106));
        assert_eq!(
            bird.last_seen_location_id.as_deref(),
            Some("LOC_44.3106_-69.7795")
        );
        let loc = store
            .get_location("LOC_44.3106_-69.7795")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loc.locality, "Augusta");
    }

    #[tokio::test]
    async fn reupsert_preserves_location_reference() {
        let provider = Arc::new(ScriptedProvider::new(&["amecro"]));
        let (store, sync) = sync_with(provider);
        sync.reconcile("US-ME", t0()).await.unwrap();
        store
            .set_bird_location("amecro", "LOC_44.0000_-69.0000")
            .await
            .unwrap();

        // Next pass has no observations, so the patch loop does not run;
        // the upsert alone must not clear the reference
        sync.reconcile("US-ME", t0() + ChronoDuration::days(4))
            .await
            .unwrap();
        let bird = store.get_bird("amecro").await.unwrap().unwrap();
        assert_eq!(
            bird.last_seen_location_id.as_deref(),
            Some("LOC_44.0000_-69.0000")
        );
    }
}
