//! Document schemas
//!
//! One struct per collection. Timestamps are `chrono::DateTime<Utc>` and
//! serialize through serde; identity fields map onto `_id` so upserts stay
//! idempotent across reconciliation runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Catalog record for one species in the tracked region (`birds`)
///
/// Created and overwritten by the catalog synchronizer; hard-deleted when the
/// species disappears from the latest reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirdRecord {
    /// Provider-assigned species code (stable identity)
    #[serde(rename = "_id")]
    pub id: String,
    pub common_name: String,
    pub scientific_name: String,
    pub family: String,
    pub species: String,
    pub is_endangered: bool,
    pub can_hunt: bool,
    /// Most recent regional observation, when one with valid coordinates exists
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_seen_lat: Option<f64>,
    pub last_seen_lng: Option<f64>,
    /// Resolved lazily after the catalog batch commits; preserved on upsert
    pub last_seen_location_id: Option<String>,
}

/// General AI-generated fact sheet (`bird_facts`), keyed by species code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSheet {
    #[serde(rename = "_id")]
    pub bird_id: String,
    pub generated_at: DateTime<Utc>,
    /// Free-form field/value content from the generator
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Set when generation failed terminally; the sheet is served degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Regulatory fact sheet (`regulatory_facts`), sibling of [`FactSheet`]
/// joined by the shared species code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatoryFactSheet {
    #[serde(rename = "_id")]
    pub bird_id: String,
    pub generated_at: DateTime<Utc>,
    /// Primary status field; "N/A"-style values mark the sheet incomplete
    pub legal_status: String,
    pub season: String,
    pub license_requirements: String,
    pub federal_protections: String,
    pub not_huntable_statement: String,
    pub is_endangered: String,
    pub relevant_regulations: String,
    /// Fixed link to the regional regulator
    pub agency_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegulatoryFactSheet {
    /// A sheet is complete when its primary status field carries a real
    /// answer rather than the provider's placeholder sentinel.
    pub fn is_complete(&self) -> bool {
        !self.legal_status.is_empty() && !self.legal_status.contains("N/A")
    }
}

/// Canonical location record (`locations`)
///
/// Identity is derived from coordinates rounded to 4 decimal places, so
/// repeated resolutions of the same point converge on one document. Shared
/// across catalog records and sightings; never deleted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub country: String,
    pub region: String,
    pub locality: String,
}

/// Rolling quota window embedded in [`AccountDocument`]
///
/// Invariant: `remaining == max` implies `reset_at == None`. The first
/// decrement from max stamps `reset_at`; once the window elapses the next
/// read resets to max before applying its decrement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownWindow {
    pub remaining: i64,
    pub reset_at: Option<DateTime<Utc>>,
}

impl CooldownWindow {
    pub fn full(max: i64) -> Self {
        Self {
            remaining: max,
            reset_at: None,
        }
    }
}

/// Per-account document (`accounts`), keyed by the identity provider subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDocument {
    #[serde(rename = "_id")]
    pub id: String,
    /// Optimistic concurrency token; bumped on every committed replace
    pub revision: u64,
    pub identification_quota: CooldownWindow,
    pub avatar_quota: CooldownWindow,
    /// Summary aggregates, maintained by the aggregate maintainer; never
    /// allowed below zero
    pub total_entries: i64,
    pub duplicate_entries: i64,
    pub total_points: i64,
    pub created_at: DateTime<Utc>,
}

impl AccountDocument {
    /// Freshly provisioned account: both quotas at maximum, aggregates zero
    pub fn fresh(id: impl Into<String>, ident_max: i64, avatar_max: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            identification_quota: CooldownWindow::full(ident_max),
            avatar_quota: CooldownWindow::full(avatar_max),
            total_entries: 0,
            duplicate_entries: 0,
            total_points: 0,
            created_at: now,
        }
    }
}

/// A logged collection entry (`collection_entries`)
///
/// Cascade-deleted when its last media attachment is removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_id: String,
    pub bird_id: String,
    pub points_earned: i64,
    pub is_duplicate: bool,
    pub logged_at: DateTime<Utc>,
}

/// Media attachment referencing a collection entry (`media`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_id: String,
    pub entry_id: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Append-only log of a verified identification (`identifications`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentificationRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_id: String,
    pub bird_id: String,
    pub common_name: String,
    pub scientific_name: String,
    pub family: String,
    pub species: String,
    pub location_id: String,
    pub verified: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Catalog staleness marker (`catalog_markers`), one per region
///
/// Written only after the record batch commits, so a crash mid-reconciliation
/// never marks stale data as fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMarker {
    #[serde(rename = "_id")]
    pub region: String,
    pub species_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Forum thread stub (`threads`), carrying only the ownership fields this
/// core needs for cascading account deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_id: String,
}
