//! Canonical location resolution
//!
//! Coordinates round to 4 decimal places and derive a deterministic id, so
//! every resolution of the same point lands on the same document. Locality
//! labels are last-writer-wins; coordinates never change once written.

use tracing::debug;

use crate::db::schemas::LocationRecord;
use crate::db::Datastore;
use crate::types::{Result, RookeryError};

/// Deterministic id for a coordinate pair
pub fn location_id(lat: f64, lng: f64) -> String {
    format!("LOC_{lat:.4}_{lng:.4}")
}

fn default_label(lat: f64, lng: f64) -> String {
    format!("Lat: {lat:.4}, Lng: {lng:.4}")
}

pub fn validate_coordinates(lat: f64, lng: f64) -> Result<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(RookeryError::InvalidArgument(format!(
            "latitude {lat} out of range"
        )));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(RookeryError::InvalidArgument(format!(
            "longitude {lng} out of range"
        )));
    }
    Ok(())
}

/// Resolve a coordinate pair to its canonical location record, creating it
/// on first sight. A non-empty `locality` hint overwrites the stored label
/// when it differs; `None` or empty leaves the record untouched.
pub async fn resolve(
    store: &dyn Datastore,
    lat: f64,
    lng: f64,
    locality: Option<&str>,
) -> Result<LocationRecord> {
    validate_coordinates(lat, lng)?;
    let id = location_id(lat, lng);
    let hint = locality.map(str::trim).filter(|s| !s.is_empty());

    if let Some(mut existing) = store.get_location(&id).await? {
        if let Some(hint) = hint {
            if existing.locality != hint {
                debug!(location_id = %id, locality = hint, "updating locality label");
                store.set_location_locality(&id, hint).await?;
                existing.locality = hint.to_string();
            }
        }
        return Ok(existing);
    }

    let record = LocationRecord {
        id: id.clone(),
        latitude: (lat * 10_000.0).round() / 10_000.0,
        longitude: (lng * 10_000.0).round() / 10_000.0,
        country: String::new(),
        region: String::new(),
        locality: hint
            .map(str::to_string)
            .unwrap_or_else(|| default_label(lat, lng)),
    };
    store.insert_location(record.clone()).await?;
    debug!(location_id = %id, "created location record");
    Ok(record)
}
