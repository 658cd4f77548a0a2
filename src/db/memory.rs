//! In-memory datastore
//!
//! Backs dev mode (no MongoDB required) and unit tests. A single mutex
//! around the collection maps gives the same atomicity the MongoDB impl
//! gets from revision-checked replaces and batched writes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::schemas::{
    AccountDocument, BirdRecord, CatalogMarker, CollectionEntry, FactSheet,
    IdentificationRecord, LocationRecord, MediaAttachment, RegulatoryFactSheet,
};
use crate::db::store::Datastore;
use crate::types::{Result, RookeryError};

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, AccountDocument>,
    birds: HashMap<String, BirdRecord>,
    fact_sheets: HashMap<String, FactSheet>,
    regulatory_sheets: HashMap<String, RegulatoryFactSheet>,
    locations: HashMap<String, LocationRecord>,
    markers: HashMap<String, CatalogMarker>,
    entries: HashMap<String, CollectionEntry>,
    media: HashMap<String, MediaAttachment>,
    identifications: HashMap<String, IdentificationRecord>,
    /// Arbitrary owner-scoped collections (bird_cards, collection_slots, ...)
    owned: HashMap<String, HashMap<String, String>>,
    /// thread id -> owner id
    threads: HashMap<String, String>,
    /// thread id -> reply ids
    thread_replies: HashMap<String, Vec<String>>,
}

/// Memory-only datastore
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panicked test thread; propagating the
        // inner state is still safe for reads and writes here.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a document into an arbitrary owner-scoped collection
    pub fn seed_owned(&self, collection: &str, doc_id: &str, owner_id: &str) {
        self.lock()
            .owned
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), owner_id.to_string());
    }

    /// Seed a forum thread with its replies
    pub fn seed_thread(&self, thread_id: &str, owner_id: &str, reply_ids: &[&str]) {
        let mut inner = self.lock();
        inner.threads.insert(thread_id.to_string(), owner_id.to_string());
        inner.thread_replies.insert(
            thread_id.to_string(),
            reply_ids.iter().map(|r| r.to_string()).collect(),
        );
    }

    /// Remaining documents a given owner holds in an arbitrary collection
    pub fn owned_count(&self, collection: &str, owner_id: &str) -> usize {
        self.lock()
            .owned
            .get(collection)
            .map(|docs| docs.values().filter(|owner| *owner == owner_id).count())
            .unwrap_or(0)
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn get_account(&self, id: &str) -> Result<Option<AccountDocument>> {
        Ok(self.lock().accounts.get(id).cloned())
    }

    async fn insert_account(&self, account: AccountDocument) -> Result<bool> {
        let mut inner = self.lock();
        if inner.accounts.contains_key(&account.id) {
            return Ok(false);
        }
        inner.accounts.insert(account.id.clone(), account);
        Ok(true)
    }

    async fn replace_account(
        &self,
        account: AccountDocument,
        expected_revision: u64,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.accounts.get(&account.id) {
            Some(current) if current.revision == expected_revision => {
                inner.accounts.insert(account.id.clone(), account);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RookeryError::Database(format!(
                "account {} vanished mid-transaction",
                account.id
            ))),
        }
    }

    async fn delete_account(&self, id: &str) -> Result<bool> {
        Ok(self.lock().accounts.remove(id).is_some())
    }

    async fn get_bird(&self, id: &str) -> Result<Option<BirdRecord>> {
        Ok(self.lock().birds.get(id).cloned())
    }

    async fn find_bird_by_names(
        &self,
        common_name: &str,
        scientific_name: &str,
    ) -> Result<Option<BirdRecord>> {
        Ok(self
            .lock()
            .birds
            .values()
            .find(|b| b.common_name == common_name && b.scientific_name == scientific_name)
            .cloned())
    }

    async fn list_birds(&self, ids: &[String]) -> Result<Vec<BirdRecord>> {
        let inner = self.lock();
        Ok(ids.iter().filter_map(|id| inner.birds.get(id).cloned()).collect())
    }

    async fn apply_catalog_batch(
        &self,
        upserts: &[BirdRecord],
        removed_ids: &[String],
    ) -> Result<()> {
        let mut inner = self.lock();
        for id in removed_ids {
            inner.birds.remove(id);
            inner.fact_sheets.remove(id);
            inner.regulatory_sheets.remove(id);
        }
        for record in upserts {
            let mut record = record.clone();
            // Core fields only: the location reference is resolved after the
            // batch and must survive the overwrite.
            if let Some(existing) = inner.birds.get(&record.id) {
                record.last_seen_location_id = existing.last_seen_location_id.clone();
            }
            inner.birds.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn set_bird_location(&self, bird_id: &str, location_id: &str) -> Result<()> {
        if let Some(bird) = self.lock().birds.get_mut(bird_id) {
            bird.last_seen_location_id = Some(location_id.to_string());
        }
        Ok(())
    }

    async fn get_marker(&self, region: &str) -> Result<Option<CatalogMarker>> {
        Ok(self.lock().markers.get(region).cloned())
    }

    async fn put_marker(&self, marker: CatalogMarker) -> Result<()> {
        self.lock().markers.insert(marker.region.clone(), marker);
        Ok(())
    }

    async fn get_fact_sheet(&self, bird_id: &str) -> Result<Option<FactSheet>> {
        Ok(self.lock().fact_sheets.get(bird_id).cloned())
    }

    async fn upsert_fact_sheet(&self, sheet: FactSheet) -> Result<()> {
        self.lock().fact_sheets.insert(sheet.bird_id.clone(), sheet);
        Ok(())
    }

    async fn get_regulatory_sheet(&self, bird_id: &str) -> Result<Option<RegulatoryFactSheet>> {
        Ok(self.lock().regulatory_sheets.get(bird_id).cloned())
    }

    async fn upsert_regulatory_sheet(&self, sheet: RegulatoryFactSheet) -> Result<()> {
        self.lock()
            .regulatory_sheets
            .insert(sheet.bird_id.clone(), sheet);
        Ok(())
    }

    async fn get_location(&self, id: &str) -> Result<Option<LocationRecord>> {
        Ok(self.lock().locations.get(id).cloned())
    }

    async fn insert_location(&self, location: LocationRecord) -> Result<()> {
        self.lock().locations.insert(location.id.clone(), location);
        Ok(())
    }

    async fn set_location_locality(&self, id: &str, locality: &str) -> Result<()> {
        if let Some(location) = self.lock().locations.get_mut(id) {
            location.locality = locality.to_string();
        }
        Ok(())
    }

    async fn insert_entry(&self, entry: CollectionEntry) -> Result<()> {
        self.lock().entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CollectionEntry>> {
        Ok(self.lock().entries.get(id).cloned())
    }

    async fn delete_entry(&self, id: &str) -> Result<bool> {
        Ok(self.lock().entries.remove(id).is_some())
    }

    async fn insert_media(&self, media: MediaAttachment) -> Result<()> {
        self.lock().media.insert(media.id.clone(), media);
        Ok(())
    }

    async fn delete_media(&self, id: &str) -> Result<bool> {
        Ok(self.lock().media.remove(id).is_some())
    }

    async fn count_entry_media(&self, entry_id: &str) -> Result<u64> {
        Ok(self
            .lock()
            .media
            .values()
            .filter(|m| m.entry_id == entry_id)
            .count() as u64)
    }

    async fn insert_identification(&self, record: IdentificationRecord) -> Result<()> {
        self.lock().identifications.insert(record.id.clone(), record);
        Ok(())
    }

    async fn purge_owned(&self, collection: &str, owner_id: &str) -> Result<u64> {
        let mut inner = self.lock();
        let removed = match collection {
            "collection_entries" => {
                let before = inner.entries.len();
                inner.entries.retain(|_, e| e.owner_id != owner_id);
                before - inner.entries.len()
            }
            "media" => {
                let before = inner.media.len();
                inner.media.retain(|_, m| m.owner_id != owner_id);
                before - inner.media.len()
            }
            "identifications" => {
                let before = inner.identifications.len();
                inner.identifications.retain(|_, i| i.owner_id != owner_id);
                before - inner.identifications.len()
            }
            other => match inner.owned.get_mut(other) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|_, owner| owner != owner_id);
                    before - docs.len()
                }
                None => 0,
            },
        };
        Ok(removed as u64)
    }

    async fn owned_thread_ids(&self, owner_id: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .threads
            .iter()
            .filter(|(_, owner)| owner.as_str() == owner_id)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn purge_thread(&self, thread_id: &str) -> Result<u64> {
        let mut inner = self.lock();
        let replies = inner
            .thread_replies
            .remove(thread_id)
            .map(|r| r.len() as u64)
            .unwrap_or(0);
        let thread = u64::from(inner.threads.remove(thread_id).is_some());
        Ok(replies + thread)
    }
}
