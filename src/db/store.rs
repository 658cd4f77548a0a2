//! Datastore abstraction
//!
//! One async trait over the document store so every core component runs
//! against MongoDB in production and the in-memory store in dev mode and
//! tests. Same-account read-modify-write sequences go through
//! [`with_account`], an optimistic revision-checked replace loop; the
//! datastore, not in-process locks, arbitrates concurrent invocations.

use async_trait::async_trait;
use tracing::debug;

use crate::db::schemas::{
    AccountDocument, BirdRecord, CatalogMarker, CollectionEntry, FactSheet,
    IdentificationRecord, LocationRecord, MediaAttachment, RegulatoryFactSheet,
};
use crate::types::{Result, RookeryError};

/// Upper bound on CAS retries before giving up on a contended account
const MAX_TXN_ATTEMPTS: u32 = 8;

#[async_trait]
pub trait Datastore: Send + Sync {
    // -- accounts ------------------------------------------------------------

    async fn get_account(&self, id: &str) -> Result<Option<AccountDocument>>;

    /// Insert only if no document exists for this id. Returns `false` when
    /// the account was already present (idempotent provisioning).
    async fn insert_account(&self, account: AccountDocument) -> Result<bool>;

    /// Replace the account document only if its stored revision still equals
    /// `expected_revision`. Returns `false` on a lost race.
    async fn replace_account(
        &self,
        account: AccountDocument,
        expected_revision: u64,
    ) -> Result<bool>;

    async fn delete_account(&self, id: &str) -> Result<bool>;

    // -- catalog records -----------------------------------------------------

    async fn get_bird(&self, id: &str) -> Result<Option<BirdRecord>>;

    async fn find_bird_by_names(
        &self,
        common_name: &str,
        scientific_name: &str,
    ) -> Result<Option<BirdRecord>>;

    async fn list_birds(&self, ids: &[String]) -> Result<Vec<BirdRecord>>;

    /// Atomic reconciliation batch: delete removed records (and both of
    /// their fact sheets), then upsert current records writing core fields
    /// only; an existing `last_seen_location_id` survives the upsert.
    async fn apply_catalog_batch(
        &self,
        upserts: &[BirdRecord],
        removed_ids: &[String],
    ) -> Result<()>;

    /// Patch a single record's location reference (post-batch, idempotent)
    async fn set_bird_location(&self, bird_id: &str, location_id: &str) -> Result<()>;

    // -- staleness marker ----------------------------------------------------

    async fn get_marker(&self, region: &str) -> Result<Option<CatalogMarker>>;
    async fn put_marker(&self, marker: CatalogMarker) -> Result<()>;

    // -- fact sheets ---------------------------------------------------------

    async fn get_fact_sheet(&self, bird_id: &str) -> Result<Option<FactSheet>>;
    async fn upsert_fact_sheet(&self, sheet: FactSheet) -> Result<()>;
    async fn get_regulatory_sheet(&self, bird_id: &str) -> Result<Option<RegulatoryFactSheet>>;
    async fn upsert_regulatory_sheet(&self, sheet: RegulatoryFactSheet) -> Result<()>;

    // -- locations -----------------------------------------------------------

    async fn get_location(&self, id: &str) -> Result<Option<LocationRecord>>;
    async fn insert_location(&self, location: LocationRecord) -> Result<()>;
    async fn set_location_locality(&self, id: &str, locality: &str) -> Result<()>;

    // -- collection entries, media, identifications --------------------------

    async fn insert_entry(&self, entry: CollectionEntry) -> Result<()>;
    async fn get_entry(&self, id: &str) -> Result<Option<CollectionEntry>>;
    async fn delete_entry(&self, id: &str) -> Result<bool>;

    async fn insert_media(&self, media: MediaAttachment) -> Result<()>;
    async fn delete_media(&self, id: &str) -> Result<bool>;
    /// Remaining attachments referencing an entry (cascade detection)
    async fn count_entry_media(&self, entry_id: &str) -> Result<u64>;

    async fn insert_identification(&self, record: IdentificationRecord) -> Result<()>;

    // -- account retirement --------------------------------------------------

    /// Delete every document in `collection` owned by `owner_id`.
    /// Returns the number of documents removed.
    async fn purge_owned(&self, collection: &str, owner_id: &str) -> Result<u64>;

    /// Thread ids owned by an account (first level of the two-level cascade)
    async fn owned_thread_ids(&self, owner_id: &str) -> Result<Vec<String>>;

    /// Delete a thread and its nested replies. Returns documents removed.
    async fn purge_thread(&self, thread_id: &str) -> Result<u64>;
}

/// Outcome of a transactional closure: commit the mutation, or report a
/// result without writing anything (e.g. quota exhaustion).
pub enum Apply<T> {
    Write(T),
    Skip(T),
}

/// Run a read-modify-write sequence against one account atomically.
///
/// Reads the current document, applies `f`, and commits with a
/// revision-checked replace; a lost race re-reads and re-applies. Returns
/// `Ok(None)` when the account does not exist.
pub async fn with_account<T, F>(
    store: &dyn Datastore,
    account_id: &str,
    f: F,
) -> Result<Option<T>>
where
    F: Fn(&mut AccountDocument) -> Apply<T>,
{
    for attempt in 1..=MAX_TXN_ATTEMPTS {
        let mut account = match store.get_account(account_id).await? {
            Some(a) => a,
            None => return Ok(None),
        };
        let expected = account.revision;

        match f(&mut account) {
            Apply::Skip(value) => return Ok(Some(value)),
            Apply::Write(value) => {
                account.revision = expected + 1;
                if store.replace_account(account, expected).await? {
                    return Ok(Some(value));
                }
                debug!(
                    account_id = %account_id,
                    attempt,
                    "account replace lost a revision race, retrying"
                );
            }
        }
    }

    Err(RookeryError::Database(format!(
        "account {account_id} transaction contended beyond {MAX_TXN_ATTEMPTS} attempts"
    )))
}
