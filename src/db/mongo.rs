//! MongoDB datastore
//!
//! Production implementation of [`Datastore`]. Account read-modify-write
//! uses revision-filtered replaces; the reconciliation batch runs inside a
//! multi-document transaction so removals and upserts land together.

use async_trait::async_trait;
use bson::{doc, Document};
use futures_util::TryStreamExt;
use mongodb::{Client, Collection, Database};
use tracing::info;

use crate::db::schemas::{
    AccountDocument, BirdRecord, CatalogMarker, CollectionEntry, FactSheet,
    IdentificationRecord, LocationRecord, MediaAttachment, RegulatoryFactSheet, ThreadDoc,
};
use crate::db::store::Datastore;
use crate::types::{Result, RookeryError};

fn db_err(context: &str, e: impl std::fmt::Display) -> RookeryError {
    RookeryError::Database(format!("{context}: {e}"))
}

/// MongoDB-backed datastore
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect and verify with a ping
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Bounded server selection avoids hanging on an unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        } else {
            format!("{uri}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| db_err("failed to connect to MongoDB", e))?;

        let db = client.database(db_name);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| db_err("MongoDB ping failed", e))?;

        info!("Connected to MongoDB database '{}'", db_name);
        Ok(Self { client, db })
    }

    fn accounts(&self) -> Collection<AccountDocument> {
        self.db.collection("accounts")
    }

    fn birds(&self) -> Collection<BirdRecord> {
        self.db.collection("birds")
    }

    fn fact_sheets(&self) -> Collection<FactSheet> {
        self.db.collection("bird_facts")
    }

    fn regulatory_sheets(&self) -> Collection<RegulatoryFactSheet> {
        self.db.collection("regulatory_facts")
    }

    fn locations(&self) -> Collection<LocationRecord> {
        self.db.collection("locations")
    }

    fn markers(&self) -> Collection<CatalogMarker> {
        self.db.collection("catalog_markers")
    }

    fn entries(&self) -> Collection<CollectionEntry> {
        self.db.collection("collection_entries")
    }

    fn media(&self) -> Collection<MediaAttachment> {
        self.db.collection("media")
    }

    fn identifications(&self) -> Collection<IdentificationRecord> {
        self.db.collection("identifications")
    }

    fn threads(&self) -> Collection<ThreadDoc> {
        self.db.collection("threads")
    }

    /// Serialize a document and strip `_id` so it can go into `$set`
    fn set_fields<T: serde::Serialize>(value: &T) -> Result<Document> {
        let mut fields =
            bson::to_document(value).map_err(|e| db_err("serialization failed", e))?;
        fields.remove("_id");
        Ok(fields)
    }
}

#[async_trait]
impl Datastore for MongoStore {
    async fn get_account(&self, id: &str) -> Result<Option<AccountDocument>> {
        self.accounts()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("account lookup failed", e))
    }

    async fn insert_account(&self, account: AccountDocument) -> Result<bool> {
        let id = account.id.clone();
        let on_insert = Self::set_fields(&account)?;
        let result = self
            .accounts()
            .update_one(doc! { "_id": &id }, doc! { "$setOnInsert": on_insert })
            .upsert(true)
            .await
            .map_err(|e| db_err("account provisioning failed", e))?;
        Ok(result.upserted_id.is_some())
    }

    async fn replace_account(
        &self,
        account: AccountDocument,
        expected_revision: u64,
    ) -> Result<bool> {
        let filter = doc! { "_id": &account.id, "revision": expected_revision as i64 };
        let result = self
            .accounts()
            .replace_one(filter, &account)
            .await
            .map_err(|e| db_err("account replace failed", e))?;
        Ok(result.matched_count == 1)
    }

    async fn delete_account(&self, id: &str) -> Result<bool> {
        let result = self
            .accounts()
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("account delete failed", e))?;
        Ok(result.deleted_count == 1)
    }

    async fn get_bird(&self, id: &str) -> Result<Option<BirdRecord>> {
        self.birds()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("bird lookup failed", e))
    }

    async fn find_bird_by_names(
        &self,
        common_name: &str,
        scientific_name: &str,
    ) -> Result<Option<BirdRecord>> {
        self.birds()
            .find_one(doc! { "common_name": common_name, "scientific_name": scientific_name })
            .await
            .map_err(|e| db_err("bird name lookup failed", e))
    }

    async fn list_birds(&self, ids: &[String]) -> Result<Vec<BirdRecord>> {
        let cursor = self
            .birds()
            .find(doc! { "_id": { "$in": ids } })
            .await
            .map_err(|e| db_err("bird listing failed", e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| db_err("bird cursor failed", e))
    }

    async fn apply_catalog_batch(
        &self,
        upserts: &[BirdRecord],
        removed_ids: &[String],
    ) -> Result<()> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(|e| db_err("session start failed", e))?;
        session
            .start_transaction()
            .await
            .map_err(|e| db_err("transaction start failed", e))?;

        if !removed_ids.is_empty() {
            let filter = doc! { "_id": { "$in": removed_ids } };
            self.birds()
                .delete_many(filter.clone())
                .session(&mut session)
                .await
                .map_err(|e| db_err("catalog removal failed", e))?;
            self.fact_sheets()
                .delete_many(filter.clone())
                .session(&mut session)
                .await
                .map_err(|e| db_err("fact sheet removal failed", e))?;
            self.regulatory_sheets()
                .delete_many(filter)
                .session(&mut session)
                .await
                .map_err(|e| db_err("regulatory sheet removal failed", e))?;
        }

        for record in upserts {
            // Core fields only: an existing location reference is patched
            // after the batch and must not be clobbered here.
            let mut fields = Self::set_fields(record)?;
            fields.remove("last_seen_location_id");
            self.birds()
                .update_one(
                    doc! { "_id": &record.id },
                    doc! {
                        "$set": fields,
                        "$setOnInsert": { "last_seen_location_id": bson::Bson::Null },
                    },
                )
                .upsert(true)
                .session(&mut session)
                .await
                .map_err(|e| db_err("catalog upsert failed", e))?;
        }

        session
            .commit_transaction()
            .await
            .map_err(|e| db_err("catalog batch commit failed", e))
    }

    async fn set_bird_location(&self, bird_id: &str, location_id: &str) -> Result<()> {
        self.birds()
            .update_one(
                doc! { "_id": bird_id },
                doc! { "$set": { "last_seen_location_id": location_id } },
            )
            .await
            .map_err(|e| db_err("bird location patch failed", e))?;
        Ok(())
    }

    async fn get_marker(&self, region: &str) -> Result<Option<CatalogMarker>> {
        self.markers()
            .find_one(doc! { "_id": region })
            .await
            .map_err(|e| db_err("marker lookup failed", e))
    }

    async fn put_marker(&self, marker: CatalogMarker) -> Result<()> {
        self.markers()
            .replace_one(doc! { "_id": &marker.region }, &marker)
            .upsert(true)
            .await
            .map_err(|e| db_err("marker write failed", e))?;
        Ok(())
    }

    async fn get_fact_sheet(&self, bird_id: &str) -> Result<Option<FactSheet>> {
        self.fact_sheets()
            .find_one(doc! { "_id": bird_id })
            .await
            .map_err(|e| db_err("fact sheet lookup failed", e))
    }

    async fn upsert_fact_sheet(&self, sheet: FactSheet) -> Result<()> {
        let fields = Self::set_fields(&sheet)?;
        self.fact_sheets()
            .update_one(doc! { "_id": &sheet.bird_id }, doc! { "$set": fields })
            .upsert(true)
            .await
            .map_err(|e| db_err("fact sheet upsert failed", e))?;
        Ok(())
    }

    async fn get_regulatory_sheet(&self, bird_id: &str) -> Result<Option<RegulatoryFactSheet>> {
        self.regulatory_sheets()
            .find_one(doc! { "_id": bird_id })
            .await
            .map_err(|e| db_err("regulatory sheet lookup failed", e))
    }

    async fn upsert_regulatory_sheet(&self, sheet: RegulatoryFactSheet) -> Result<()> {
        let fields = Self::set_fields(&sheet)?;
        self.regulatory_sheets()
            .update_one(doc! { "_id": &sheet.bird_id }, doc! { "$set": fields })
            .upsert(true)
            .await
            .map_err(|e| db_err("regulatory sheet upsert failed", e))?;
        Ok(())
    }

    async fn get_location(&self, id: &str) -> Result<Option<LocationRecord>> {
        self.locations()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("location lookup failed", e))
    }

    async fn insert_location(&self, location: LocationRecord) -> Result<()> {
        let fields = Self::set_fields(&location)?;
        // Merge-style upsert: concurrent resolutions of the same point are
        // last-writer-wins by design.
        self.locations()
            .update_one(doc! { "_id": &location.id }, doc! { "$set": fields })
            .upsert(true)
            .await
            .map_err(|e| db_err("location insert failed", e))?;
        Ok(())
    }

    async fn set_location_locality(&self, id: &str, locality: &str) -> Result<()> {
        self.locations()
            .update_one(doc! { "_id": id }, doc! { "$set": { "locality": locality } })
            .await
            .map_err(|e| db_err("locality update failed", e))?;
        Ok(())
    }

    async fn insert_entry(&self, entry: CollectionEntry) -> Result<()> {
        self.entries()
            .insert_one(entry)
            .await
            .map_err(|e| db_err("entry insert failed", e))?;
        Ok(())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CollectionEntry>> {
        self.entries()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("entry lookup failed", e))
    }

    async fn delete_entry(&self, id: &str) -> Result<bool> {
        let result = self
            .entries()
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("entry delete failed", e))?;
        Ok(result.deleted_count == 1)
    }

    async fn insert_media(&self, media: MediaAttachment) -> Result<()> {
        self.media()
            .insert_one(media)
            .await
            .map_err(|e| db_err("media insert failed", e))?;
        Ok(())
    }

    async fn delete_media(&self, id: &str) -> Result<bool> {
        let result = self
            .media()
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| db_err("media delete failed", e))?;
        Ok(result.deleted_count == 1)
    }

    async fn count_entry_media(&self, entry_id: &str) -> Result<u64> {
        self.media()
            .count_documents(doc! { "entry_id": entry_id })
            .await
            .map_err(|e| db_err("media count failed", e))
    }

    async fn insert_identification(&self, record: IdentificationRecord) -> Result<()> {
        self.identifications()
            .insert_one(record)
            .await
            .map_err(|e| db_err("identification insert failed", e))?;
        Ok(())
    }

    async fn purge_owned(&self, collection: &str, owner_id: &str) -> Result<u64> {
        let result = self
            .db
            .collection::<Document>(collection)
            .delete_many(doc! { "owner_id": owner_id })
            .await
            .map_err(|e| db_err("owner purge failed", e))?;
        Ok(result.deleted_count)
    }

    async fn owned_thread_ids(&self, owner_id: &str) -> Result<Vec<String>> {
        let cursor = self
            .threads()
            .find(doc! { "owner_id": owner_id })
            .await
            .map_err(|e| db_err("thread listing failed", e))?;
        let threads: Vec<ThreadDoc> = cursor
            .try_collect()
            .await
            .map_err(|e| db_err("thread cursor failed", e))?;
        Ok(threads.into_iter().map(|t| t.id).collect())
    }

    async fn purge_thread(&self, thread_id: &str) -> Result<u64> {
        let replies = self
            .db
            .collection::<Document>("thread_replies")
            .delete_many(doc! { "thread_id": thread_id })
            .await
            .map_err(|e| db_err("thread reply purge failed", e))?;
        let thread = self
            .threads()
            .delete_one(doc! { "_id": thread_id })
            .await
            .map_err(|e| db_err("thread delete failed", e))?;
        Ok(replies.deleted_count + thread.deleted_count)
    }
}
