//! Account provisioning and retirement
//!
//! Mirrors identity-provider lifecycle into the datastore. Provisioning is
//! idempotent: a second signal for the same subject changes nothing.
//! Retirement cascades through every owned collection, including the
//! two-level thread purge, before the account document itself goes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::AccountDocument;
use crate::db::Datastore;
use crate::events::{DomainEvent, EventBus};
use crate::quota::Capability;
use crate::types::Result;

/// Flat collections purged by `owner_id` on retirement
const OWNED_COLLECTIONS: &[&str] = &[
    "collection_entries",
    "media",
    "bird_cards",
    "identifications",
    "collection_slots",
];

pub struct LifecycleService {
    store: Arc<dyn Datastore>,
    events: EventBus,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetirementReport {
    pub documents_removed: u64,
    pub threads_removed: u64,
    pub account_removed: bool,
}

impl LifecycleService {
    pub fn new(store: Arc<dyn Datastore>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Create the account document for a new subject. Returns `true` when a
    /// document was created, `false` when one already existed.
    pub async fn provision(&self, account_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let account = AccountDocument::fresh(
            account_id,
            Capability::Identification.max_uses(),
            Capability::AvatarChange.max_uses(),
            now,
        );
        let created = self.store.insert_account(account).await?;
        if created {
            info!(account_id, "provisioned account");
            self.events.publish(DomainEvent::AccountCreated {
                account_id: account_id.to_string(),
            });
        } else {
            info!(account_id, "account already provisioned, no-op");
        }
        Ok(created)
    }

    /// Remove everything the subject owns, then the account document.
    /// Safe to replay: each step tolerates the data already being gone.
    pub async fn retire(&self, account_id: &str) -> Result<RetirementReport> {
        let mut report = RetirementReport::default();

        for collection in OWNED_COLLECTIONS {
            let removed = self.store.purge_owned(collection, account_id).await?;
            report.documents_removed += removed;
            if removed > 0 {
                info!(account_id, collection, removed, "purged owned documents");
            }
        }

        // Threads nest their replies, so each owned thread purges as a unit
        for thread_id in self.store.owned_thread_ids(account_id).await? {
            report.threads_removed += 1;
            report.documents_removed += self.store.purge_thread(&thread_id).await?;
        }

        report.account_removed = self.store.delete_account(account_id).await?;
        if report.account_removed {
            info!(
                account_id,
                documents = report.documents_removed,
                threads = report.threads_removed,
                "retired account"
            );
            self.events.publish(DomainEvent::AccountDeleted {
                account_id: account_id.to_string(),
            });
        } else {
            warn!(account_id, "retirement for unknown account, cascade still ran");
        }
        Ok(report)
    }
}
