//! Account summary aggregates
//!
//! Keeps the per-account totals (entries, duplicates, points) in step with
//! collection writes, and runs the media-to-entry cascade. Every mutation
//! goes through the revision-checked account loop; aggregates never drop
//! below zero even when deletions replay.

use tracing::warn;

use crate::db::{with_account, Apply, Datastore};
use crate::types::Result;

/// A new entry landed: bump totals by what the entry recorded.
pub async fn entry_logged(store: &dyn Datastore, account_id: &str, entry_id: &str) -> Result<()> {
    let Some(entry) = store.get_entry(entry_id).await? else {
        warn!(account_id, entry_id, "entry vanished before aggregation");
        return Ok(());
    };

    let applied = with_account(store, account_id, |account| {
        account.total_entries += 1;
        if entry.is_duplicate {
            account.duplicate_entries += 1;
        }
        account.total_points = (account.total_points + entry.points_earned).max(0);
        Apply::Write(())
    })
    .await?;

    if applied.is_none() {
        warn!(account_id, entry_id, "no account for logged entry");
    }
    Ok(())
}

/// An entry was removed: reverse its contribution, clamping at zero.
pub async fn entry_deleted(
    store: &dyn Datastore,
    account_id: &str,
    points_earned: i64,
    was_duplicate: bool,
) -> Result<()> {
    let applied = with_account(store, account_id, |account| {
        account.total_entries = (account.total_entries - 1).max(0);
        if was_duplicate {
            account.duplicate_entries = (account.duplicate_entries - 1).max(0);
        }
        account.total_points = (account.total_points - points_earned).max(0);
        Apply::Write(())
    })
    .await?;

    if applied.is_none() {
        warn!(account_id, "no account for deleted entry");
    }
    Ok(())
}

/// A media attachment was removed. When it was the entry's last one the
/// entry itself goes too, which in turn reverses the entry's aggregates.
/// Tolerant of the entry already being gone, so replayed deletions settle
/// quietly.
pub async fn media_deleted(store: &dyn Datastore, account_id: &str, entry_id: &str) -> Result<()> {
    if store.count_entry_media(entry_id).await? > 0 {
        return Ok(());
    }

    let Some(entry) = store.get_entry(entry_id).await? else {
        return Ok(());
    };
    if store.delete_entry(entry_id).await? {
        entry_deleted(store, account_id, entry.points_earned, entry.is_duplicate).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schemas::{AccountDocument, CollectionEntry, MediaAttachment};
    use chrono::Utc;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_account(AccountDocument::fresh("u1", 25, 3, Utc::now()))
            .await
            .unwrap();
        store
    }

    fn entry(id: &str, points: i64, duplicate: bool) -> CollectionEntry {
        CollectionEntry {
            id: id.into(),
            owner_id: "u1".into(),
            bird_id: "amecro".into(),
            points_earned: points,
            is_duplicate: duplicate,
            logged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn new_entry_bumps_all_three_totals() {
        let store = seeded().await;
        store.insert_entry(entry("e1", 5, false)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 1);
        assert_eq!(account.duplicate_entries, 0);
        assert_eq!(account.total_points, 5);
    }

    #[tokio::test]
    async fn duplicate_entry_counts_separately() {
        let store = seeded().await;
        store.insert_entry(entry("e1", 0, true)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 1);
        assert_eq!(account.duplicate_entries, 1);
        assert_eq!(account.total_points, 0);
    }

    #[tokio::test]
    async fn deletion_reverses_the_logged_delta() {
        let store = seeded().await;
        store.insert_entry(entry("e1", 5, false)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();
        entry_deleted(&store, "u1", 5, false).await.unwrap();

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 0);
        assert_eq!(account.total_points, 0);
    }

    #[tokio::test]
    async fn negative_point_entries_clamp_at_zero() {
        let store = seeded().await;
        store.insert_entry(entry("e1", -10, false)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 1);
        assert_eq!(account.total_points, 0);
    }

    #[tokio::test]
    async fn aggregates_clamp_at_zero() {
        let store = seeded().await;
        entry_deleted(&store, "u1", 100, true).await.unwrap();

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 0);
        assert_eq!(account.duplicate_entries, 0);
        assert_eq!(account.total_points, 0);
    }

    #[tokio::test]
    async fn last_media_removal_cascades_to_the_entry() {
        let store = seeded().await;
        store.insert_entry(entry("e1", 5, false)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();
        store
            .insert_media(MediaAttachment {
                id: "m1".into(),
                owner_id: "u1".into(),
                entry_id: "e1".into(),
                url: "https://example.test/m1.jpg".into(),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        store.delete_media("m1").await.unwrap();
        media_deleted(&store, "u1", "e1").await.unwrap();

        assert!(store.get_entry("e1").await.unwrap().is_none());
        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 0);
        assert_eq!(account.total_points, 0);
    }

    #[tokio::test]
    async fn surviving_media_blocks_the_cascade() {
        let store = seeded().await;
        store.insert_entry(entry("e1", 5, false)).await.unwrap();
        entry_logged(&store, "u1", "e1").await.unwrap();
        for id in ["m1", "m2"] {
            store
                .insert_media(MediaAttachment {
                    id: id.into(),
                    owner_id: "u1".into(),
                    entry_id: "e1".into(),
                    url: format!("https://example.test/{id}.jpg"),
                    uploaded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        store.delete_media("m1").await.unwrap();
        media_deleted(&store, "u1", "e1").await.unwrap();

        assert!(store.get_entry("e1").await.unwrap().is_some());
        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 1);
    }

    #[tokio::test]
    async fn cascade_tolerates_an_absent_entry() {
        let store = seeded().await;
        media_deleted(&store, "u1", "gone").await.unwrap();
        let account = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(account.total_entries, 0);
    }

    #[tokio::test]
    async fn missing_account_is_a_noop() {
        let store = MemoryStore::new();
        store.insert_entry(entry("e1", 5, false)).await.unwrap();
        entry_logged(&store, "ghost", "e1").await.unwrap();
        entry_deleted(&store, "ghost", 5, false).await.unwrap();
    }
}
