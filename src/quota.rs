//! Rolling-window usage quotas
//!
//! Each capability carries a per-account cooldown window: a fixed number of
//! uses that replenishes a full window length after the first use of the
//! cycle. Windows reset lazily, on the next access after expiry, so an idle
//! account costs nothing.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::debug;

use crate::db::schemas::CooldownWindow;
use crate::db::{with_account, Apply, Datastore};
use crate::types::{Result, RookeryError};

const WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Identification,
    AvatarChange,
}

impl Capability {
    pub fn max_uses(&self) -> i64 {
        match self {
            Capability::Identification => 25,
            Capability::AvatarChange => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Identification => "identification",
            Capability::AvatarChange => "avatar_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "identification" => Some(Capability::Identification),
            "avatar_change" => Some(Capability::AvatarChange),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining_after: i64,
    /// Time until the window replenishes, present only when denied
    pub retry_after: Option<Duration>,
}

fn window_expired(window: &CooldownWindow, now: DateTime<Utc>) -> bool {
    match window.reset_at {
        Some(reset_at) => {
            now.signed_duration_since(reset_at)
                >= ChronoDuration::from_std(WINDOW).unwrap_or(ChronoDuration::zero())
        }
        None => false,
    }
}

/// Evaluate one window in place. Returns the decision; mutates the window
/// only when a use is granted.
fn evaluate(window: &mut CooldownWindow, max: i64, now: DateTime<Utc>) -> QuotaDecision {
    if window_expired(window, now) {
        window.remaining = max;
        window.reset_at = None;
    }

    if window.remaining <= 0 {
        let retry_after = window
            .reset_at
            .map(|reset_at| {
                let replenish = reset_at + ChronoDuration::from_std(WINDOW).unwrap_or(ChronoDuration::zero());
                replenish
                    .signed_duration_since(now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(Duration::ZERO);
        return QuotaDecision {
            allowed: false,
            remaining_after: 0,
            retry_after: Some(retry_after),
        };
    }

    // First use of a fresh cycle anchors the window
    if window.remaining == max {
        window.reset_at = Some(now);
    }
    window.remaining -= 1;
    QuotaDecision {
        allowed: true,
        remaining_after: window.remaining,
        retry_after: None,
    }
}

/// Atomically spend one use of `capability` for `account_id`. Exhausted
/// windows are read without writing anything back.
pub async fn try_consume(
    store: &dyn Datastore,
    account_id: &str,
    capability: Capability,
    now: DateTime<Utc>,
) -> Result<QuotaDecision> {
    let max = capability.max_uses();
    let decision = with_account(store, account_id, |account| {
        let window = match capability {
            Capability::Identification => &mut account.identification_quota,
            Capability::AvatarChange => &mut account.avatar_quota,
        };
        let decision = evaluate(window, max, now);
        if decision.allowed {
            Apply::Write(decision)
        } else {
            Apply::Skip(decision)
        }
    })
    .await?
    .ok_or_else(|| RookeryError::NotFound(format!("account {account_id}")))?;

    debug!(
        account_id,
        capability = capability.as_str(),
        allowed = decision.allowed,
        remaining = decision.remaining_after,
        "quota decision"
    );
    Ok(decision)
}

/// Read-only view of the current window state, applying lazy reset to the
/// reported numbers without persisting it.
pub async fn peek(
    store: &dyn Datastore,
    account_id: &str,
    capability: Capability,
    now: DateTime<Utc>,
) -> Result<QuotaDecision> {
    let account = store
        .get_account(account_id)
        .await?
        .ok_or_else(|| RookeryError::NotFound(format!("account {account_id}")))?;
    let mut window = match capability {
        Capability::Identification => account.identification_quota,
        Capability::AvatarChange => account.avatar_quota,
    };
    let max = capability.max_uses();
    if window_expired(&window, now) {
        window.remaining = max;
        window.reset_at = None;
    }
    Ok(QuotaDecision {
        allowed: window.remaining > 0,
        remaining_after: window.remaining,
        retry_after: if window.remaining > 0 {
            None
        } else {
            window.reset_at.map(|reset_at| {
                let replenish = reset_at + ChronoDuration::from_std(WINDOW).unwrap_or(ChronoDuration::zero());
                replenish
                    .signed_duration_since(now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schemas::AccountDocument;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn store_with_account() -> MemoryStore {
        let store = MemoryStore::new();
        let account = AccountDocument::fresh(
            "acct-1",
            Capability::Identification.max_uses(),
            Capability::AvatarChange.max_uses(),
            t0(),
        );
        store.insert_account(account).await.unwrap();
        store
    }

    #[tokio::test]
    async fn full_cycle_consume_deny_replenish() {
        let store = store_with_account().await;
        let now = t0();
        let max = Capability::AvatarChange.max_uses();

        for i in 0..max {
            let d = try_consume(&store, "acct-1", Capability::AvatarChange, now)
                .await
                .unwrap();
            assert!(d.allowed, "use {} should be granted", i + 1);
            assert_eq!(d.remaining_after, max - 1 - i);
        }

        // N+1 within the window is denied and points at the replenish time
        let denied = try_consume(&store, "acct-1", Capability::AvatarChange, now)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_after, 0);
        assert_eq!(denied.retry_after, Some(WINDOW));

        // After the window elapses the full allotment is back
        let later = now + ChronoDuration::hours(24);
        let d = try_consume(&store, "acct-1", Capability::AvatarChange, later)
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining_after, max - 1);
    }

    #[tokio::test]
    async fn window_anchors_on_first_use() {
        let store = store_with_account().await;
        let now = t0();

        try_consume(&store, "acct-1", Capability::Identification, now)
            .await
            .unwrap();
        let account = store.get_account("acct-1").await.unwrap().unwrap();
        assert_eq!(account.identification_quota.reset_at, Some(now));

        // Second use does not move the anchor
        let later = now + ChronoDuration::hours(5);
        try_consume(&store, "acct-1", Capability::Identification, later)
            .await
            .unwrap();
        let account = store.get_account("acct-1").await.unwrap().unwrap();
        assert_eq!(account.identification_quota.reset_at, Some(now));
    }

    #[tokio::test]
    async fn denied_path_writes_nothing() {
        let store = store_with_account().await;
        let now = t0();
        for _ in 0..3 {
            try_consume(&store, "acct-1", Capability::AvatarChange, now)
                .await
                .unwrap();
        }
        let before = store.get_account("acct-1").await.unwrap().unwrap();
        let denied = try_consume(&store, "acct-1", Capability::AvatarChange, now)
            .await
            .unwrap();
        assert!(!denied.allowed);
        let after = store.get_account("acct-1").await.unwrap().unwrap();
        assert_eq!(before.revision, after.revision);
    }

    #[tokio::test]
    async fn retry_after_shrinks_as_window_ages() {
        let store = store_with_account().await;
        let now = t0();
        for _ in 0..3 {
            try_consume(&store, "acct-1", Capability::AvatarChange, now)
                .await
                .unwrap();
        }
        let later = now + ChronoDuration::hours(10);
        let denied = try_consume(&store, "acct-1", Capability::AvatarChange, later)
            .await
            .unwrap();
        assert_eq!(denied.retry_after, Some(Duration::from_secs(14 * 3600)));
    }

    #[tokio::test]
    async fn peek_does_not_spend() {
        let store = store_with_account().await;
        let view = peek(&store, "acct-1", Capability::Identification, t0())
            .await
            .unwrap();
        assert!(view.allowed);
        assert_eq!(view.remaining_after, 25);
        let again = peek(&store, "acct-1", Capability::Identification, t0())
            .await
            .unwrap();
        assert_eq!(again.remaining_after, 25);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let store = MemoryStore::new();
        let err = try_consume(&store, "ghost", Capability::Identification, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, RookeryError::NotFound(_)));
    }
}
