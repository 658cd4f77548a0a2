//! Domain event dispatch
//!
//! A single mpsc channel carries lifecycle and collection events to a
//! background dispatcher task. Handlers keep summary aggregates and cascade
//! state in step with the primary writes; a handler failure is logged and
//! dropped, never propagated back to the publisher.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregates;
use crate::db::Datastore;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    EntryLogged {
        account_id: String,
        entry_id: String,
    },
    EntryDeleted {
        account_id: String,
        points_earned: i64,
        was_duplicate: bool,
    },
    MediaDeleted {
        account_id: String,
        entry_id: String,
    },
    AccountCreated {
        account_id: String,
    },
    AccountDeleted {
        account_id: String,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::EntryLogged { .. } => "entry_logged",
            DomainEvent::EntryDeleted { .. } => "entry_deleted",
            DomainEvent::MediaDeleted { .. } => "media_deleted",
            DomainEvent::AccountCreated { .. } => "account_created",
            DomainEvent::AccountDeleted { .. } => "account_deleted",
        }
    }
}

/// Cloneable publisher handle
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<DomainEvent>,
}

impl EventBus {
    /// Publish an event. A full or closed channel drops the event with an
    /// error log; publishers never block on the dispatcher.
    pub fn publish(&self, event: DomainEvent) {
        let kind = event.kind();
        if let Err(e) = self.tx.try_send(event) {
            error!(kind, error = %e, "dropping domain event");
        }
    }
}

/// Create the bus and spawn its dispatcher task.
pub fn spawn_dispatcher(store: Arc<dyn Datastore>) -> (EventBus, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DomainEvent>(256);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let kind = event.kind();
            if let Err(e) = handle_event(store.as_ref(), event).await {
                error!(kind, error = %e, "event handler failed");
            }
        }
        info!("event dispatcher stopped");
    });
    (EventBus { tx }, handle)
}

async fn handle_event(store: &dyn Datastore, event: DomainEvent) -> crate::types::Result<()> {
    match event {
        DomainEvent::EntryLogged {
            account_id,
            entry_id,
        } => aggregates::entry_logged(store, &account_id, &entry_id).await,
        DomainEvent::EntryDeleted {
            account_id,
            points_earned,
            was_duplicate,
        } => aggregates::entry_deleted(store, &account_id, points_earned, was_duplicate).await,
        DomainEvent::MediaDeleted {
            account_id,
            entry_id,
        } => aggregates::media_deleted(store, &account_id, &entry_id).await,
        DomainEvent::AccountCreated { account_id } => {
            info!(account_id, "account provisioned");
            Ok(())
        }
        DomainEvent::AccountDeleted { account_id } => {
            info!(account_id, "account retired");
            Ok(())
        }
    }
}
