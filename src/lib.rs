//! Rookery - regional bird catalog and identification service
//!
//! Core services: catalog synchronization against the observation provider,
//! AI fact sheets with a store-backed cache, photo identification with
//! per-account quotas, account lifecycle, and summary aggregates kept in
//! step through domain events.

pub mod aggregates;
pub mod catalog;
pub mod config;
pub mod db;
pub mod events;
pub mod facts;
pub mod identify;
pub mod lifecycle;
pub mod location;
pub mod quota;
pub mod remote;
pub mod routes;
pub mod server;
pub mod types;
