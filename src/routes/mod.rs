//! HTTP routes for Rookery

pub mod api;
pub mod health;

pub use api::{
    handle_bird, handle_catalog, handle_catalog_sync, handle_event, handle_identify,
    handle_image_search, handle_provision, handle_quota, handle_quota_consume, handle_retire,
};
pub use health::{health_check, readiness_check, version_info};
