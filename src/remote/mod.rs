pub mod generator;
pub mod images;
pub mod observations;
pub mod retry;

pub use generator::{ContentGenerator, HttpContentGenerator};
pub use observations::{HttpObservationProvider, Observation, ObservationProvider, TaxonEntry};
pub use retry::{call_with_retry, RemoteError, RetryPolicy};
