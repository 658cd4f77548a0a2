//! Document datastore: schemas, the `Datastore` trait, and its MongoDB and
//! in-memory implementations.

pub mod memory;
pub mod mongo;
pub mod schemas;
pub mod store;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use store::{with_account, Apply, Datastore};
