//! Persistence layer: two SQLite-backed stores (`jobs.db`, `app.db`) sharing
//! a common connection-pool/migration implementation.

pub mod appdata;
pub mod jobs;
pub mod pool;

pub use appdata::AppDataStore;
pub use jobs::JobsStore;
