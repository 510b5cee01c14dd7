//! Process-wide singletons: the DVM identity, the shared Nostr client, and
//! the policy config. Per the "global mutable state" design note, these are
//! the only three globals — everything else is passed by reference from
//! `bootstrap()`.

use std::sync::Arc;

use nostr_sdk::prelude::*;
use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::db::{AppDataStore, JobsStore};

/// The DVM's own keypair. Loaded once at startup from `--secret`/`DVM_SECRET`.
pub static DVM_KEYS: OnceCell<Keys> = OnceCell::new();

/// Shared relay-pool client used by intake, publisher, and mailbox flush.
pub static NOSTR_CLIENT: OnceCell<Client> = OnceCell::new();

/// Resolved, validated process configuration.
pub static CONFIG: OnceCell<Config> = OnceCell::new();

/// The jobs database, reachable from free functions (mailbox repair) that
/// aren't handed a context object.
pub static JOBS_STORE: OnceCell<Arc<JobsStore>> = OnceCell::new();

/// The appdata database, same rationale as `JOBS_STORE`.
pub static APPDATA_STORE: OnceCell<Arc<AppDataStore>> = OnceCell::new();

pub fn dvm_keys() -> &'static Keys {
    DVM_KEYS.get().expect("bootstrap() must run before dvm_keys()")
}

pub fn nostr_client() -> &'static Client {
    NOSTR_CLIENT
        .get()
        .expect("bootstrap() must run before nostr_client()")
}

pub fn config() -> &'static Config {
    CONFIG.get().expect("bootstrap() must run before config()")
}

pub fn jobs_store() -> &'static JobsStore {
    JOBS_STORE.get().expect("bootstrap() must run before jobs_store()")
}

pub fn appdata_store() -> &'static AppDataStore {
    APPDATA_STORE.get().expect("bootstrap() must run before appdata_store()")
}
