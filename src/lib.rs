//! Pidgeon: a privacy-preserving scheduled-publishing DVM for Nostr.
//!
//! Module layout mirrors the request's lifecycle: `intake` unwraps and
//! classifies inbound gift-wraps, `scheduler` holds due times, `publisher`
//! turns a due job into relay I/O, and `mailbox` keeps each user's
//! encrypted status index in sync. `state` holds the handful of
//! process-wide singletons everything else is threaded through.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod db;
pub mod inbox_relays;
pub mod intake;
pub mod kd;
pub mod mailbox;
pub mod metadata;
pub mod publisher;
pub mod scheduler;
pub mod shared;
pub mod state;
pub mod support;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::config::Config;
use crate::db::{AppDataStore, JobsStore};
use crate::intake::IntakeContext;
use crate::publisher::Publisher;
use crate::scheduler::Scheduler;
use crate::support::SupportPolicy;

/// Safety margin subtracted from the last-known gift-wrap timestamp when
/// resubscribing after a restart, to tolerate clock skew and relay
/// propagation delay rather than lose events right at the boundary.
const SUBSCRIBE_SAFETY_MARGIN_SECS: u64 = 2 * 60;

const INTAKE_QUEUE_CAPACITY: usize = 1024;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(8);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(8);

/// Parse CLI/env, initialize every process-wide singleton, and run until a
/// shutdown signal arrives. Returns the process exit code.
pub async fn run() -> i32 {
    let config = match Config::from_args_and_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[Pidgeon] configuration error: {}", e);
            return 1;
        }
    };

    let dvm_keys = match &config.secret {
        Some(secret) => match parse_secret(secret) {
            Ok(keys) => keys,
            Err(e) => {
                eprintln!("[Pidgeon] bad --secret: {}", e);
                return 1;
            }
        },
        None => {
            eprintln!("[Pidgeon] no --secret/DVM_SECRET provided, generating a throwaway identity");
            Keys::generate()
        }
    };
    println!("[Pidgeon] DVM pubkey: {}", dvm_keys.public_key());

    let jobs = match JobsStore::open(&config.data_dir.join("jobs.db"), 4) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[Pidgeon] failed to open jobs.db: {}", e);
            return 1;
        }
    };
    let appdata = match AppDataStore::open(&config.data_dir.join("app.db"), 4) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("[Pidgeon] failed to open app.db: {}", e);
            return 1;
        }
    };

    let client = Client::new(dvm_keys.clone());
    for relay in &config.relays {
        if let Err(e) = client.add_relay(relay.as_str()).await {
            eprintln!("[Pidgeon] add_relay {} failed: {}", relay, e);
        }
    }
    client.connect().await;

    let support_policy = Arc::new(config.support.clone());

    if state::DVM_KEYS.set(dvm_keys.clone()).is_err() {
        eprintln!("[Pidgeon] bootstrap() called twice");
        return 1;
    }
    let _ = state::NOSTR_CLIENT.set(client.clone());
    let _ = state::CONFIG.set(config.clone());
    let _ = state::JOBS_STORE.set(jobs.clone());
    let _ = state::APPDATA_STORE.set(appdata.clone());

    metadata::publish_bootstrap_metadata(&client, &config).await;
    metadata::probe_d_tag_filter_support(&client, &config.relays).await;

    mailbox::flush::init(
        jobs.clone(),
        appdata.clone(),
        config.mailbox_flush_workers,
        config.mailbox_debounce_ms,
        config.mailbox_retry_max_ms,
    );

    support::poller::spawn(appdata.clone(), support_policy.clone(), config.loadtest);

    let (scheduler, due_rx) = Scheduler::spawn();
    let scheduler = Arc::new(scheduler);

    let publisher = Arc::new(Publisher::new(jobs.clone()));
    let publisher_handles = publisher.clone().spawn_workers(config.request_concurrency, due_rx);

    if let Err(e) = reschedule_pending(&jobs, &scheduler).await {
        eprintln!("[Pidgeon] crash-recovery reschedule failed: {}", e);
    }

    let ctx = Arc::new(IntakeContext::new(jobs.clone(), appdata.clone(), scheduler.clone(), support_policy));
    let (intake_tx, intake_rx) = tokio::sync::mpsc::channel::<Event>(INTAKE_QUEUE_CAPACITY);
    let intake_handles = intake::spawn_workers(config.request_concurrency, intake_rx, ctx);

    let since = last_known_gift_wrap_timestamp(&jobs)
        .saturating_sub(SUBSCRIBE_SAFETY_MARGIN_SECS);
    let gift_wrap_filter = Filter::new()
        .kind(Kind::GiftWrap)
        .pubkey(dvm_keys.public_key())
        .since(Timestamp::from(since));
    if let Err(e) = client.subscribe(gift_wrap_filter, None).await {
        eprintln!("[Pidgeon] gift-wrap subscribe failed: {}", e);
        return 1;
    }

    // Cancellations (NIP-09 deletions, spec.md's kind-5 cancellation channel)
    // arrive as plaintext top-level events, never gift-wrapped, so they need
    // their own subscription rather than riding the gift-wrap one.
    let deletion_filter = Filter::new()
        .kind(Kind::EventDeletion)
        .pubkey(dvm_keys.public_key())
        .since(Timestamp::from(since));
    if let Err(e) = client.subscribe(deletion_filter, None).await {
        eprintln!("[Pidgeon] deletion subscribe failed: {}", e);
        return 1;
    }

    let mut notifications = client.notifications();
    let forward_handle = {
        let intake_tx = intake_tx.clone();
        tokio::spawn(async move {
            while let Ok(notification) = notifications.recv().await {
                if let RelayPoolNotification::Event { event, .. } = notification {
                    if intake_tx.send(*event).await.is_err() {
                        return;
                    }
                }
            }
        })
    };

    wait_for_shutdown_signal().await;
    println!("[Pidgeon] shutdown signal received, draining");

    scheduler.stop();
    forward_handle.abort();
    drop(intake_tx);

    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, join_all(intake_handles)).await;
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, join_all(publisher_handles)).await;
    let _ = tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, mailbox::flush::flush_all_mailboxes(SHUTDOWN_FLUSH_TIMEOUT)).await;

    client.shutdown().await;
    0
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn parse_secret(secret: &str) -> Result<Keys, String> {
    if let Ok(keys) = Keys::parse(secret) {
        return Ok(keys);
    }
    SecretKey::from_hex(secret)
        .map(Keys::new)
        .map_err(|e| format!("not a valid nsec/hex secret key: {}", e))
}

/// Reschedule every job still `scheduled` in the store after a restart —
/// the in-memory scheduler heap is empty on every process start.
async fn reschedule_pending(jobs: &JobsStore, scheduler: &Scheduler) -> Result<(), String> {
    let pending = jobs.list_pending()?;
    let count = pending.len();
    for job in pending {
        scheduler.schedule(&job.id, job.scheduled_at.max(0) as u64).await;
    }
    println!("[Pidgeon] rescheduled {} pending job(s) after restart", count);
    Ok(())
}

/// The most recent ingestion time among jobs already seen, used as the
/// subscription's `since` floor so a restart doesn't replay the entire
/// relay history. Falls back to "1 hour ago" when the store is empty.
fn last_known_gift_wrap_timestamp(jobs: &JobsStore) -> u64 {
    let now = util::now_secs();
    match jobs.latest_created_at() {
        Ok(Some(ts)) if ts > 0 => ts as u64,
        _ => now.saturating_sub(3600),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
