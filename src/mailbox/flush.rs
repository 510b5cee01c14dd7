//! Debounced per-user mailbox flush worker pool, per spec.md §4.7.
//!
//! Mirrors the host's `republish_inbox_relays_debounced` pattern (a
//! generation counter plus a delayed spawn that checks it's still current)
//! but fans the debounced trigger out to a small fixed worker pool instead
//! of a single background task, since flush itself does real publish I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nostr_sdk::prelude::*;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::db::jobs::JobStatus;
use crate::db::{AppDataStore, JobsStore};
use crate::mailbox::index;

struct FlushPool {
    jobs: Arc<JobsStore>,
    appdata: Arc<AppDataStore>,
    debounce_ms: u64,
    retry_max_ms: u64,
    generations: StdMutex<HashMap<String, u64>>,
    tx: mpsc::UnboundedSender<String>,
}

static FLUSH_POOL: OnceCell<FlushPool> = OnceCell::new();

/// Start the flush worker pool. Called once from `bootstrap()`.
pub fn init(jobs: Arc<JobsStore>, appdata: Arc<AppDataStore>, workers: usize, debounce_ms: u64, retry_max_ms: u64) {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let pool = FlushPool {
        jobs,
        appdata,
        debounce_ms,
        retry_max_ms,
        generations: StdMutex::new(HashMap::new()),
        tx,
    };
    if FLUSH_POOL.set(pool).is_err() {
        return; // already initialized — not expected outside tests
    }

    let shared_rx = Arc::new(AsyncMutex::new(rx));
    for _ in 0..workers.max(1) {
        let shared_rx = shared_rx.clone();
        tokio::spawn(async move {
            loop {
                let next = { shared_rx.lock().await.recv().await };
                match next {
                    Some(pubkey) => flush_with_retry(&pubkey).await,
                    None => return,
                }
            }
        });
    }
}

/// Queue a flush for `pubkey`. Rapid repeated calls coalesce: only the last
/// one to survive the debounce window actually triggers a publish.
pub fn queue_mailbox_publish(pubkey: &str) {
    let Some(pool) = FLUSH_POOL.get() else { return };
    let pubkey = pubkey.to_string();
    let my_gen = {
        let mut guard = pool.generations.lock().unwrap();
        let slot = guard.entry(pubkey.clone()).or_insert(0);
        *slot += 1;
        *slot
    };
    let debounce_ms = pool.debounce_ms;
    let tx = pool.tx.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(debounce_ms)).await;
        let Some(pool) = FLUSH_POOL.get() else { return };
        let current = pool.generations.lock().unwrap().get(&pubkey).copied().unwrap_or(0);
        if current != my_gen {
            return; // superseded by a later call
        }
        let _ = tx.send(pubkey);
    });
}

async fn flush_with_retry(pubkey: &str) {
    let Some(pool) = FLUSH_POOL.get() else { return };
    let mut backoff_ms = 2_000u64.min(pool.retry_max_ms);
    loop {
        match flush_one(pool, pubkey).await {
            Ok(()) => return,
            Err(e) => {
                eprintln!("[Mailbox] flush failed for {}: {}", pubkey, e);
                if backoff_ms >= pool.retry_max_ms {
                    eprintln!("[Mailbox] giving up flush for {} after max backoff", pubkey);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(pool.retry_max_ms);
            }
        }
    }
}

async fn flush_one(pool: &FlushPool, pubkey: &str) -> Result<(), String> {
    let jobs = pool.jobs.list_by_requester(pubkey)?;
    let pending: Vec<_> = jobs.iter().cloned().filter(|j| j.status == JobStatus::Scheduled).collect();
    let terminal: Vec<_> = jobs.into_iter().filter(|j| j.status != JobStatus::Scheduled).collect();

    let meta = pool.appdata.get_mailbox_meta(pubkey)?;
    let support_state = pool.appdata.get_support_state(pubkey)?;
    let support_json = serde_json::to_value(&support_state).map_err(|e| e.to_string())?;

    let user_pk = PublicKey::parse(pubkey).map_err(|e| format!("bad pubkey {}: {}", pubkey, e))?;
    let secrets = crate::kd::derive_for_user(&user_pk, crate::state::dvm_keys())?;
    let mb = crate::kd::mb_to_string(&secrets.mb);

    let cfg = crate::state::config();
    let relays = if !cfg.publish_relays.is_empty() {
        cfg.publish_relays.clone()
    } else {
        cfg.relays.clone()
    };
    let capsules = meta.preview_key_capsules.clone();

    match index::plan_flush(&mb, &meta, &pending, &terminal, &relays, &capsules, &support_json) {
        None => Ok(()),
        Some(plan) => {
            index::execute_flush(
                crate::state::nostr_client(),
                crate::state::dvm_keys(),
                &secrets,
                pubkey,
                &pool.appdata,
                meta,
                plan,
            )
            .await
        }
    }
}

/// Best-effort drain of every pubkey this process has ever queued, bounded
/// by `deadline`. Used at shutdown (spec.md §5's flush step) — anything
/// left over after the deadline is recovered on next queue or by `repair`.
pub async fn flush_all_mailboxes(deadline: Duration) {
    let Some(pool) = FLUSH_POOL.get() else { return };
    let pubkeys: Vec<String> = pool.generations.lock().unwrap().keys().cloned().collect();
    let _ = tokio::time::timeout(deadline, async {
        for pubkey in pubkeys {
            flush_with_retry(&pubkey).await;
        }
    })
    .await;
}
