//! Intake Pipeline: unwrap gift-wrap → decrypt seal → classify by inner
//! kind → validate → dispatch, per spec.md §4.4.
//!
//! Structure mirrors the host's `rumor.rs::process_rumor` dispatch-by-kind
//! design (kind match → per-kind async handler → typed result), generalized
//! from chat rumor kinds to the DVM's request kinds. Workers pull events off
//! a bounded channel and never propagate errors outward — every handler
//! returns `Result<(), RejectReason>`, logged and discarded by the caller.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::TtlCache;
use crate::db::appdata::AppDataStore;
use crate::db::jobs::{DmJob, DmRecipient, Job, JobStatus, JobsStore, NoteJob, Payload};
use crate::kd;
use crate::scheduler::Scheduler;
use crate::shared::RejectReason;
use crate::support::gate::{self, Feature, SupportPolicy};

pub struct IntakeContext {
    pub jobs: Arc<JobsStore>,
    pub appdata: Arc<AppDataStore>,
    pub scheduler: Arc<Scheduler>,
    pub support_policy: Arc<SupportPolicy>,
    pub seen_ids: AsyncMutex<HashSet<EventId>>,
    pub master_capsule_cooldown: TtlCache<PublicKey, ()>,
}

impl IntakeContext {
    pub fn new(
        jobs: Arc<JobsStore>,
        appdata: Arc<AppDataStore>,
        scheduler: Arc<Scheduler>,
        support_policy: Arc<SupportPolicy>,
    ) -> IntakeContext {
        IntakeContext {
            jobs,
            appdata,
            scheduler,
            support_policy,
            seen_ids: AsyncMutex::new(HashSet::new()),
            master_capsule_cooldown: TtlCache::new(Duration::from_secs(30), Duration::from_secs(30), 10_000),
        }
    }
}

/// Spawn `concurrency` worker tasks pulling gift-wrapped events off `rx`.
/// All workers share the same receiver behind a mutex — whichever task is
/// free when an item arrives does the `recv()`, giving a simple work-stealing
/// pool without a second channel layer.
pub fn spawn_workers(
    concurrency: usize,
    rx: tokio::sync::mpsc::Receiver<Event>,
    ctx: Arc<IntakeContext>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let shared_rx = Arc::new(AsyncMutex::new(rx));
    let mut handles = Vec::new();
    for _ in 0..concurrency.max(1) {
        let ctx = ctx.clone();
        let shared_rx = shared_rx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let event = {
                    let mut guard = shared_rx.lock().await;
                    guard.recv().await
                };
                let Some(event) = event else { return };
                if let Err(reason) = process_event(event.clone(), &ctx).await {
                    eprintln!("[Intake] dropped event {}: {}", event.id, reason);
                }
            }
        }));
    }
    handles
}

/// Process a single inbound event through the full pipeline. Most events are
/// kind-1059 gift-wraps that get unwrapped/decrypted/classified/dispatched;
/// a plaintext kind-5 (NIP-09 deletion, per spec.md's cancellation channel)
/// skips straight to `dispatch_cancellation` since it arrives unwrapped and
/// its signer is already the authorization-relevant pubkey.
pub async fn process_event(event: Event, ctx: &IntakeContext) -> Result<(), RejectReason> {
    {
        let mut seen = ctx.seen_ids.lock().await;
        if !seen.insert(event.id) {
            return Err(RejectReason::Validation("duplicate event id".to_string()));
        }
    }

    if event.kind == Kind::EventDeletion {
        return dispatch_cancellation(ctx, &event.tags, &event.pubkey).await;
    }

    let dvm_keys = crate::state::dvm_keys();

    let unwrapped = nip59::extract_rumor(dvm_keys, &event)
        .await
        .map_err(|e| RejectReason::Validation(format!("unwrap failed: {}", e)))?;

    let rumor = unwrapped.rumor;
    let requester = unwrapped.sender;

    // Deduplicate on the rumor id (property 1): a job already on file for
    // this id means this request has already been handled.
    if ctx
        .jobs
        .get(&rumor.id.map(|id| id.to_hex()).unwrap_or_default())
        .map_err(|e| RejectReason::TransientIo(e))?
        .is_some()
    {
        return Ok(());
    }

    match rumor.kind.as_u16() {
        5901 => dispatch_master_request(ctx, &requester).await,
        5905 => dispatch_schedule_note(ctx, &rumor, &requester).await,
        5906 => dispatch_schedule_dm(ctx, &rumor, &requester).await,
        5907 => dispatch_dm_retry(ctx, &rumor, &requester).await,
        5908 => dispatch_mailbox_repair(ctx, &requester).await,
        5910 => dispatch_support_action(ctx, &rumor, &requester).await,
        other => Err(RejectReason::Validation(format!("unsupported inner kind {}", other))),
    }
}

fn rumor_id_hex(rumor: &UnsignedEvent) -> Result<String, RejectReason> {
    rumor
        .id
        .map(|id| id.to_hex())
        .ok_or_else(|| RejectReason::Validation("rumor missing id".to_string()))
}

fn decrypt_rumor_payload<T: serde::de::DeserializeOwned>(
    rumor: &UnsignedEvent,
    key: &[u8; 32],
) -> Result<T, RejectReason> {
    crate::crypto::decrypt_json(key, &rumor.content)
        .map_err(|e| RejectReason::Validation(format!("payload decrypt failed: {}", e)))
}

#[derive(serde::Deserialize)]
struct ScheduleNoteTags {
    #[serde(default)]
    relays: Vec<String>,
    #[serde(default)]
    cap: Option<ScheduleCap>,
    inner_event_json: String,
}

#[derive(serde::Deserialize, Default)]
struct ScheduleCap {
    #[serde(rename = "allowFree", default)]
    allow_free: bool,
}

async fn dispatch_schedule_note(
    ctx: &IntakeContext,
    rumor: &UnsignedEvent,
    requester: &PublicKey,
) -> Result<(), RejectReason> {
    let secrets = kd::derive_for_user(requester, crate::state::dvm_keys())
        .map_err(RejectReason::TransientIo)?;

    let payload: ScheduleNoteTags = decrypt_rumor_payload(rumor, &secrets.submit_key)?;

    let inner_event = Event::from_json(&payload.inner_event_json)
        .map_err(|e| RejectReason::Validation(format!("bad inner event json: {}", e)))?;
    inner_event
        .verify()
        .map_err(|e| RejectReason::Validation(format!("inner event signature invalid: {}", e)))?;

    if inner_event.kind.as_u16() != 1 && inner_event.kind.as_u16() != 6 {
        return Err(RejectReason::Validation(format!(
            "unsupported inner event kind {}",
            inner_event.kind.as_u16()
        )));
    }
    if inner_event.pubkey != *requester {
        return Err(RejectReason::Authorization);
    }

    let has_quote_tag = inner_event.tags.iter().any(|t| {
        t.as_slice().first().map(|k| k.as_str()) == Some("q")
    });

    if inner_event.kind.as_u16() == 6 {
        let has_valid_e_tag = inner_event.tags.iter().any(|t| {
            let values: Vec<&str> = t.as_slice().iter().map(|s| s.as_str()).collect();
            values.len() >= 3
                && values[0] == "e"
                && values[1].len() == 64
                && (values[2].starts_with("ws://") || values[2].starts_with("wss://"))
        });
        if !has_valid_e_tag {
            return Err(RejectReason::Validation(
                "repost missing valid e-tag with relay hint".to_string(),
            ));
        }
    }

    let relays = crate::util::validate_relay_urls(&payload.relays, crate::state::config().loadtest);
    let relays = if relays.is_empty() {
        crate::state::config().publish_relays.clone()
    } else {
        relays
    };

    let feature = Feature::for_note(has_quote_tag, inner_event.kind.as_u16() == 6);
    let now = crate::util::now_secs() as i64;
    let scheduled_at = inner_event.created_at.as_u64() as i64;
    let allow_free = payload.cap.unwrap_or_default().allow_free;

    let (_, decision) = ctx
        .appdata
        .mutate_support_state_with(&requester.to_hex(), |state| {
            gate::evaluate(&ctx.support_policy, state, feature, scheduled_at, now, allow_free)
        })
        .map_err(RejectReason::TransientIo)?;

    if let gate::GateDecision::Reject(reason) = decision {
        crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
        return Err(RejectReason::Gate(reason));
    }

    ctx.appdata
        .mutate_support_state(&requester.to_hex(), |state| {
            gate::record_successful_schedule(&ctx.support_policy, state)
        })
        .map_err(RejectReason::TransientIo)?;

    let job_id = rumor_id_hex(rumor)?;
    let job = Job {
        id: job_id.clone(),
        requester_pubkey: requester.to_hex(),
        dvm_pubkey: crate::state::dvm_keys().public_key().to_hex(),
        relays: relays.clone(),
        scheduled_at,
        created_at: now,
        updated_at: now,
        status: JobStatus::Scheduled,
        payload: Payload::Note(NoteJob {
            inner_event_json: inner_event.as_json(),
            kind: inner_event.kind.as_u16(),
            has_quote_tag,
        }),
        last_error: None,
    };

    ctx.jobs.insert_if_absent(&job).map_err(RejectReason::TransientIo)?;
    ctx.scheduler.schedule(&job_id, scheduled_at.max(0) as u64).await;
    crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
    Ok(())
}

#[derive(serde::Deserialize)]
struct ScheduleDmPayload {
    #[serde(rename = "scheduledAt")]
    scheduled_at: i64,
    #[serde(rename = "dmEnc")]
    dm_enc: String,
    #[serde(default)]
    meta: serde_json::Value,
    #[serde(rename = "pkvId")]
    pkv_id: String,
    recipients: Vec<DmRecipientInput>,
}

#[derive(serde::Deserialize)]
struct DmRecipientInput {
    pubkey: String,
    seal: String,
}

async fn dispatch_schedule_dm(
    ctx: &IntakeContext,
    rumor: &UnsignedEvent,
    requester: &PublicKey,
) -> Result<(), RejectReason> {
    let secrets = kd::derive_for_user(requester, crate::state::dvm_keys())
        .map_err(RejectReason::TransientIo)?;

    let payload: ScheduleDmPayload = decrypt_rumor_payload(rumor, &secrets.dm_key)?;

    if payload.recipients.is_empty() {
        return Err(RejectReason::Validation("dm job has no recipients".to_string()));
    }
    for recipient in &payload.recipients {
        if PublicKey::parse(&recipient.pubkey).is_err() {
            return Err(RejectReason::Validation("invalid recipient pubkey".to_string()));
        }
    }

    let now = crate::util::now_secs() as i64;
    let (_, decision) = ctx
        .appdata
        .mutate_support_state_with(&requester.to_hex(), |state| {
            gate::evaluate(&ctx.support_policy, state, Feature::Dm17, payload.scheduled_at, now, false)
        })
        .map_err(RejectReason::TransientIo)?;
    if let gate::GateDecision::Reject(reason) = decision {
        crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
        return Err(RejectReason::Gate(reason));
    }
    ctx.appdata
        .mutate_support_state(&requester.to_hex(), |s| gate::record_successful_schedule(&ctx.support_policy, s))
        .map_err(RejectReason::TransientIo)?;

    let job_id = rumor_id_hex(rumor)?;
    let job = Job {
        id: job_id.clone(),
        requester_pubkey: requester.to_hex(),
        dvm_pubkey: crate::state::dvm_keys().public_key().to_hex(),
        relays: Vec::new(),
        scheduled_at: payload.scheduled_at,
        created_at: now,
        updated_at: now,
        status: JobStatus::Scheduled,
        payload: Payload::Dm(DmJob {
            pkv_id: payload.pkv_id,
            dm_enc: payload.dm_enc,
            meta: payload.meta,
            recipients: payload
                .recipients
                .into_iter()
                .map(|r| DmRecipient {
                    pubkey: r.pubkey,
                    seal: r.seal,
                    wrap_id: None,
                    wrap_json: None,
                    status: JobStatus::Scheduled,
                    last_error: None,
                    relays_used: Vec::new(),
                    attempted_relays: Vec::new(),
                })
                .collect(),
            sender_copy_wrap_id: None,
            sender_copy_wrap_json: None,
            sender_copy_status: JobStatus::Scheduled,
        }),
        last_error: None,
    };

    ctx.jobs.insert_if_absent(&job).map_err(RejectReason::TransientIo)?;
    ctx.scheduler.schedule(&job_id, payload.scheduled_at.max(0) as u64).await;
    crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
    Ok(())
}

async fn dispatch_dm_retry(
    ctx: &IntakeContext,
    rumor: &UnsignedEvent,
    requester: &PublicKey,
) -> Result<(), RejectReason> {
    let job_id = extract_job_id_tag(rumor)?;
    let job = ctx
        .jobs
        .get(&job_id)
        .map_err(RejectReason::TransientIo)?
        .ok_or_else(|| RejectReason::Validation("retry target job not found".to_string()))?;
    if job.requester_pubkey != requester.to_hex() {
        return Err(RejectReason::Authorization);
    }
    ctx.scheduler.schedule(&job_id, crate::util::now_secs()).await;
    Ok(())
}

async fn dispatch_mailbox_repair(ctx: &IntakeContext, requester: &PublicKey) -> Result<(), RejectReason> {
    crate::mailbox::repair::enqueue_repair(requester.to_hex(), "queue".to_string());
    let _ = ctx;
    Ok(())
}

#[derive(serde::Deserialize)]
struct SupportActionPayload {
    action: String,
}

async fn dispatch_support_action(
    ctx: &IntakeContext,
    rumor: &UnsignedEvent,
    requester: &PublicKey,
) -> Result<(), RejectReason> {
    let secrets = kd::derive_for_user(requester, crate::state::dvm_keys())
        .map_err(RejectReason::TransientIo)?;
    let payload: SupportActionPayload = decrypt_rumor_payload(rumor, &secrets.submit_key)?;

    match payload.action.as_str() {
        "use_free" => {
            ctx.appdata
                .mutate_support_state(&requester.to_hex(), |state| {
                    state.free_until_count = state
                        .free_until_count
                        .max(state.schedule_count + ctx.support_policy.window_schedules);
                    state.gate_prompt = None;
                })
                .map_err(RejectReason::TransientIo)?;
        }
        "maybe_later" => {
            ctx.appdata
                .mutate_support_state(&requester.to_hex(), |state| state.gate_prompt = None)
                .map_err(RejectReason::TransientIo)?;
        }
        "support" => {
            if ctx.support_policy.payment_mode == "lnurl_verify" {
                let loadtest = crate::state::config().loadtest;
                match crate::support::lnurl::request_invoice(
                    &ctx.support_policy.lud16,
                    ctx.support_policy.invoice_sats,
                    ctx.support_policy.min_sats,
                    loadtest,
                    Duration::from_millis(5000),
                )
                .await
                {
                    Ok((pr, verify_url)) => {
                        let now = crate::util::now_secs();
                        let invoice = crate::support::lnurl::SupportInvoice {
                            id: uuid_like(rumor),
                            pubkey: requester.to_hex(),
                            pr,
                            verify_url,
                            sats: ctx.support_policy.invoice_sats,
                            status: crate::support::lnurl::InvoiceStatus::Pending,
                            created_at: now,
                            expires_at: now + ctx.support_policy.invoice_ttl_sec,
                            settled_at: None,
                            preimage: None,
                            last_check_at: None,
                            last_error: None,
                        };
                        ctx.appdata.insert_invoice(&invoice).map_err(RejectReason::TransientIo)?;
                    }
                    Err(e) => return Err(RejectReason::TransientIo(e)),
                }
            }
        }
        "check_invoice" => {
            // Resolved by the background poller in support::lnurl; nothing to
            // do here besides trigger a mailbox flush so the client re-reads
            // current invoice state.
        }
        other => return Err(RejectReason::Validation(format!("unknown support action {}", other))),
    }

    crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
    Ok(())
}

fn uuid_like(rumor: &UnsignedEvent) -> String {
    rumor.id.map(|id| id.to_hex()).unwrap_or_else(|| crate::util::now_ms().to_string())
}

async fn dispatch_master_request(ctx: &IntakeContext, requester: &PublicKey) -> Result<(), RejectReason> {
    if ctx.master_capsule_cooldown.get(requester).is_some() {
        return Ok(());
    }
    ctx.master_capsule_cooldown.insert(*requester, (), true);

    let dvm_keys = crate::state::dvm_keys();
    let secrets = kd::derive_for_user(requester, dvm_keys).map_err(RejectReason::TransientIo)?;

    let capsule = serde_json::json!({
        "rootKey_b64u": crate::util::b64url_encode(&secrets.root_key),
        "mb": kd::mb_to_string(&secrets.mb),
        "version": 3,
        "relays": crate::state::config().relays,
    });

    let rumor = EventBuilder::new(Kind::Custom(5905), capsule.to_string())
        .custom_created_at(Timestamp::now())
        .build(dvm_keys.public_key());

    let client = crate::state::nostr_client();
    if let Err(e) = crate::inbox_relays::send_gift_wrap(client, requester, rumor, []).await {
        eprintln!("[Intake] master capsule publish failed for {}: {}", requester, e);
    }
    Ok(())
}

fn extract_job_id_tag(rumor: &UnsignedEvent) -> Result<String, RejectReason> {
    rumor
        .tags
        .iter()
        .find_map(|t| {
            let values: Vec<&str> = t.as_slice().iter().map(|s| s.as_str()).collect();
            if values.len() >= 2 && values[0] == "e" {
                Some(values[1].to_string())
            } else {
                None
            }
        })
        .ok_or_else(|| RejectReason::Validation("missing e-tag job reference".to_string()))
}

/// Cancel jobs named by `e`-tags in `tags`, authorizing against `requester`
/// (the deletion event's signer, per spec.md §4.4 — `requesterPubkey ==
/// deletion author`). Jobs owned by someone else are silently skipped rather
/// than failing the whole batch.
async fn dispatch_cancellation(
    ctx: &IntakeContext,
    tags: &Tags,
    requester: &PublicKey,
) -> Result<(), RejectReason> {
    let targets: Vec<String> = tags
        .iter()
        .filter_map(|t| {
            let values: Vec<&str> = t.as_slice().iter().map(|s| s.as_str()).collect();
            if values.len() >= 2 && values[0] == "e" {
                Some(values[1].to_string())
            } else {
                None
            }
        })
        .collect();

    for target in targets {
        let Some(job) = ctx.jobs.get(&target).map_err(RejectReason::TransientIo)? else {
            continue;
        };
        if job.requester_pubkey != requester.to_hex() {
            continue; // authorization failure for this id only; others still processed
        }
        ctx.scheduler.cancel(&target).await;
        ctx.jobs
            .mark_status(&target, JobStatus::Canceled, None)
            .map_err(RejectReason::TransientIo)?;
        crate::mailbox::flush::queue_mailbox_publish(&requester.to_hex());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> SupportPolicy {
        SupportPolicy {
            horizon_days: 0,
            window_schedules: 10,
            gated_features: Vec::new(),
            lud16: String::new(),
            cta_message: String::new(),
            payment_mode: "disabled".to_string(),
            invoice_sats: 1000,
            min_sats: 1000,
            supporter_days: 30,
            invoice_ttl_sec: 900,
            verify_poll_sec: 30,
            verify_timeout_ms: 5000,
        }
    }

    fn test_ctx() -> (IntakeContext, Arc<JobsStore>) {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(JobsStore::open(&dir.path().join("jobs.db"), 2).unwrap());
        let appdata = Arc::new(AppDataStore::open(&dir.path().join("app.db"), 2).unwrap());
        let (scheduler, _due_rx) = Scheduler::spawn();
        let ctx = IntakeContext::new(jobs.clone(), appdata, Arc::new(scheduler), Arc::new(test_policy()));
        (ctx, jobs)
    }

    fn sample_job(id: &str, requester: &PublicKey) -> Job {
        Job {
            id: id.to_string(),
            requester_pubkey: requester.to_hex(),
            dvm_pubkey: "dvm".to_string(),
            relays: vec!["wss://r1".to_string()],
            scheduled_at: 1_000_000,
            created_at: 1,
            updated_at: 1,
            status: JobStatus::Scheduled,
            payload: Payload::Note(NoteJob {
                inner_event_json: "{}".to_string(),
                kind: 1,
                has_quote_tag: false,
            }),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn plaintext_deletion_event_cancels_owned_job() {
        let (ctx, jobs) = test_ctx();
        let requester = Keys::generate();
        jobs.insert_if_absent(&sample_job("job1", &requester.public_key())).unwrap();

        let deletion = EventBuilder::new(Kind::EventDeletion, "")
            .tag(Tag::custom(TagKind::e(), ["job1".to_string()]))
            .build(requester.public_key())
            .sign(&requester)
            .await
            .unwrap();

        assert!(process_event(deletion, &ctx).await.is_ok());
        let job = jobs.get("job1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn plaintext_deletion_ignores_job_owned_by_someone_else() {
        let (ctx, jobs) = test_ctx();
        let owner = Keys::generate();
        let attacker = Keys::generate();
        jobs.insert_if_absent(&sample_job("job1", &owner.public_key())).unwrap();

        let deletion = EventBuilder::new(Kind::EventDeletion, "")
            .tag(Tag::custom(TagKind::e(), ["job1".to_string()]))
            .build(attacker.public_key())
            .sign(&attacker)
            .await
            .unwrap();

        assert!(process_event(deletion, &ctx).await.is_ok());
        let job = jobs.get("job1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled, "attacker is not the requester, cancel must be a no-op");
    }

    #[test]
    fn extract_job_id_tag_reads_e_tag() {
        let keys = Keys::generate();
        let target = "a".repeat(64);
        let rumor = EventBuilder::new(Kind::EventDeletion, "")
            .tag(Tag::event(EventId::from_hex(&target).unwrap()))
            .build(keys.public_key());
        assert_eq!(extract_job_id_tag(&rumor).unwrap(), target);
    }
}
