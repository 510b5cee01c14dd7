//! Encrypted mailbox shard layout, size adaptation, and publish-order
//! planning, per spec.md §4.6.
//!
//! This module is split into a pure planning half (`plan_flush`, fully unit
//! tested without any network or signing dependency) and a thin execution
//! half (`execute_flush`) that actually encrypts, signs, and publishes the
//! planned shards in order. Keeping the split lets the rev-monotonicity and
//! change-hash short-circuit invariants (testable properties 4 and 5) be
//! asserted directly against the plan.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::db::appdata::{AppDataStore, MailboxMeta};
use crate::db::jobs::{Job, JobStatus};
use crate::kd::DerivedSecrets;

/// Soft target for a pending page's plaintext, before encryption overhead.
const PENDING_PAGE_TARGET_BYTES: usize = 24 * 1024;
/// Hard cap on the final relay event (ciphertext + signature headroom).
const HARD_EVENT_CAP_BYTES: usize = 48 * 1024;
/// Chunk size for oversized-item blob shards.
const BLOB_CHUNK_BYTES: usize = 16 * 1024;
/// How many times the pending-page target shrinks (×0.7) before falling
/// back to one item per page.
const MAX_SHRINK_RETRIES: u32 = 6;
/// Rough ciphertext/signature expansion factor for the hex-encoded
/// ChaCha20Poly1305 envelope produced by `crypto::encrypt_json`.
const EXPANSION_FACTOR: f64 = 2.2;

fn estimated_final_size(plaintext_bytes: usize) -> usize {
    (plaintext_bytes as f64 * EXPANSION_FACTOR) as usize
}

/// One shard ready to be encrypted (under `key`) and published under `d_tag`.
pub struct ShardWrite {
    pub d_tag: String,
    pub plaintext: Vec<u8>,
    pub kind: ShardKind,
    /// Identifies the `(count, contentHash)` ledger row (if any) this shard
    /// is gated on — `None` for shards (bucket indices, the global index)
    /// that always republish once anything under them changed.
    pub page_key: Option<PageKey>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Mailbox,
    Blob,
}

/// The `(count, contentHash)` identity spec.md:170 gates republishing on: a
/// pending/history page tracked by `(pubkey, bucket, page)`, or an oversized
/// item's blob manifest tracked by `(pubkey, noteId)`.
#[derive(Clone)]
pub enum PageKey {
    Page {
        bucket: String,
        page: u32,
        count: u32,
        hash: String,
    },
    Blob {
        note_id: String,
        parts: u32,
        bytes: u64,
        hash: String,
    },
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    crate::util::bytes_to_hex(&hasher.finalize())
}

pub struct FlushPlan {
    pub new_rev: u64,
    pub new_hash: String,
    pub relays_key: String,
    pub blobs: Vec<ShardWrite>,
    pub pending_pages: Vec<ShardWrite>,
    pub history_pages: Vec<ShardWrite>,
    pub bucket_indices: Vec<ShardWrite>,
    pub global_index: ShardWrite,
}

impl FlushPlan {
    /// Every shard in the order it must hit the wire: blobs, pending pages,
    /// history pages, bucket indices, global index last.
    pub fn ordered_d_tags(&self) -> Vec<&str> {
        let mut out = Vec::new();
        out.extend(self.blobs.iter().map(|s| s.d_tag.as_str()));
        out.extend(self.pending_pages.iter().map(|s| s.d_tag.as_str()));
        out.extend(self.history_pages.iter().map(|s| s.d_tag.as_str()));
        out.extend(self.bucket_indices.iter().map(|s| s.d_tag.as_str()));
        out.push(self.global_index.d_tag.as_str());
        out
    }
}

struct PendingItem {
    note_id: String,
    json: serde_json::Value,
}

fn note_fingerprint(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "status": job.status.as_str(),
        "scheduledAt": job.scheduled_at,
        "updatedAt": job.updated_at,
    })
}

/// Full reconstructable content for one job, embedded in pending/history
/// shards so a client can render the queue/history without any other
/// source of truth. Unlike [`note_fingerprint`] (used only for the
/// lightweight change-detection hash), this carries the actual note/DM
/// content and is what drives the oversized-item blob-shard decision.
fn job_item_json(job: &Job) -> serde_json::Value {
    use crate::db::jobs::Payload;

    let mut value = note_fingerprint(job);
    let obj = value.as_object_mut().expect("note_fingerprint always returns an object");
    obj.insert("relays".to_string(), serde_json::json!(job.relays));
    if let Some(err) = &job.last_error {
        obj.insert("lastError".to_string(), serde_json::json!(err));
    }

    match &job.payload {
        Payload::Note(note) => {
            obj.insert("type".to_string(), serde_json::json!("note"));
            obj.insert("hasQuoteTag".to_string(), serde_json::json!(note.has_quote_tag));
            let event = serde_json::from_str::<serde_json::Value>(&note.inner_event_json)
                .unwrap_or(serde_json::json!(note.inner_event_json));
            obj.insert("event".to_string(), event);
        }
        Payload::Dm(dm) => {
            obj.insert("type".to_string(), serde_json::json!("dm17"));
            obj.insert("pkvId".to_string(), serde_json::json!(dm.pkv_id));
            obj.insert("dmEnc".to_string(), serde_json::json!(dm.dm_enc));
            obj.insert("meta".to_string(), dm.meta.clone());
            obj.insert(
                "recipients".to_string(),
                serde_json::json!(dm
                    .recipients
                    .iter()
                    .map(|r| serde_json::json!({ "pubkey": r.pubkey, "status": r.status.as_str() }))
                    .collect::<Vec<_>>()),
            );
        }
    }

    value
}

fn bucket_for(job: &Job) -> String {
    let secs = job.updated_at.max(0) as u64;
    let days = secs / 86_400;
    // Cheap civil-from-days without a date crate dependency: good enough for
    // a monthly bucket key, not for display.
    let (y, m, _d) = civil_from_days(days as i64);
    format!("{:04}-{:02}", y, m)
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Pack pending items into pages under `target_size`, shrinking the target
/// by ×0.7 up to `MAX_SHRINK_RETRIES` times when the estimated final size of
/// any page would exceed the hard relay cap. Falls back to one item per
/// page for pathological inputs.
fn pack_pending_pages(items: &[PendingItem]) -> Vec<Vec<usize>> {
    let mut target = PENDING_PAGE_TARGET_BYTES;
    for _ in 0..MAX_SHRINK_RETRIES {
        let pages = greedy_pack(items, target);
        if pages
            .iter()
            .all(|page| estimated_final_size(page_plaintext_len(items, page)) <= HARD_EVENT_CAP_BYTES)
        {
            return pages;
        }
        target = (target as f64 * 0.7) as usize;
    }
    (0..items.len()).map(|i| vec![i]).collect()
}

fn page_plaintext_len(items: &[PendingItem], page: &[usize]) -> usize {
    page.iter()
        .map(|&i| items[i].json.to_string().len())
        .sum::<usize>()
        + 32
}

fn greedy_pack(items: &[PendingItem], target_size: usize) -> Vec<Vec<usize>> {
    let mut pages: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_len = 0usize;
    for (i, item) in items.iter().enumerate() {
        let len = item.json.to_string().len();
        if !current.is_empty() && current_len + len > target_size {
            pages.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push(i);
        current_len += len;
    }
    if !current.is_empty() {
        pages.push(current);
    }
    if pages.is_empty() {
        pages.push(Vec::new());
    }
    pages
}

/// Split oversized content into UTF-8-safe chunks of at most
/// `BLOB_CHUNK_BYTES` bytes, never splitting inside a multi-byte codepoint.
fn chunk_utf8_safe(content: &str, chunk_size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = content.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let mut end = (start + chunk_size).min(bytes.len());
        while end < bytes.len() && !content.is_char_boundary(end) {
            end -= 1;
        }
        out.push(content[start..end].to_string());
        start = end;
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

/// Build the deterministic state hash spec.md §4.6 describes: a sha256 over
/// `(relays, capsules, support snapshot, pending fingerprints, dm pending
/// fingerprints, terminal fingerprints)`.
fn compute_state_hash(
    relays: &[String],
    capsules: &serde_json::Value,
    support_snapshot: &serde_json::Value,
    pending: &[serde_json::Value],
    terminal: &[serde_json::Value],
) -> String {
    let mut hasher = Sha256::new();
    let payload = serde_json::json!({
        "relays": relays,
        "capsules": capsules,
        "support": support_snapshot,
        "pending": pending,
        "terminal": terminal,
    });
    hasher.update(payload.to_string().as_bytes());
    crate::util::bytes_to_hex(&hasher.finalize())
}

fn relays_key(relays: &[String]) -> String {
    let mut sorted = relays.to_vec();
    sorted.sort();
    sorted.join(",")
}

/// Compute what a flush for `mb` would publish, or `None` if the change-hash
/// short-circuit applies (testable property 5): no job/capsule/relay/support
/// change since the last publish, in which case `rev` must not advance.
pub fn plan_flush(
    mb: &str,
    meta: &MailboxMeta,
    pending_jobs: &[Job],
    terminal_jobs: &[Job],
    relays: &[String],
    capsules: &serde_json::Value,
    support_snapshot: &serde_json::Value,
) -> Option<FlushPlan> {
    let pending_fp: Vec<_> = pending_jobs.iter().map(note_fingerprint).collect();
    let terminal_fp: Vec<_> = terminal_jobs.iter().map(note_fingerprint).collect();
    let new_hash = compute_state_hash(relays, capsules, support_snapshot, &pending_fp, &terminal_fp);
    let new_relays_key = relays_key(relays);

    if new_hash == meta.published_hash && new_relays_key == meta.published_relays_key {
        return None;
    }

    let mut plan = build_plan(mb, meta.rev + 1, pending_jobs, terminal_jobs, relays, capsules, support_snapshot);
    plan.new_hash = new_hash;
    plan.relays_key = new_relays_key;
    Some(plan)
}

/// Rebuild the exact same shard set a normal flush would produce, but
/// pinned to the *current* rev instead of advancing it — used by `repair`
/// to republish content under shards a probe found missing, without the
/// rev-bump a content-changing flush would cause.
pub fn repair_plan(
    mb: &str,
    meta: &MailboxMeta,
    pending_jobs: &[Job],
    terminal_jobs: &[Job],
    relays: &[String],
    capsules: &serde_json::Value,
    support_snapshot: &serde_json::Value,
) -> FlushPlan {
    let mut plan = build_plan(mb, meta.rev, pending_jobs, terminal_jobs, relays, capsules, support_snapshot);
    plan.new_hash = meta.published_hash.clone();
    plan.relays_key = meta.published_relays_key.clone();
    plan
}

fn build_plan(
    mb: &str,
    rev: u64,
    pending_jobs: &[Job],
    terminal_jobs: &[Job],
    relays: &[String],
    capsules: &serde_json::Value,
    support_snapshot: &serde_json::Value,
) -> FlushPlan {
    let new_rev = rev;

    let pending_items: Vec<PendingItem> = pending_jobs
        .iter()
        .map(|j| PendingItem {
            note_id: j.id.clone(),
            json: job_item_json(j),
        })
        .collect();

    let mut blobs = Vec::new();
    let mut stubs = Vec::new();
    let mut inline_items = Vec::new();

    for item in &pending_items {
        let plaintext = item.json.to_string();
        if estimated_final_size(plaintext.len()) > HARD_EVENT_CAP_BYTES {
            let chunks = chunk_utf8_safe(&plaintext, BLOB_CHUNK_BYTES);
            let parts = chunks.len();
            let manifest_hash = sha256_hex(plaintext.as_bytes());
            let manifest_bytes = plaintext.len() as u64;
            for (part_idx, chunk) in chunks.iter().enumerate() {
                blobs.push(ShardWrite {
                    d_tag: format!("pidgeon:v3:mb:{}:blob:{}:{}", mb, item.note_id, part_idx),
                    plaintext: chunk.clone().into_bytes(),
                    kind: ShardKind::Blob,
                    page_key: Some(PageKey::Blob {
                        note_id: item.note_id.clone(),
                        parts: parts as u32,
                        bytes: manifest_bytes,
                        hash: manifest_hash.clone(),
                    }),
                });
            }
            stubs.push(serde_json::json!({
                "id": item.note_id,
                "noteBlob": {
                    "dBase": format!("pidgeon:v3:mb:{}:blob:{}", mb, item.note_id),
                    "parts": parts,
                    "bytes": plaintext.len(),
                }
            }));
        } else {
            inline_items.push(item);
        }
    }

    let indices = pack_pending_pages(&inline_items.iter().map(|i| PendingItem {
        note_id: i.note_id.clone(),
        json: i.json.clone(),
    }).collect::<Vec<_>>());

    let mut pending_pages = Vec::new();
    for (page_no, page_indices) in indices.iter().enumerate() {
        let mut page_items: Vec<serde_json::Value> = page_indices
            .iter()
            .map(|&i| inline_items[i].json.clone())
            .collect();
        if page_no == 0 {
            page_items.extend(stubs.iter().cloned());
        }
        let count = page_items.len() as u32;
        let plaintext = serde_json::json!({ "items": page_items }).to_string();
        let hash = sha256_hex(plaintext.as_bytes());
        pending_pages.push(ShardWrite {
            d_tag: format!("pidgeon:v3:mb:{}:pending:{}", mb, page_no),
            plaintext: plaintext.into_bytes(),
            kind: ShardKind::Mailbox,
            page_key: Some(PageKey::Page { bucket: "__pending__".to_string(), page: page_no as u32, count, hash }),
        });
    }
    if pending_pages.is_empty() {
        let plaintext = serde_json::json!({ "items": stubs }).to_string();
        let hash = sha256_hex(plaintext.as_bytes());
        pending_pages.push(ShardWrite {
            d_tag: format!("pidgeon:v3:mb:{}:pending:0", mb),
            plaintext: plaintext.into_bytes(),
            kind: ShardKind::Mailbox,
            page_key: Some(PageKey::Page { bucket: "__pending__".to_string(), page: 0, count: stubs.len() as u32, hash }),
        });
    }

    let mut by_bucket: HashMap<String, Vec<&Job>> = HashMap::new();
    for job in terminal_jobs {
        by_bucket.entry(bucket_for(job)).or_default().push(job);
    }
    let mut bucket_order: Vec<String> = by_bucket.keys().cloned().collect();
    bucket_order.sort_by(|a, b| b.cmp(a)); // descending, per spec.md §4.6

    let mut history_pages = Vec::new();
    let mut bucket_indices = Vec::new();
    for bucket in &bucket_order {
        let mut jobs = by_bucket.get(bucket).cloned().unwrap_or_default();
        jobs.sort_by_key(|j| j.updated_at);
        let items: Vec<serde_json::Value> = jobs.iter().map(|j| job_item_json(j)).collect();
        let count = items.len() as u32;
        let plaintext = serde_json::json!({ "items": items }).to_string();
        let hash = sha256_hex(plaintext.as_bytes());
        let d_tag = format!("pidgeon:v3:mb:{}:hist:{}:0", mb, bucket);
        history_pages.push(ShardWrite {
            d_tag: d_tag.clone(),
            plaintext: plaintext.into_bytes(),
            kind: ShardKind::Mailbox,
            page_key: Some(PageKey::Page { bucket: bucket.clone(), page: 0, count, hash }),
        });
        let bucket_plaintext = serde_json::json!({ "pages": [d_tag], "count": jobs.len() }).to_string();
        bucket_indices.push(ShardWrite {
            d_tag: format!("pidgeon:v3:mb:{}:bucket:{}", mb, bucket),
            plaintext: bucket_plaintext.into_bytes(),
            kind: ShardKind::Mailbox,
            page_key: None,
        });
    }

    let pending_page_tags: Vec<String> = pending_pages.iter().map(|p| p.d_tag.clone()).collect();
    let global_plaintext = serde_json::json!({
        "v": 3,
        "rev": new_rev,
        "relays": relays,
        "previewKeyCapsules": capsules,
        "counts": { "pending": pending_jobs.len(), "terminal": terminal_jobs.len() },
        "support": support_snapshot,
        "pending_pages": pending_page_tags,
        "bucket_order": "desc",
        "buckets": bucket_order,
    })
    .to_string();

    let global_index = ShardWrite {
        d_tag: format!("pidgeon:v3:mb:{}:index", mb),
        plaintext: global_plaintext.into_bytes(),
        kind: ShardKind::Mailbox,
        page_key: None,
    };

    FlushPlan {
        new_rev,
        new_hash: String::new(),
        relays_key: String::new(),
        blobs,
        pending_pages,
        history_pages,
        bucket_indices,
        global_index,
    }
}

/// Encrypt, sign, and publish every shard in a plan, in order, updating the
/// per-`d`-tag monotonic `created_at` map and `app.db` meta row as it goes.
/// `rev` and `publishedHash` are persisted *before* this runs (the Open
/// Question decision in DESIGN.md), so a crash mid-publish leaves exactly
/// the gap `repair` is built to close.
pub async fn execute_flush(
    client: &nostr_sdk::Client,
    dvm_keys: &nostr_sdk::Keys,
    secrets: &DerivedSecrets,
    pubkey: &str,
    appdata: &AppDataStore,
    mut meta: MailboxMeta,
    plan: FlushPlan,
) -> Result<(), String> {
    // Captured before `meta.published_relays_key` is overwritten below: per
    // spec.md:170 a relay-set change forces every shard to republish even if
    // its own (count, contentHash) is unchanged.
    let relays_changed = meta.published_relays_key != plan.relays_key;

    meta.rev = plan.new_rev;
    meta.published_rev = plan.new_rev;
    meta.published_hash = plan.new_hash;
    meta.published_relays_key = plan.relays_key;
    appdata.put_mailbox_meta(pubkey, &meta)?;

    for shard in plan
        .blobs
        .iter()
        .chain(plan.pending_pages.iter())
        .chain(plan.history_pages.iter())
        .chain(plan.bucket_indices.iter())
        .chain(std::iter::once(&plan.global_index))
    {
        if !relays_changed && shard_unchanged(appdata, pubkey, shard)? {
            continue;
        }
        publish_shard(client, dvm_keys, secrets, shard, &mut meta).await?;
        record_shard_state(appdata, pubkey, shard)?;
        appdata.put_mailbox_meta(pubkey, &meta)?;
    }

    Ok(())
}

/// spec.md:170's per-shard gate: true when this shard's already-recorded
/// `(count, contentHash)` matches what this flush would produce, so
/// publishing it again would be a no-op write.
fn shard_unchanged(appdata: &AppDataStore, pubkey: &str, shard: &ShardWrite) -> Result<bool, String> {
    match &shard.page_key {
        None => Ok(false),
        Some(PageKey::Page { bucket, page, count, hash }) => Ok(appdata
            .get_mailbox_page(pubkey, bucket, *page)?
            .is_some_and(|existing| existing.count == *count && existing.hash == *hash)),
        Some(PageKey::Blob { note_id, parts, bytes, hash }) => Ok(appdata
            .get_mailbox_blob(pubkey, note_id)?
            .is_some_and(|existing| existing.parts == *parts && existing.bytes == *bytes && existing.hash == *hash)),
    }
}

/// Record what was just published so the next flush's `shard_unchanged`
/// check has something to compare against.
fn record_shard_state(appdata: &AppDataStore, pubkey: &str, shard: &ShardWrite) -> Result<(), String> {
    match &shard.page_key {
        None => Ok(()),
        Some(PageKey::Page { bucket, page, count, hash }) => appdata.put_mailbox_page(&crate::db::appdata::MailboxPage {
            pubkey: pubkey.to_string(),
            bucket: bucket.clone(),
            page: *page,
            count: *count,
            hash: hash.clone(),
            updated_at: crate::util::now_secs() as i64,
        }),
        Some(PageKey::Blob { note_id, parts, bytes, hash }) => appdata.put_mailbox_blob(&crate::db::appdata::MailboxBlob {
            pubkey: pubkey.to_string(),
            note_id: note_id.clone(),
            parts: *parts,
            bytes: *bytes,
            hash: hash.clone(),
        }),
    }
}

pub(crate) async fn publish_shard(
    client: &nostr_sdk::Client,
    dvm_keys: &nostr_sdk::Keys,
    secrets: &DerivedSecrets,
    shard: &ShardWrite,
    meta: &mut MailboxMeta,
) -> Result<(), String> {
    use nostr_sdk::prelude::*;

    let key = match shard.kind {
        ShardKind::Mailbox => &secrets.mailbox_key,
        ShardKind::Blob => &secrets.blob_key,
    };
    let envelope = crate::crypto::encrypt(key, &shard.plaintext)?;
    let content = crate::util::bytes_to_hex(&envelope);

    let prior_created_at = meta.last_created_at_by_dtag.get(&shard.d_tag).copied().unwrap_or(0);
    let created_at = (crate::util::now_secs() as i64).max(prior_created_at + 1);

    let builder = EventBuilder::new(Kind::Custom(30078), content)
        .tag(Tag::identifier(shard.d_tag.clone()))
        .tag(Tag::custom(TagKind::custom("k"), vec!["3".to_string()]))
        .custom_created_at(Timestamp::from(created_at as u64));

    client
        .send_event_builder(builder)
        .await
        .map_err(|e| format!("publish shard {}: {}", shard.d_tag, e))?;

    meta.last_created_at_by_dtag.insert(shard.d_tag.clone(), created_at);
    let _ = dvm_keys;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str, status: JobStatus, updated_at: i64) -> Job {
        use crate::db::jobs::{NoteJob, Payload};
        Job {
            id: id.to_string(),
            requester_pubkey: "u".to_string(),
            dvm_pubkey: "d".to_string(),
            relays: vec![],
            scheduled_at: updated_at,
            created_at: updated_at,
            updated_at,
            status,
            payload: Payload::Note(NoteJob {
                inner_event_json: "{}".to_string(),
                kind: 1,
                has_quote_tag: false,
            }),
            last_error: None,
        }
    }

    #[test]
    fn change_hash_short_circuits_identical_state() {
        let meta = MailboxMeta::default();
        let relays = vec!["wss://r1".to_string()];
        let capsules = serde_json::json!({});
        let support = serde_json::json!({});
        let pending = vec![sample_job("j1", JobStatus::Scheduled, 100)];

        let plan = plan_flush("mb1", &meta, &pending, &[], &relays, &capsules, &support).expect("first flush publishes");
        let mut meta2 = meta.clone();
        meta2.rev = plan.new_rev;
        meta2.published_hash = plan.new_hash.clone();
        meta2.published_relays_key = plan.relays_key.clone();

        let second = plan_flush("mb1", &meta2, &pending, &[], &relays, &capsules, &support);
        assert!(second.is_none(), "unchanged state must not produce a second publish");
    }

    #[test]
    fn rev_advances_by_exactly_one() {
        let meta = MailboxMeta { rev: 5, ..Default::default() };
        let relays = vec!["wss://r1".to_string()];
        let plan = plan_flush(
            "mb1",
            &meta,
            &[sample_job("j1", JobStatus::Scheduled, 1)],
            &[],
            &relays,
            &serde_json::json!({}),
            &serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(plan.new_rev, 6);
    }

    #[test]
    fn publish_order_is_blobs_then_pending_then_history_then_buckets_then_index() {
        let meta = MailboxMeta::default();
        let relays = vec!["wss://r1".to_string()];
        let pending = vec![sample_job("j1", JobStatus::Scheduled, 1)];
        let terminal = vec![sample_job("j2", JobStatus::Sent, 2)];
        let plan = plan_flush("mb1", &meta, &pending, &terminal, &relays, &serde_json::json!({}), &serde_json::json!({})).unwrap();
        let order = plan.ordered_d_tags();
        assert_eq!(order.last().unwrap(), &plan.global_index.d_tag.as_str());
        let index_pos = order.iter().position(|d| *d == plan.global_index.d_tag).unwrap();
        for tag in order.iter() {
            if plan.bucket_indices.iter().any(|b| &b.d_tag == tag) {
                let pos = order.iter().position(|d| d == tag).unwrap();
                assert!(pos < index_pos);
            }
        }
    }

    #[test]
    fn oversized_item_produces_blob_shards_and_stub() {
        use crate::db::jobs::{NoteJob, Payload};
        let meta = MailboxMeta::default();
        let inner = serde_json::json!({
            "id": "a".repeat(64),
            "pubkey": "b".repeat(64),
            "created_at": 1,
            "kind": 1,
            "tags": [],
            "content": "x".repeat(60_000),
            "sig": "c".repeat(128),
        })
        .to_string();
        let mut job = sample_job("bignote", JobStatus::Scheduled, 1);
        job.payload = Payload::Note(NoteJob {
            inner_event_json: inner,
            kind: 1,
            has_quote_tag: false,
        });

        let plan = plan_flush(
            "mb1",
            &meta,
            &[job],
            &[],
            &[],
            &serde_json::json!({}),
            &serde_json::json!({}),
        )
        .expect("oversized flush still publishes");

        assert!(!plan.blobs.is_empty(), "oversized note must shard into blobs");
        for blob in &plan.blobs {
            assert!(blob.plaintext.len() <= BLOB_CHUNK_BYTES);
            assert!(blob.d_tag.contains(":blob:bignote:"));
        }

        let stub_page = &plan.pending_pages[0];
        let stub_json: serde_json::Value = serde_json::from_slice(&stub_page.plaintext).unwrap();
        let items = stub_json["items"].as_array().unwrap();
        let stub = items.iter().find(|i| i["id"] == "bignote").expect("stub present");
        assert_eq!(stub["noteBlob"]["parts"], plan.blobs.len());
        assert!(estimated_final_size(stub_page.plaintext.len()) <= HARD_EVENT_CAP_BYTES);
    }

    #[test]
    fn unchanged_pending_page_is_skipped_but_changed_history_page_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let appdata = crate::db::AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();

        let meta = MailboxMeta::default();
        let relays = vec!["wss://r1".to_string()];
        let pending = vec![sample_job("j1", JobStatus::Scheduled, 1)];
        let terminal = vec![sample_job("j2", JobStatus::Sent, 2)];
        let plan = plan_flush("mb1", &meta, &pending, &terminal, &relays, &serde_json::json!({}), &serde_json::json!({})).unwrap();

        // Record the pending page's state as already published (unchanged);
        // leave the history page unrecorded (first-time publish).
        let pending_page = &plan.pending_pages[0];
        if let Some(PageKey::Page { bucket, page, count, hash }) = &pending_page.page_key {
            record_shard_state_for_test(&appdata, "pk1", bucket, *page, *count, hash);
        }

        assert!(shard_unchanged(&appdata, "pk1", pending_page).unwrap(), "identical page must be skipped");
        assert!(
            !shard_unchanged(&appdata, "pk1", &plan.history_pages[0]).unwrap(),
            "never-recorded history page must still publish"
        );
        // Shards with no page_key (bucket index, global index) always republish.
        assert!(!shard_unchanged(&appdata, "pk1", &plan.global_index).unwrap());
    }

    #[test]
    fn record_shard_state_then_matches_shard_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let appdata = crate::db::AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();

        let meta = MailboxMeta::default();
        let relays = vec!["wss://r1".to_string()];
        let pending = vec![sample_job("j1", JobStatus::Scheduled, 1)];
        let plan = plan_flush("mb1", &meta, &pending, &[], &relays, &serde_json::json!({}), &serde_json::json!({})).unwrap();

        let pending_page = &plan.pending_pages[0];
        assert!(!shard_unchanged(&appdata, "pk1", pending_page).unwrap(), "nothing recorded yet");
        record_shard_state(&appdata, "pk1", pending_page).unwrap();
        assert!(shard_unchanged(&appdata, "pk1", pending_page).unwrap(), "matches what was just recorded");
    }

    fn record_shard_state_for_test(appdata: &AppDataStore, pubkey: &str, bucket: &str, page: u32, count: u32, hash: &str) {
        appdata
            .put_mailbox_page(&crate::db::appdata::MailboxPage {
                pubkey: pubkey.to_string(),
                bucket: bucket.to_string(),
                page,
                count,
                hash: hash.to_string(),
                updated_at: 1,
            })
            .unwrap();
    }
}
