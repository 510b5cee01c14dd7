//! Mailbox repair: probe a user's expected shard `d`-tags across the
//! configured relays and republish only the ones that come back empty
//! everywhere, per spec.md §4.7. Never advances `rev` — a repair is a
//! liveness fix, not a content change.

use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::db::jobs::JobStatus;
use crate::db::{AppDataStore, JobsStore};
use crate::mailbox::index;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire off a background repair for `pubkey`. `scope` is currently
/// informational (full mailbox vs a single bucket); both probe the same
/// shard set today since pages are cheap to re-check.
pub fn enqueue_repair(pubkey: String, scope: String) {
    tokio::spawn(async move {
        if let Err(e) = repair_mailbox(&pubkey, &scope).await {
            eprintln!("[Mailbox] repair failed for {} ({}): {}", pubkey, scope, e);
        }
    });
}

pub async fn repair_mailbox(pubkey: &str, _scope: &str) -> Result<(), String> {
    let jobs = crate::state::jobs_store();
    let appdata = crate::state::appdata_store();

    let user_pk = PublicKey::parse(pubkey).map_err(|e| format!("bad pubkey {}: {}", pubkey, e))?;
    let secrets = crate::kd::derive_for_user(&user_pk, crate::state::dvm_keys())?;
    let mb = crate::kd::mb_to_string(&secrets.mb);

    let meta = appdata.get_mailbox_meta(pubkey)?;
    let expected_tags = expected_d_tags(&mb, &meta);
    if expected_tags.is_empty() {
        return Ok(());
    }

    let cfg = crate::state::config();
    let relays = if !cfg.publish_relays.is_empty() { cfg.publish_relays.clone() } else { cfg.relays.clone() };

    let probe = probe_missing(&expected_tags, &relays).await?;
    if !probe.unknown.is_empty() {
        eprintln!(
            "[Mailbox] repair for {}: {} shard(s) unknown (no relay responded), not republishing",
            pubkey,
            probe.unknown.len()
        );
    }
    if probe.missing.is_empty() {
        return Ok(());
    }
    eprintln!("[Mailbox] repair for {}: {} shard(s) missing, republishing", pubkey, probe.missing.len());

    let plan = build_repair_plan(jobs, appdata, &mb, &meta, pubkey, &relays).await?;
    republish_missing(&plan, &probe.missing, &secrets, pubkey, meta, appdata).await
}

/// Every `d`-tag this mailbox is expected to currently have a live event
/// under: whatever we last recorded a `created_at` for, plus the global
/// index (always expected once anything has ever been published).
fn expected_d_tags(mb: &str, meta: &crate::db::appdata::MailboxMeta) -> Vec<String> {
    let mut tags: Vec<String> = meta.last_created_at_by_dtag.keys().cloned().collect();
    let index_tag = format!("pidgeon:v3:mb:{}:index", mb);
    if !tags.contains(&index_tag) && meta.published_rev > 0 {
        tags.push(index_tag);
    }
    tags
}

/// Outcome of probing expected shard `d`-tags against the repair relay set.
struct ProbeResult {
    /// At least one relay responded and none of them had this tag.
    missing: Vec<String>,
    /// No relay responded at all — status unknown, must not be republished.
    unknown: Vec<String>,
}

/// Query the DVM's own kind-30078 events for these `d`-tags, one relay at a
/// time, so an unresponsive relay can't make everything look missing. A tag
/// is `missing` only once at least one relay has actually answered and none
/// of the relays that answered returned it; if every relay failed or timed
/// out the whole batch is `unknown` instead (spec.md §4.7).
async fn probe_missing(expected: &[String], relays: &[String]) -> Result<ProbeResult, String> {
    let client = crate::state::nostr_client();
    let dvm_pubkey = crate::state::dvm_keys().public_key();

    let filter = Filter::new()
        .author(dvm_pubkey)
        .kind(Kind::Custom(30078))
        .custom_tag(SingleLetterTag::lowercase(Alphabet::D), expected.to_vec());

    let mut present: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut any_responded = false;

    for relay in relays {
        match client.fetch_events_from(vec![relay.clone()], filter.clone(), PROBE_TIMEOUT).await {
            Ok(events) => {
                any_responded = true;
                for event in &events {
                    for tag in event.tags.iter() {
                        let values: Vec<&str> = tag.as_slice().iter().map(|s| s.as_str()).collect();
                        if values.len() >= 2 && values[0] == "d" {
                            present.insert(values[1].to_string());
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("[Mailbox] probe relay {} failed: {}", relay, e);
            }
        }
    }

    if !any_responded {
        return Ok(ProbeResult { missing: Vec::new(), unknown: expected.to_vec() });
    }

    let missing = expected.iter().filter(|t| !present.contains(*t)).cloned().collect();
    Ok(ProbeResult { missing, unknown: Vec::new() })
}

async fn build_repair_plan(
    jobs: &JobsStore,
    appdata: &AppDataStore,
    mb: &str,
    meta: &crate::db::appdata::MailboxMeta,
    pubkey: &str,
    relays: &[String],
) -> Result<index::FlushPlan, String> {
    let all = jobs.list_by_requester(pubkey)?;
    let pending: Vec<_> = all.iter().cloned().filter(|j| j.status == JobStatus::Scheduled).collect();
    let terminal: Vec<_> = all.into_iter().filter(|j| j.status != JobStatus::Scheduled).collect();
    let support_state = appdata.get_support_state(pubkey)?;
    let support_json = serde_json::to_value(&support_state).map_err(|e| e.to_string())?;
    let capsules = meta.preview_key_capsules.clone();
    Ok(index::repair_plan(mb, meta, &pending, &terminal, relays, &capsules, &support_json))
}

/// Publish only the shards whose `d`-tag was found missing, using the
/// repair plan's recomputed content for that tag. `meta` is updated in
/// place for `last_created_at_by_dtag` only — `rev`/`published_hash` are
/// left untouched.
async fn republish_missing(
    plan: &index::FlushPlan,
    missing: &[String],
    secrets: &crate::kd::DerivedSecrets,
    pubkey: &str,
    mut meta: crate::db::appdata::MailboxMeta,
    appdata: &AppDataStore,
) -> Result<(), String> {
    let client = crate::state::nostr_client();
    let dvm_keys = crate::state::dvm_keys();

    let all_shards: Vec<&index::ShardWrite> = plan
        .blobs
        .iter()
        .chain(plan.pending_pages.iter())
        .chain(plan.history_pages.iter())
        .chain(plan.bucket_indices.iter())
        .chain(std::iter::once(&plan.global_index))
        .collect();

    for shard in all_shards {
        if !missing.contains(&shard.d_tag) {
            continue;
        }
        index::publish_shard(client, dvm_keys, secrets, shard, &mut meta).await?;
    }

    appdata.put_mailbox_meta(pubkey, &meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::appdata::MailboxMeta;

    #[test]
    fn expected_tags_always_include_index_once_published() {
        let mut meta = MailboxMeta::default();
        meta.published_rev = 2;
        meta.last_created_at_by_dtag.insert("pidgeon:v3:mb:abc:pending:0".to_string(), 10);
        let tags = expected_d_tags("abc", &meta);
        assert!(tags.contains(&"pidgeon:v3:mb:abc:index".to_string()));
        assert!(tags.contains(&"pidgeon:v3:mb:abc:pending:0".to_string()));
    }

    #[test]
    fn no_expected_tags_before_first_publish() {
        let meta = MailboxMeta::default();
        assert!(expected_d_tags("abc", &meta).is_empty());
    }
}
