//! Bootstrap + Metadata: publishes the DVM's own profile, relay list and
//! NIP-89 handler info at startup, and does a best-effort check that the
//! DVM's relays actually support `#d`-tag filters (mailbox repair and the
//! mailbox flush path both depend on that).
//!
//! Grounded in the shard-publish idiom from `mailbox::index::publish_shard`
//! (`EventBuilder` + `client.send_event_builder`, signed by the client's own
//! configured signer).

use nostr_sdk::prelude::*;

use crate::config::Config;

const HANDLER_D_TAG: &str = "pidgeon-dvm";

/// Inner kinds the DVM accepts as gift-wrapped requests, per §6.
const SUPPORTED_REQUEST_KINDS: &[u16] = &[5901, 5905, 5906, 5907, 5908, 5910];

/// Publish profile (kind 0), relay list (kind 10002) and handler info
/// (kind 31990). Failures are logged but never abort startup — a DVM with
/// stale/missing metadata can still serve requests it's already subscribed
/// to receive.
pub async fn publish_bootstrap_metadata(client: &Client, config: &Config) {
    if let Err(e) = publish_profile(client, config).await {
        eprintln!("[Metadata] profile publish failed: {}", e);
    }
    if let Err(e) = publish_relay_list(client, config).await {
        eprintln!("[Metadata] relay list publish failed: {}", e);
    }
    if let Err(e) = publish_handler_info(client, config).await {
        eprintln!("[Metadata] handler info publish failed: {}", e);
    }
}

async fn publish_profile(client: &Client, config: &Config) -> Result<(), String> {
    let content = serde_json::json!({
        "name": config.name,
        "about": config.about,
        "picture": config.picture,
    });
    let builder = EventBuilder::new(Kind::Metadata, content.to_string());
    client
        .send_event_builder(builder)
        .await
        .map_err(|e| format!("send kind:0: {}", e))?;
    Ok(())
}

async fn publish_relay_list(client: &Client, config: &Config) -> Result<(), String> {
    let mut builder = EventBuilder::new(Kind::Custom(10002), "");
    for relay in &config.relays {
        builder = builder.tag(Tag::custom(TagKind::custom("r"), vec![relay.clone()]));
    }
    client
        .send_event_builder(builder)
        .await
        .map_err(|e| format!("send kind:10002: {}", e))?;
    Ok(())
}

async fn publish_handler_info(client: &Client, config: &Config) -> Result<(), String> {
    let content = serde_json::json!({
        "name": config.name,
        "about": config.about,
        "picture": config.picture,
    });
    let mut builder = EventBuilder::new(Kind::Custom(31990), content.to_string())
        .tag(Tag::identifier(HANDLER_D_TAG));
    for kind in SUPPORTED_REQUEST_KINDS {
        builder = builder.tag(Tag::custom(TagKind::custom("k"), vec![kind.to_string()]));
    }
    client
        .send_event_builder(builder)
        .await
        .map_err(|e| format!("send kind:31990: {}", e))?;
    Ok(())
}

/// Best-effort warning if a DVM relay doesn't answer a `#d`-tag filter
/// query at all (some older relay implementations ignore it entirely and
/// just return nothing, which is otherwise indistinguishable from "no
/// shard published yet").
pub async fn probe_d_tag_filter_support(client: &Client, relays: &[String]) {
    let probe_id = format!("pidgeon-probe-{}", crate::util::now_ms());
    let filter = Filter::new()
        .kind(Kind::Custom(30078))
        .custom_tag(SingleLetterTag::lowercase(Alphabet::D), vec![probe_id])
        .limit(1);
    for relay in relays {
        let timeout = std::time::Duration::from_secs(2);
        let result = client
            .fetch_events_from(vec![relay.clone()], filter.clone(), timeout)
            .await;
        if result.is_err() {
            eprintln!("[Metadata] relay {} did not answer #d-filter probe, mailbox repair may be unreliable there", relay);
        }
    }
}
