//! NIP-17 kind-10050 (DM Relay List) lookup.
//!
//! Fetches and caches recipients' inbox relay lists so DM gift-wraps are
//! delivered where they're actually watching, with a pool-broadcast fallback
//! when no list is on file.

use std::time::Duration;

use nostr_sdk::prelude::*;
use once_cell::sync::Lazy;

use crate::cache::TtlCache;

const CACHE_TTL_OK_SECS: u64 = 3600;
const CACHE_TTL_ERROR_SECS: u64 = 60;
const CACHE_CAPACITY: usize = 10_000;

static INBOX_RELAY_CACHE: Lazy<TtlCache<PublicKey, Vec<String>>> = Lazy::new(|| {
    TtlCache::new(
        Duration::from_secs(CACHE_TTL_OK_SECS),
        Duration::from_secs(CACHE_TTL_ERROR_SECS),
        CACHE_CAPACITY,
    )
});

struct FetchResult {
    relays: Vec<String>,
    fetch_ok: bool,
}

/// Fetch a pubkey's kind 10050 relay list from the network.
async fn fetch_inbox_relays(client: &Client, pubkey: &PublicKey) -> FetchResult {
    let filter = Filter::new().author(*pubkey).kind(Kind::Custom(10050)).limit(1);

    let events = match client.fetch_events(filter, Duration::from_secs(5)).await {
        Ok(events) => events,
        Err(e) => {
            eprintln!("[InboxRelays] fetch 10050 failed for {}: {}", pubkey, e);
            return FetchResult { relays: Vec::new(), fetch_ok: false };
        }
    };

    let event = match events.into_iter().next() {
        Some(e) => e,
        None => return FetchResult { relays: Vec::new(), fetch_ok: true },
    };

    FetchResult { relays: parse_relay_tags(&event.tags), fetch_ok: true }
}

/// Extract relay URLs from kind 10050 event tags: `["relay", "wss://..."]`.
fn parse_relay_tags(tags: &Tags) -> Vec<String> {
    tags.iter()
        .filter_map(|tag| {
            let values: Vec<&str> = tag.as_slice().iter().map(|s| s.as_str()).collect();
            if values.len() >= 2 && values[0] == "relay" {
                Some(values[1].to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Get inbox relays for a pubkey, using the cache when available.
pub async fn get_or_fetch_inbox_relays(client: &Client, pubkey: &PublicKey) -> Vec<String> {
    if let Some(cached) = INBOX_RELAY_CACHE.get(pubkey) {
        return cached;
    }

    let result = fetch_inbox_relays(client, pubkey).await;
    INBOX_RELAY_CACHE.insert(*pubkey, result.relays.clone(), result.fetch_ok);
    result.relays
}

/// Send a gift-wrapped rumor to a recipient, routing to their inbox relays
/// (kind 10050) when available. Falls back to pool broadcast if no inbox
/// relays are found or if targeted delivery fails entirely.
pub async fn send_gift_wrap(
    client: &Client,
    recipient: &PublicKey,
    rumor: UnsignedEvent,
    extra_tags: impl IntoIterator<Item = Tag>,
) -> Result<Output<EventId>, Error> {
    let inbox = get_or_fetch_inbox_relays(client, recipient).await;

    if inbox.is_empty() {
        return client.gift_wrap(recipient, rumor, extra_tags).await;
    }

    let tags: Vec<Tag> = extra_tags.into_iter().collect();

    match client.gift_wrap_to(inbox, recipient, rumor.clone(), tags.clone()).await {
        Ok(output) if !output.success.is_empty() => Ok(output),
        Ok(_) => {
            eprintln!(
                "[InboxRelays] all inbox relays failed for {}, falling back to pool broadcast",
                recipient
            );
            client.gift_wrap(recipient, rumor, tags).await
        }
        Err(e) => {
            eprintln!(
                "[InboxRelays] gift_wrap_to error for {}: {}, falling back to pool broadcast",
                recipient, e
            );
            client.gift_wrap(recipient, rumor, tags).await
        }
    }
}
