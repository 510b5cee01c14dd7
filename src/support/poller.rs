//! Background LNURL-verify poller, per spec.md §4.8 step 2-3.
//!
//! One task wakes every `verify_poll_sec`, visits every invoice still
//! `pending` whose last check (or creation) is older than that interval,
//! and GETs its `verify` URL. A settlement bumps `supporterUntil` and
//! flushes the user's mailbox; an invoice past `expiresAt` with no
//! settlement is marked `expired`. Mirrors the fixed-interval-task shape of
//! `mailbox::flush`'s worker loop but driven by a timer instead of a channel.

use std::sync::Arc;
use std::time::Duration;

use crate::db::AppDataStore;
use crate::support::gate::SupportPolicy;
use crate::support::lnurl::{self, InvoiceStatus, SupportInvoice};

/// Spawn the poller loop. No-op (never spawns) when payment is disabled —
/// there are no invoices to poll in that mode.
pub fn spawn(appdata: Arc<AppDataStore>, policy: Arc<SupportPolicy>, loadtest: bool) {
    if policy.payment_mode != "lnurl_verify" {
        return;
    }
    tokio::spawn(async move {
        let interval = Duration::from_secs(policy.verify_poll_sec.max(1));
        loop {
            tokio::time::sleep(interval).await;
            poll_once(&appdata, &policy, loadtest).await;
        }
    });
}

async fn poll_once(appdata: &AppDataStore, policy: &SupportPolicy, loadtest: bool) {
    let cutoff = crate::util::now_secs().saturating_sub(policy.verify_poll_sec);
    let pending = match appdata.pending_invoices_older_than(cutoff) {
        Ok(invoices) => invoices,
        Err(e) => {
            eprintln!("[Support] failed to list pending invoices: {}", e);
            return;
        }
    };

    for invoice in pending {
        if let Err(e) = check_one(appdata, policy, loadtest, &invoice).await {
            eprintln!("[Support] invoice {} check failed: {}", invoice.id, e);
            let _ = appdata.touch_invoice_check(&invoice.id, Some(&e));
        }
    }
}

async fn check_one(
    appdata: &AppDataStore,
    policy: &SupportPolicy,
    loadtest: bool,
    invoice: &SupportInvoice,
) -> Result<(), String> {
    let timeout = Duration::from_millis(policy.verify_timeout_ms);
    match lnurl::poll_verify(&invoice.verify_url, loadtest, timeout).await {
        Ok(Some(preimage)) => settle(appdata, policy, invoice, preimage),
        Ok(None) => {
            let now = crate::util::now_secs();
            if now >= invoice.expires_at {
                appdata.mark_invoice_status(&invoice.id, InvoiceStatus::Expired, None, None)
            } else {
                appdata.touch_invoice_check(&invoice.id, None)
            }
        }
        Err(e) => Err(e),
    }
}

fn settle(
    appdata: &AppDataStore,
    policy: &SupportPolicy,
    invoice: &SupportInvoice,
    preimage: String,
) -> Result<(), String> {
    let now = crate::util::now_secs();
    appdata.mark_invoice_status(&invoice.id, InvoiceStatus::Settled, Some(&preimage), Some(now))?;

    if invoice.sats >= policy.min_sats {
        appdata.mutate_support_state(&invoice.pubkey, |state| {
            state.supporter_until = now as i64 + policy.supporter_days * 86_400;
        })?;
    }

    crate::mailbox::flush::queue_mailbox_publish(&invoice.pubkey);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SupportPolicy {
        SupportPolicy {
            horizon_days: 0,
            window_schedules: 10,
            gated_features: vec![],
            lud16: String::new(),
            cta_message: String::new(),
            payment_mode: "lnurl_verify".to_string(),
            invoice_sats: 1000,
            min_sats: 1000,
            supporter_days: 30,
            invoice_ttl_sec: 900,
            verify_poll_sec: 30,
            verify_timeout_ms: 5000,
        }
    }

    #[test]
    fn settle_bumps_supporter_until_when_sats_meet_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let appdata = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        let policy = policy();
        let invoice = SupportInvoice {
            id: "inv1".to_string(),
            pubkey: "pk1".to_string(),
            pr: "lnbc1".to_string(),
            verify_url: "https://example.com/verify".to_string(),
            sats: 1000,
            status: InvoiceStatus::Pending,
            created_at: crate::util::now_secs(),
            expires_at: crate::util::now_secs() + 900,
            settled_at: None,
            preimage: None,
            last_check_at: None,
            last_error: None,
        };
        appdata.insert_invoice(&invoice).unwrap();

        settle(&appdata, &policy, &invoice, "preimg".to_string()).unwrap();

        let state = appdata.get_support_state("pk1").unwrap();
        assert!(state.supporter_until > crate::util::now_secs() as i64);
        assert!(appdata.active_invoice("pk1").unwrap().is_none());
    }

    #[test]
    fn settle_skips_supporter_bump_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let appdata = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        let mut policy = policy();
        policy.min_sats = 5000;
        let invoice = SupportInvoice {
            id: "inv2".to_string(),
            pubkey: "pk2".to_string(),
            pr: "lnbc1".to_string(),
            verify_url: "https://example.com/verify".to_string(),
            sats: 1000,
            status: InvoiceStatus::Pending,
            created_at: crate::util::now_secs(),
            expires_at: crate::util::now_secs() + 900,
            settled_at: None,
            preimage: None,
            last_check_at: None,
            last_error: None,
        };
        appdata.insert_invoice(&invoice).unwrap();

        settle(&appdata, &policy, &invoice, "preimg".to_string()).unwrap();

        let state = appdata.get_support_state("pk2").unwrap();
        assert_eq!(state.supporter_until, 0);
    }
}
