//! AppData Store: mailbox meta/pages/blobs, support state, and support
//! invoices — everything in `app.db` per spec.md §3/§6.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use crate::support::gate::SupportState;
use crate::support::lnurl::{InvoiceStatus, SupportInvoice};

use super::pool::{Database, Migration};

#[derive(Debug, Clone, Default)]
pub struct MailboxMeta {
    pub rev: u64,
    pub published_rev: u64,
    pub published_relays_key: String,
    pub published_hash: String,
    pub last_created_at_by_dtag: HashMap<String, i64>,
    pub preview_key_capsules: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MailboxPage {
    pub pubkey: String,
    pub bucket: String,
    pub page: u32,
    pub count: u32,
    pub hash: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct MailboxBlob {
    pub pubkey: String,
    pub note_id: String,
    pub parts: u32,
    pub bytes: u64,
    pub hash: String,
}

pub struct AppDataStore {
    db: Database,
}

fn migrations() -> Vec<Migration> {
    vec![Migration {
        id: 1,
        name: "create_appdata_tables",
        migrate: |conn| {
            conn.execute_batch(
                "CREATE TABLE mailbox_meta (
                    pubkey TEXT PRIMARY KEY,
                    rev INTEGER NOT NULL DEFAULT 0,
                    published_rev INTEGER NOT NULL DEFAULT 0,
                    published_relays_key TEXT NOT NULL DEFAULT '',
                    published_hash TEXT NOT NULL DEFAULT '',
                    last_created_at_by_dtag TEXT NOT NULL DEFAULT '{}',
                    preview_key_capsules TEXT NOT NULL DEFAULT '{}'
                );
                CREATE TABLE mailbox_pages (
                    pubkey TEXT NOT NULL,
                    bucket TEXT NOT NULL,
                    page INTEGER NOT NULL,
                    count INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (pubkey, bucket, page)
                );
                CREATE TABLE mailbox_blobs (
                    pubkey TEXT NOT NULL,
                    note_id TEXT NOT NULL,
                    parts INTEGER NOT NULL,
                    bytes INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    PRIMARY KEY (pubkey, note_id)
                );
                CREATE TABLE support_state (
                    pubkey TEXT PRIMARY KEY,
                    schedule_count INTEGER NOT NULL DEFAULT 0,
                    free_until_count INTEGER NOT NULL DEFAULT 0,
                    next_prompt_at_count INTEGER,
                    supporter_until INTEGER NOT NULL DEFAULT 0,
                    gate_prompt TEXT
                );
                CREATE TABLE support_invoices (
                    id TEXT PRIMARY KEY,
                    pubkey TEXT NOT NULL,
                    pr TEXT NOT NULL,
                    verify_url TEXT NOT NULL,
                    sats INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    settled_at INTEGER,
                    preimage TEXT,
                    last_check_at INTEGER,
                    last_error TEXT
                );
                CREATE INDEX idx_invoices_pubkey_status ON support_invoices (pubkey, status);",
            )
            .map_err(|e| e.to_string())
        },
    }]
}

fn status_to_str(status: InvoiceStatus) -> &'static str {
    match status {
        InvoiceStatus::Pending => "pending",
        InvoiceStatus::Settled => "settled",
        InvoiceStatus::Expired => "expired",
        InvoiceStatus::Canceled => "canceled",
        InvoiceStatus::Error => "error",
    }
}

fn status_from_str(s: &str) -> InvoiceStatus {
    match s {
        "settled" => InvoiceStatus::Settled,
        "expired" => InvoiceStatus::Expired,
        "canceled" => InvoiceStatus::Canceled,
        "error" => InvoiceStatus::Error,
        _ => InvoiceStatus::Pending,
    }
}

fn row_to_invoice(row: &rusqlite::Row) -> rusqlite::Result<SupportInvoice> {
    let status_str: String = row.get("status")?;
    Ok(SupportInvoice {
        id: row.get("id")?,
        pubkey: row.get("pubkey")?,
        pr: row.get("pr")?,
        verify_url: row.get("verify_url")?,
        sats: row.get::<_, i64>("sats")? as u64,
        status: status_from_str(&status_str),
        created_at: row.get::<_, i64>("created_at")? as u64,
        expires_at: row.get::<_, i64>("expires_at")? as u64,
        settled_at: row.get::<_, Option<i64>>("settled_at")?.map(|v| v as u64),
        preimage: row.get("preimage")?,
        last_check_at: row.get::<_, Option<i64>>("last_check_at")?.map(|v| v as u64),
        last_error: row.get("last_error")?,
    })
}

impl AppDataStore {
    pub fn open(path: &std::path::Path, read_pool_size: usize) -> Result<AppDataStore, String> {
        let db = Database::open(path, read_pool_size)?;
        {
            let mut conn = db.write()?;
            super::pool::run_migrations(&mut conn, &migrations())?;
        }
        Ok(AppDataStore { db })
    }

    // ---- Mailbox meta ----------------------------------------------------

    pub fn get_mailbox_meta(&self, pubkey: &str) -> Result<MailboxMeta, String> {
        let conn = self.db.read()?;
        let row = conn
            .query_row(
                "SELECT rev, published_rev, published_relays_key, published_hash,
                        last_created_at_by_dtag, preview_key_capsules
                 FROM mailbox_meta WHERE pubkey = ?1",
                params![pubkey],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;

        let Some((rev, published_rev, relays_key, hash, dtag_json, capsules_json)) = row else {
            return Ok(MailboxMeta::default());
        };
        Ok(MailboxMeta {
            rev: rev as u64,
            published_rev: published_rev as u64,
            published_relays_key: relays_key,
            published_hash: hash,
            last_created_at_by_dtag: serde_json::from_str(&dtag_json).unwrap_or_default(),
            preview_key_capsules: serde_json::from_str(&capsules_json).unwrap_or(serde_json::json!({})),
        })
    }

    pub fn put_mailbox_meta(&self, pubkey: &str, meta: &MailboxMeta) -> Result<(), String> {
        let conn = self.db.write()?;
        let dtag_json = serde_json::to_string(&meta.last_created_at_by_dtag).map_err(|e| e.to_string())?;
        let capsules_json = serde_json::to_string(&meta.preview_key_capsules).map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO mailbox_meta
             (pubkey, rev, published_rev, published_relays_key, published_hash, last_created_at_by_dtag, preview_key_capsules)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(pubkey) DO UPDATE SET
               rev = excluded.rev,
               published_rev = excluded.published_rev,
               published_relays_key = excluded.published_relays_key,
               published_hash = excluded.published_hash,
               last_created_at_by_dtag = excluded.last_created_at_by_dtag,
               preview_key_capsules = excluded.preview_key_capsules",
            params![
                pubkey,
                meta.rev as i64,
                meta.published_rev as i64,
                meta.published_relays_key,
                meta.published_hash,
                dtag_json,
                capsules_json,
            ],
        )
        .map_err(|e| format!("put mailbox meta {}: {}", pubkey, e))?;
        Ok(())
    }

    // ---- Mailbox pages / blobs --------------------------------------------

    pub fn put_mailbox_page(&self, page: &MailboxPage) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute(
            "INSERT INTO mailbox_pages (pubkey, bucket, page, count, hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(pubkey, bucket, page) DO UPDATE SET
               count = excluded.count, hash = excluded.hash, updated_at = excluded.updated_at",
            params![page.pubkey, page.bucket, page.page, page.count, page.hash, page.updated_at],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// The recorded `(count, hash)` for a single page, if this mailbox has
    /// ever published one under `(bucket, page)` — the gate `mailbox/index.rs`
    /// checks before deciding whether a page needs republishing.
    pub fn get_mailbox_page(&self, pubkey: &str, bucket: &str, page: u32) -> Result<Option<MailboxPage>, String> {
        let conn = self.db.read()?;
        conn.query_row(
            "SELECT pubkey, bucket, page, count, hash, updated_at FROM mailbox_pages
             WHERE pubkey = ?1 AND bucket = ?2 AND page = ?3",
            params![pubkey, bucket, page],
            |row| {
                Ok(MailboxPage {
                    pubkey: row.get(0)?,
                    bucket: row.get(1)?,
                    page: row.get(2)?,
                    count: row.get(3)?,
                    hash: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| e.to_string())
    }

    pub fn list_mailbox_pages(&self, pubkey: &str, bucket: &str) -> Result<Vec<MailboxPage>, String> {
        let conn = self.db.read()?;
        let mut stmt = conn
            .prepare("SELECT pubkey, bucket, page, count, hash, updated_at FROM mailbox_pages WHERE pubkey = ?1 AND bucket = ?2 ORDER BY page ASC")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![pubkey, bucket], |row| {
                Ok(MailboxPage {
                    pubkey: row.get(0)?,
                    bucket: row.get(1)?,
                    page: row.get(2)?,
                    count: row.get(3)?,
                    hash: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    pub fn put_mailbox_blob(&self, blob: &MailboxBlob) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute(
            "INSERT INTO mailbox_blobs (pubkey, note_id, parts, bytes, hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pubkey, note_id) DO UPDATE SET
               parts = excluded.parts, bytes = excluded.bytes, hash = excluded.hash",
            params![blob.pubkey, blob.note_id, blob.parts, blob.bytes as i64, blob.hash],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// The recorded blob manifest for one oversized pending item, if any.
    pub fn get_mailbox_blob(&self, pubkey: &str, note_id: &str) -> Result<Option<MailboxBlob>, String> {
        let conn = self.db.read()?;
        conn.query_row(
            "SELECT pubkey, note_id, parts, bytes, hash FROM mailbox_blobs WHERE pubkey = ?1 AND note_id = ?2",
            params![pubkey, note_id],
            |row| {
                Ok(MailboxBlob {
                    pubkey: row.get(0)?,
                    note_id: row.get(1)?,
                    parts: row.get(2)?,
                    bytes: row.get::<_, i64>(3)? as u64,
                    hash: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| e.to_string())
    }

    // ---- Support state -----------------------------------------------------

    /// Transactional read-modify-write under `BEGIN IMMEDIATE`, preventing
    /// lost updates across concurrent gate evaluations for the same user.
    /// `f` may return an arbitrary value (e.g. a gate decision) alongside
    /// the mutation so callers don't need a second round-trip to learn what
    /// happened.
    pub fn mutate_support_state_with<F, R>(&self, pubkey: &str, f: F) -> Result<(SupportState, R), String>
    where
        F: FnOnce(&mut SupportState) -> R,
    {
        let mut conn = self.db.write()?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| e.to_string())?;

        let mut state = tx
            .query_row(
                "SELECT schedule_count, free_until_count, next_prompt_at_count, supporter_until, gate_prompt
                 FROM support_state WHERE pubkey = ?1",
                params![pubkey],
                |row| {
                    Ok(SupportState {
                        schedule_count: row.get::<_, i64>(0)? as u64,
                        free_until_count: row.get::<_, i64>(1)? as u64,
                        next_prompt_at_count: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                        supporter_until: row.get(3)?,
                        gate_prompt: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();

        let result = f(&mut state);

        tx.execute(
            "INSERT INTO support_state (pubkey, schedule_count, free_until_count, next_prompt_at_count, supporter_until, gate_prompt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(pubkey) DO UPDATE SET
               schedule_count = excluded.schedule_count,
               free_until_count = excluded.free_until_count,
               next_prompt_at_count = excluded.next_prompt_at_count,
               supporter_until = excluded.supporter_until,
               gate_prompt = excluded.gate_prompt",
            params![
                pubkey,
                state.schedule_count as i64,
                state.free_until_count as i64,
                state.next_prompt_at_count.map(|v| v as i64),
                state.supporter_until,
                state.gate_prompt,
            ],
        )
        .map_err(|e| e.to_string())?;

        tx.commit().map_err(|e| e.to_string())?;
        Ok((state, result))
    }

    /// Mutate with no extra return value.
    pub fn mutate_support_state<F>(&self, pubkey: &str, f: F) -> Result<SupportState, String>
    where
        F: FnOnce(&mut SupportState),
    {
        self.mutate_support_state_with(pubkey, f).map(|(state, ())| state)
    }

    pub fn get_support_state(&self, pubkey: &str) -> Result<SupportState, String> {
        self.mutate_support_state(pubkey, |_| {})
    }

    // ---- Support invoices ---------------------------------------------------

    pub fn insert_invoice(&self, invoice: &SupportInvoice) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute(
            "INSERT INTO support_invoices
             (id, pubkey, pr, verify_url, sats, status, created_at, expires_at, settled_at, preimage, last_check_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                invoice.id,
                invoice.pubkey,
                invoice.pr,
                invoice.verify_url,
                invoice.sats as i64,
                status_to_str(invoice.status.clone()),
                invoice.created_at as i64,
                invoice.expires_at as i64,
                invoice.settled_at.map(|v| v as i64),
                invoice.preimage,
                invoice.last_check_at.map(|v| v as i64),
                invoice.last_error,
            ],
        )
        .map_err(|e| format!("insert invoice {}: {}", invoice.id, e))?;
        Ok(())
    }

    /// The single `pending` invoice for a user, if any.
    pub fn active_invoice(&self, pubkey: &str) -> Result<Option<SupportInvoice>, String> {
        let conn = self.db.read()?;
        conn.query_row(
            "SELECT * FROM support_invoices WHERE pubkey = ?1 AND status = 'pending' ORDER BY created_at DESC LIMIT 1",
            params![pubkey],
            row_to_invoice,
        )
        .optional()
        .map_err(|e| e.to_string())
    }

    pub fn pending_invoices_older_than(&self, cutoff: u64) -> Result<Vec<SupportInvoice>, String> {
        let conn = self.db.read()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM support_invoices
                 WHERE status = 'pending' AND (last_check_at IS NULL OR last_check_at < ?1)",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![cutoff as i64], row_to_invoice)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    pub fn mark_invoice_status(
        &self,
        id: &str,
        status: InvoiceStatus,
        preimage: Option<&str>,
        settled_at: Option<u64>,
    ) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute(
            "UPDATE support_invoices SET status = ?1, preimage = ?2, settled_at = ?3, last_check_at = ?4 WHERE id = ?5",
            params![
                status_to_str(status),
                preimage,
                settled_at.map(|v| v as i64),
                crate::util::now_secs() as i64,
                id,
            ],
        )
        .map_err(|e| format!("mark invoice {}: {}", id, e))?;
        Ok(())
    }

    pub fn touch_invoice_check(&self, id: &str, last_error: Option<&str>) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute(
            "UPDATE support_invoices SET last_check_at = ?1, last_error = ?2 WHERE id = ?3",
            params![crate::util::now_secs() as i64, last_error, id],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_meta_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        let mut meta = MailboxMeta::default();
        meta.rev = 3;
        meta.last_created_at_by_dtag.insert("pending:0".to_string(), 100);
        store.put_mailbox_meta("pk1", &meta).unwrap();
        let loaded = store.get_mailbox_meta("pk1").unwrap();
        assert_eq!(loaded.rev, 3);
        assert_eq!(loaded.last_created_at_by_dtag.get("pending:0"), Some(&100));
    }

    #[test]
    fn support_state_mutation_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        let state = store.mutate_support_state("pk1", |s| s.schedule_count += 1).unwrap();
        assert_eq!(state.schedule_count, 1);
        let state = store.mutate_support_state("pk1", |s| s.schedule_count += 1).unwrap();
        assert_eq!(state.schedule_count, 2);
    }

    #[test]
    fn mailbox_page_roundtrips_and_detects_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        assert!(store.get_mailbox_page("pk1", "__pending__", 0).unwrap().is_none());

        store
            .put_mailbox_page(&MailboxPage {
                pubkey: "pk1".to_string(),
                bucket: "__pending__".to_string(),
                page: 0,
                count: 2,
                hash: "h1".to_string(),
                updated_at: 100,
            })
            .unwrap();
        let page = store.get_mailbox_page("pk1", "__pending__", 0).unwrap().unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.hash, "h1");

        store
            .put_mailbox_page(&MailboxPage {
                pubkey: "pk1".to_string(),
                bucket: "__pending__".to_string(),
                page: 0,
                count: 3,
                hash: "h2".to_string(),
                updated_at: 200,
            })
            .unwrap();
        let updated = store.get_mailbox_page("pk1", "__pending__", 0).unwrap().unwrap();
        assert_eq!(updated.count, 3);
        assert_eq!(updated.hash, "h2");
    }

    #[test]
    fn mailbox_blob_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        assert!(store.get_mailbox_blob("pk1", "note1").unwrap().is_none());

        store
            .put_mailbox_blob(&MailboxBlob {
                pubkey: "pk1".to_string(),
                note_id: "note1".to_string(),
                parts: 4,
                bytes: 65_000,
                hash: "bh1".to_string(),
            })
            .unwrap();
        let blob = store.get_mailbox_blob("pk1", "note1").unwrap().unwrap();
        assert_eq!(blob.parts, 4);
        assert_eq!(blob.bytes, 65_000);
    }

    #[test]
    fn invoice_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppDataStore::open(&dir.path().join("app.db"), 2).unwrap();
        let invoice = SupportInvoice {
            id: "inv1".to_string(),
            pubkey: "pk1".to_string(),
            pr: "lnbc1".to_string(),
            verify_url: "https://example.com/verify".to_string(),
            sats: 1000,
            status: InvoiceStatus::Pending,
            created_at: 1,
            expires_at: 900,
            settled_at: None,
            preimage: None,
            last_check_at: None,
            last_error: None,
        };
        store.insert_invoice(&invoice).unwrap();
        assert!(store.active_invoice("pk1").unwrap().is_some());
        store.mark_invoice_status("inv1", InvoiceStatus::Settled, Some("preimg"), Some(5)).unwrap();
        assert!(store.active_invoice("pk1").unwrap().is_none());
    }
}
