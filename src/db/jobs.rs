//! Jobs Store: durable, crash-safe persistence of scheduled jobs and their
//! status transitions, per spec.md §3/§4.2.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::pool::{Database, Migration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Sent,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Sent => "sent",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<JobStatus, String> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "sent" => Ok(JobStatus::Sent),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A signed inner note (kind 1) or repost (kind 6) awaiting publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteJob {
    pub inner_event_json: String,
    pub kind: u16,
    pub has_quote_tag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmRecipient {
    pub pubkey: String,
    /// Encrypted seal (kind 13, empty tags), authored by the requester.
    pub seal: String,
    /// Gift-wrap id, persisted once generated so retries reuse it.
    pub wrap_id: Option<String>,
    /// The fully signed gift-wrap event, persisted alongside `wrap_id` so a
    /// retry resends the exact same event instead of minting a new ephemeral
    /// keypair (and therefore a new id) on every attempt.
    pub wrap_json: Option<String>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub relays_used: Vec<String>,
    pub attempted_relays: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmJob {
    pub pkv_id: String,
    pub dm_enc: String,
    pub meta: serde_json::Value,
    pub recipients: Vec<DmRecipient>,
    pub sender_copy_wrap_id: Option<String>,
    pub sender_copy_wrap_json: Option<String>,
    pub sender_copy_status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "note")]
    Note(NoteJob),
    #[serde(rename = "dm17")]
    Dm(DmJob),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub requester_pubkey: String,
    pub dvm_pubkey: String,
    pub relays: Vec<String>,
    pub scheduled_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: JobStatus,
    pub payload: Payload,
    pub last_error: Option<String>,
}

pub struct JobsStore {
    db: Database,
}

fn migrations() -> Vec<Migration> {
    vec![Migration {
        id: 1,
        name: "create_jobs",
        migrate: |conn| {
            conn.execute_batch(
                "CREATE TABLE jobs (
                    id TEXT PRIMARY KEY,
                    requester_pubkey TEXT NOT NULL,
                    dvm_pubkey TEXT NOT NULL,
                    relays TEXT NOT NULL,
                    scheduled_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    last_error TEXT
                );
                CREATE INDEX idx_jobs_pubkey_updated ON jobs (requester_pubkey, updated_at);
                CREATE INDEX idx_jobs_pubkey_status_updated ON jobs (requester_pubkey, status, updated_at);
                CREATE INDEX idx_jobs_status_scheduled_at ON jobs (status, scheduled_at);",
            )
            .map_err(|e| e.to_string())
        },
    }]
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let relays_json: String = row.get("relays")?;
    let payload_json: String = row.get("payload")?;
    let status_str: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        requester_pubkey: row.get("requester_pubkey")?,
        dvm_pubkey: row.get("dvm_pubkey")?,
        relays: serde_json::from_str(&relays_json).unwrap_or_default(),
        scheduled_at: row.get("scheduled_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Error),
        payload: serde_json::from_str(&payload_json).unwrap_or(Payload::Note(NoteJob {
            inner_event_json: String::new(),
            kind: 1,
            has_quote_tag: false,
        })),
        last_error: row.get("last_error")?,
    })
}

impl JobsStore {
    pub fn open(path: &std::path::Path, read_pool_size: usize) -> Result<JobsStore, String> {
        let db = Database::open(path, read_pool_size)?;
        {
            let mut conn = db.write()?;
            super::pool::run_migrations(&mut conn, &migrations())?;
        }
        Ok(JobsStore { db })
    }

    /// Insert a new job, or return `Ok(false)` if `id` already exists
    /// (deduplication, testable property 1).
    pub fn insert_if_absent(&self, job: &Job) -> Result<bool, String> {
        let conn = self.db.write()?;
        let relays_json = serde_json::to_string(&job.relays).map_err(|e| e.to_string())?;
        let payload_json = serde_json::to_string(&job.payload).map_err(|e| e.to_string())?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO jobs
                 (id, requester_pubkey, dvm_pubkey, relays, scheduled_at, created_at, updated_at, status, payload, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.id,
                    job.requester_pubkey,
                    job.dvm_pubkey,
                    relays_json,
                    job.scheduled_at,
                    job.created_at,
                    job.updated_at,
                    job.status.as_str(),
                    payload_json,
                    job.last_error,
                ],
            )
            .map_err(|e| format!("insert job {}: {}", job.id, e))?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, String> {
        let conn = self.db.read()?;
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .map_err(|e| format!("get job {}: {}", id, e))
    }

    /// Every job owned by `pubkey`, any status, ascending by `updatedAt` —
    /// the source rows a mailbox flush packs into pending/history shards.
    pub fn list_by_requester(&self, pubkey: &str) -> Result<Vec<Job>, String> {
        let conn = self.db.read()?;
        let mut stmt = conn
            .prepare("SELECT * FROM jobs WHERE requester_pubkey = ?1 ORDER BY updated_at ASC")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![pubkey], row_to_job)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    /// Jobs with status `scheduled`, ascending by `scheduledAt`.
    pub fn list_pending(&self) -> Result<Vec<Job>, String> {
        let conn = self.db.read()?;
        let mut stmt = conn
            .prepare("SELECT * FROM jobs WHERE status = 'scheduled' ORDER BY scheduled_at ASC")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], row_to_job)
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
    }

    pub fn earliest_pending_timestamp(&self) -> Result<Option<i64>, String> {
        let conn = self.db.read()?;
        conn.query_row(
            "SELECT MIN(scheduled_at) FROM jobs WHERE status = 'scheduled'",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| e.to_string())
    }

    /// Most recent `createdAt` across every job ever ingested — used as the
    /// floor for the gift-wrap resubscription `since` filter after a restart.
    pub fn latest_created_at(&self) -> Result<Option<i64>, String> {
        let conn = self.db.read()?;
        conn.query_row("SELECT MAX(created_at) FROM jobs", [], |row| row.get::<_, Option<i64>>(0))
            .map_err(|e| e.to_string())
    }

    /// Update status (+ optional error) and return the full updated row.
    pub fn mark_status(&self, id: &str, status: JobStatus, last_error: Option<&str>) -> Result<Job, String> {
        let conn = self.db.write()?;
        let now = crate::util::now_secs() as i64;
        let updated = conn
            .execute(
                "UPDATE jobs SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), last_error, now, id],
            )
            .map_err(|e| format!("mark_status {}: {}", id, e))?;
        if updated == 0 {
            return Err(format!("job {} not found", id));
        }
        conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .map_err(|e| format!("reload job {}: {}", id, e))
    }

    /// Patch payload/relays/status atomically under one write transaction.
    pub fn update_job(
        &self,
        id: &str,
        relays: Option<&[String]>,
        payload: Option<&Payload>,
        status: Option<JobStatus>,
    ) -> Result<Job, String> {
        let mut conn = self.db.write()?;
        let now = crate::util::now_secs() as i64;
        let tx = conn.transaction().map_err(|e| e.to_string())?;
        if let Some(relays) = relays {
            let relays_json = serde_json::to_string(relays).map_err(|e| e.to_string())?;
            tx.execute(
                "UPDATE jobs SET relays = ?1, updated_at = ?2 WHERE id = ?3",
                params![relays_json, now, id],
            )
            .map_err(|e| e.to_string())?;
        }
        if let Some(payload) = payload {
            let payload_json = serde_json::to_string(payload).map_err(|e| e.to_string())?;
            tx.execute(
                "UPDATE jobs SET payload = ?1, updated_at = ?2 WHERE id = ?3",
                params![payload_json, now, id],
            )
            .map_err(|e| e.to_string())?;
        }
        if let Some(status) = status {
            tx.execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
            .map_err(|e| e.to_string())?;
        }
        let job = tx
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .map_err(|e| format!("reload job {}: {}", id, e))?;
        tx.commit().map_err(|e| e.to_string())?;
        Ok(job)
    }

    /// Permanently remove a job row. Used only for the DM "sent" deletion
    /// behavior carried over from the source (Design Note open question).
    pub fn delete(&self, id: &str) -> Result<(), String> {
        let conn = self.db.write()?;
        conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(|e| format!("delete job {}: {}", id, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            requester_pubkey: "abc".to_string(),
            dvm_pubkey: "dvm".to_string(),
            relays: vec!["wss://r1".to_string()],
            scheduled_at: 1000,
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

    #[test]
    fn insert_if_absent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobsStore::open(&dir.path().join("jobs.db"), 2).unwrap();
        assert!(store.insert_if_absent(&sample_job("job1")).unwrap());
        assert!(!store.insert_if_absent(&sample_job("job1")).unwrap());
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn list_pending_sorted_by_scheduled_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobsStore::open(&dir.path().join("jobs.db"), 2).unwrap();
        let mut a = sample_job("a");
        a.scheduled_at = 500;
        let mut b = sample_job("b");
        b.scheduled_at = 100;
        store.insert_if_absent(&a).unwrap();
        store.insert_if_absent(&b).unwrap();
        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].id, "b");
        assert_eq!(pending[1].id, "a");
    }

    #[test]
    fn mark_status_updates_and_returns_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobsStore::open(&dir.path().join("jobs.db"), 2).unwrap();
        store.insert_if_absent(&sample_job("job1")).unwrap();
        let updated = store.mark_status("job1", JobStatus::Sent, None).unwrap();
        assert_eq!(updated.status, JobStatus::Sent);
        assert!(store.list_pending().unwrap().is_empty());
    }
}
