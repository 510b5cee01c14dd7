//! Connection-pool and migration plumbing shared by the jobs store and the
//! app-data store. Generalized from the host's single-database,
//! single-account pool (`account_manager.rs`) into a reusable `Database`
//! type any number of SQLite files can be opened with.
//!
//! Each `Database` keeps a capped pool of read connections plus one
//! dedicated write connection, both behind RAII guards that return the
//! connection to its pool/slot on drop. Every connection runs in WAL mode
//! with a busy timeout so contended writers wait instead of failing.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

const BUSY_TIMEOUT_MS: u32 = 5000;

fn open_db_connection(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("open {}: {}", path.display(), e))?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={};",
        BUSY_TIMEOUT_MS
    ))
    .map_err(|e| format!("pragma setup {}: {}", path.display(), e))?;
    Ok(conn)
}

/// A pooled SQLite database: N read connections, 1 write connection.
pub struct Database {
    path: PathBuf,
    read_pool: Mutex<Vec<Connection>>,
    write_conn: Mutex<Option<Connection>>,
}

/// RAII guard for a pooled read connection. Returns the connection to the
/// pool on drop instead of closing it.
pub struct ConnectionGuard<'a> {
    conn: Option<Connection>,
    pool: &'a Mutex<Vec<Connection>>,
}

impl<'a> Deref for ConnectionGuard<'a> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection guard emptied before drop")
    }
}

impl<'a> Drop for ConnectionGuard<'a> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.lock().unwrap().push(conn);
        }
    }
}

/// RAII guard for the single write connection.
pub struct WriteConnectionGuard<'a> {
    conn: Option<Connection>,
    slot: &'a Mutex<Option<Connection>>,
}

impl<'a> Deref for WriteConnectionGuard<'a> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("write guard emptied before drop")
    }
}

impl<'a> DerefMut for WriteConnectionGuard<'a> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("write guard emptied before drop")
    }
}

impl<'a> Drop for WriteConnectionGuard<'a> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap() = self.conn.take();
    }
}

impl Database {
    /// Open (creating if absent) the database at `path` with `read_pool_size`
    /// pre-warmed read connections plus one write connection.
    pub fn open(path: &Path, read_pool_size: usize) -> Result<Database, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {}", parent.display(), e))?;
        }

        let write_conn = open_db_connection(path)?;

        let mut read_pool = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size.max(1) {
            read_pool.push(open_db_connection(path)?);
        }

        Ok(Database {
            path: path.to_path_buf(),
            read_pool: Mutex::new(read_pool),
            write_conn: Mutex::new(Some(write_conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow a pooled read connection, opening a fresh one if the pool is
    /// momentarily drained (bursts beyond the configured size still succeed,
    /// just without the pre-warm benefit).
    pub fn read(&self) -> Result<ConnectionGuard<'_>, String> {
        let conn = {
            let mut pool = self.read_pool.lock().unwrap();
            match pool.pop() {
                Some(c) => c,
                None => open_db_connection(&self.path)?,
            }
        };
        Ok(ConnectionGuard { conn: Some(conn), pool: &self.read_pool })
    }

    /// Borrow the single write connection. Blocks (via the mutex) until any
    /// prior writer guard is dropped.
    pub fn write(&self) -> Result<WriteConnectionGuard<'_>, String> {
        let mut slot = self.write_conn.lock().unwrap();
        let conn = slot.take().ok_or_else(|| "write connection missing".to_string())?;
        drop(slot);
        Ok(WriteConnectionGuard {
            conn: Some(conn),
            slot: &self.write_conn,
        })
    }
}

/// One numbered, named schema change. `migrate` receives a transaction-free
/// connection reference; [`run_migrations`] wraps each call in its own
/// transaction so a failing migration rolls back cleanly.
pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub migrate: fn(&Connection) -> Result<(), String>,
}

fn ensure_migrations_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(|e| format!("create schema_migrations: {}", e))
}

fn migration_applied(conn: &Connection, id: i64) -> Result<bool, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM schema_migrations WHERE id = ?1",
        [id],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
    .map_err(|e| format!("check migration {}: {}", id, e))
}

fn run_atomic_migration(conn: &mut Connection, migration: &Migration) -> Result<(), String> {
    if migration_applied(conn, migration.id)? {
        return Ok(());
    }
    let tx = conn.transaction().map_err(|e| format!("begin migration {}: {}", migration.id, e))?;
    (migration.migrate)(&tx).map_err(|e| format!("migration {} ({}): {}", migration.id, migration.name, e))?;
    tx.execute(
        "INSERT INTO schema_migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![migration.id, migration.name, crate::util::now_secs() as i64],
    )
    .map_err(|e| format!("record migration {}: {}", migration.id, e))?;
    tx.commit().map_err(|e| format!("commit migration {}: {}", migration.id, e))?;
    println!("[Db] Migration {}: {} applied", migration.id, migration.name);
    Ok(())
}

/// Run every migration in order against `conn`, skipping those already
/// recorded in `schema_migrations`. Migrations are schema-additive only.
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<(), String> {
    ensure_migrations_table(conn)?;
    for migration in migrations {
        run_atomic_migration(conn, migration)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_roundtrips_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db"), 2).unwrap();
        {
            let conn = db.read().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        assert_eq!(db.read_pool.lock().unwrap().len(), 2);
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("mig.db"), 1).unwrap();
        let migrations = vec![Migration {
            id: 1,
            name: "create_widgets",
            migrate: |conn| {
                conn.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY)")
                    .map_err(|e| e.to_string())
            },
        }];
        {
            let mut conn = db.write().unwrap();
            run_migrations(&mut conn, &migrations).unwrap();
        }
        {
            let mut conn = db.write().unwrap();
            // Second run must not error even though the table already exists.
            run_migrations(&mut conn, &migrations).unwrap();
        }
    }
}
