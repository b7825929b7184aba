//! SQLite-backed outbox storage.
//!
//! One database file per identity. Records are stored as JSON payloads with
//! their conversation and position broken out, and every write replaces the
//! full record set inside a single transaction.

use crate::clock::Clock;
use crate::error::{OutboxError, OutboxResult};
use crate::store::{Outbox, OutboxProvider, OutboxStorage, StoredOutbox};
use crate::types::{OutboxRecord, Uid};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// On-disk format version.
pub const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> OutboxResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> OutboxResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> OutboxResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> OutboxResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS outbox_records (
            outbox_id TEXT PRIMARY KEY,
            conv_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            payload TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_records_position ON outbox_records(position);
        "#,
    )?;

    let version: Option<i64> = conn
        .query_row(
            "SELECT value FROM outbox_meta WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match version {
        None => {
            conn.execute(
                "INSERT INTO outbox_meta (key, value) VALUES ('version', ?)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => return Err(OutboxError::UnsupportedVersion(v)),
    }
    Ok(())
}

impl OutboxStorage for SqliteStorage {
    fn read_records(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT payload FROM outbox_records ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    fn write_records(&self, records: &[OutboxRecord]) -> OutboxResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM outbox_records", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO outbox_records (outbox_id, conv_id, position, payload) VALUES (?, ?, ?, ?)",
            )?;
            for (position, record) in records.iter().enumerate() {
                let payload = serde_json::to_string(record)?;
                stmt.execute(params![
                    record.outbox_id.as_str(),
                    record.conv_id.as_str(),
                    position as i64,
                    payload
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

pub type SqliteOutbox = StoredOutbox<SqliteStorage>;

/// Opens `<dir>/<uid>.sqlite` outboxes, one shared handle per identity.
pub struct SqliteOutboxProvider {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    open: Mutex<std::collections::HashMap<Uid, Arc<SqliteOutbox>>>,
}

impl SqliteOutboxProvider {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            open: Mutex::new(Default::default()),
        }
    }

    /// Database path for an identity. The file name is the lowercase hex of
    /// the UID bytes, so distinct UIDs never share a file.
    pub fn db_path(&self, uid: &Uid) -> PathBuf {
        let name: String = uid
            .as_str()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect();
        self.dir.join(format!("{name}.sqlite"))
    }
}

impl OutboxProvider for SqliteOutboxProvider {
    fn open(&self, uid: &Uid) -> OutboxResult<Arc<dyn Outbox>> {
        let mut open = self.open.lock();
        if let Some(outbox) = open.get(uid) {
            return Ok(outbox.clone());
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.db_path(uid);
        debug!(uid = %uid, path = %path.display(), "Opening outbox database");
        let storage = SqliteStorage::open(&path)?;
        let outbox = Arc::new(StoredOutbox::new(uid.clone(), storage, self.clock.clone()));
        open.insert(uid.clone(), outbox.clone());
        info!(uid = %uid, "Outbox ready");
        Ok(outbox)
    }
}
