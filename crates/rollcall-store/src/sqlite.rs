use crate::{AttendanceKey, FaceStore, StoreError};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rollcall_core::{AttendanceEvent, Embedding, Group, Identity, IdentityKey};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS groups (
        name TEXT PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS identities (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        group_name    TEXT NOT NULL,
        embedding     BLOB NOT NULL,
        model_version TEXT,
        created_at    TEXT NOT NULL,
        UNIQUE(name, group_name)
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        name       TEXT NOT NULL,
        group_name TEXT NOT NULL,
        timestamp  TEXT NOT NULL,
        attended   INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_attendance_name_ts
        ON attendance(name, timestamp DESC);
    CREATE INDEX IF NOT EXISTS idx_attendance_key_ts
        ON attendance(name, group_name, timestamp DESC);
"#;

const IDENTITY_COLUMNS: &str = "id, name, group_name, embedding, model_version, created_at";

/// SQLite-backed [`FaceStore`]. One connection behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

// Fixed-width RFC 3339 so lexical order equals chronological order.
fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

type IdentityRow = (String, String, String, Vec<u8>, Option<String>, String);

fn read_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn identity_from_row(
    (id, name, group, blob, model_version, created_at): IdentityRow,
) -> Result<Identity, StoreError> {
    let mut embedding = Embedding::from_le_bytes(&blob)
        .ok_or_else(|| StoreError::Corrupt(format!("embedding of identity {id}")))?;
    embedding.model_version = model_version;
    Ok(Identity {
        created_at: decode_time(&created_at)?,
        id,
        name,
        group,
        embedding,
    })
}

type AttendanceRow = (String, String, String, bool);

fn read_attendance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn attendance_from_row(
    (name, group, timestamp, attended): AttendanceRow,
) -> Result<AttendanceEvent, StoreError> {
    Ok(AttendanceEvent {
        name,
        group,
        timestamp: decode_time(&timestamp)?,
        attended,
    })
}

fn insert_attendance(conn: &Connection, event: &AttendanceEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO attendance (name, group_name, timestamp, attended) VALUES (?1, ?2, ?3, ?4)",
        params![event.name, event.group, encode_time(&event.timestamp), event.attended],
    )?;
    Ok(())
}

fn latest_attendance_in(
    conn: &Connection,
    key: AttendanceKey<'_>,
) -> Result<Option<AttendanceEvent>, StoreError> {
    let row = match key {
        AttendanceKey::Name(name) => conn
            .query_row(
                "SELECT name, group_name, timestamp, attended FROM attendance
                 WHERE name = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![name],
                read_attendance_row,
            )
            .optional()?,
        AttendanceKey::NameAndGroup(name, group) => conn
            .query_row(
                "SELECT name, group_name, timestamp, attended FROM attendance
                 WHERE name = ?1 AND group_name = ?2 ORDER BY timestamp DESC LIMIT 1",
                params![name, group],
                read_attendance_row,
            )
            .optional()?,
    };
    row.map(attendance_from_row).transpose()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened face store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_identities(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, read_identity_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(identity_from_row).collect()
    }
}

impl FaceStore for SqliteStore {
    fn insert_identity(
        &self,
        key: &IdentityKey,
        embedding: &Embedding,
    ) -> Result<Identity, StoreError> {
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            name: key.name.clone(),
            group: key.group.clone(),
            embedding: embedding.clone(),
            created_at: Utc::now(),
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let group_created =
            tx.execute("INSERT OR IGNORE INTO groups (name) VALUES (?1)", params![key.group])? > 0;

        let inserted = tx.execute(
            "INSERT INTO identities (id, name, group_name, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.id,
                identity.name,
                identity.group,
                embedding.to_le_bytes(),
                embedding.model_version,
                encode_time(&identity.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            // Dropping `tx` rolls back the group insert as well.
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::ConstraintViolation(key.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        tracing::debug!(identity = %key, group_created, "identity stored");
        Ok(identity)
    }

    fn find_identity(&self, key: &IdentityKey) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities WHERE name = ?1 AND group_name = ?2"
                ),
                params![key.name, key.group],
                read_identity_row,
            )
            .optional()?;
        row.map(identity_from_row).transpose()
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.query_identities(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY rowid"),
            [],
        )
    }

    fn identities_in_group(&self, group: &str) -> Result<Vec<Identity>, StoreError> {
        self.query_identities(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE group_name = ?1 ORDER BY rowid"),
            params![group],
        )
    }

    fn identity_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    fn groups(&self) -> Result<Vec<Group>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM groups ORDER BY name")?;
        let groups = stmt
            .query_map([], |r| Ok(Group { name: r.get(0)? }))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    fn migrate_groups(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO groups (name)
             SELECT DISTINCT lower(group_name) FROM identities",
            [],
        )?;
        Ok(created)
    }

    fn append_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        let conn = self.conn()?;
        insert_attendance(&conn, event)
    }

    fn append_attendance_if_clear(
        &self,
        event: &AttendanceEvent,
        key: AttendanceKey<'_>,
        cooldown: Duration,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let mut conn = self.conn()?;
        // Take the write lock before the lookup, not at the insert.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(last) = latest_attendance_in(&tx, key)? {
            if event.timestamp - last.timestamp < cooldown {
                return Ok(Some(last));
            }
        }
        insert_attendance(&tx, event)?;
        tx.commit()?;
        Ok(None)
    }

    fn latest_attendance(
        &self,
        key: AttendanceKey<'_>,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        let conn = self.conn()?;
        latest_attendance_in(&conn, key)
    }

    fn attendance_log(
        &self,
        name: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, group_name, timestamp, attended FROM attendance
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let since = since.as_ref().map(encode_time);
        let rows = stmt
            .query_map(params![name, since, limit as i64], read_attendance_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(attendance_from_row).collect()
    }
}
