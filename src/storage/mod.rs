//! Storage layer for thinknode data.
//!
//! All state lives in a single SQLite file (`thinknode.db`) inside the data
//! directory, with three record families:
//!
//! - `nodes` - one row per node, keyed by hash
//! - `messages` - chat turns, keyed by an autoincrement id and indexed by node
//! - `logs` - diagnostic entries, keyed by an autoincrement id and indexed by node
//!
//! Every operation is a single SQL statement, so a failed write leaves the
//! previous state untouched. Ordering within a node comes from the
//! autoincrement ids, which are never reused even after a reset.

use crate::models::{LogEntry, LogLevel, Message, Meta, Node, Position, Role};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TN_DATA_DIR";

/// File name of the store inside the data directory.
pub const DB_FILE_NAME: &str = "thinknode.db";

const NODE_COLUMNS: &str = "hash, title, parent_hash, pos_x, pos_y, pos_z, cluster_hash, meta, created_at, updated_at";

/// Storage manager owning the SQLite connection.
pub struct Storage {
    /// Path of the database file, `None` for in-memory stores
    path: Option<PathBuf>,
    conn: Connection,
}

impl Storage {
    /// Open or create the store at `db_path`, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            path: Some(db_path.to_path_buf()),
            conn,
        })
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self { path: None, conn })
    }

    /// Path of the database file, if the store is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // In-memory databases answer "memory" here; the value is not needed.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Ok(())
    }

    /// Initialize the SQLite schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                hash TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                parent_hash TEXT REFERENCES nodes(hash),
                pos_x REAL NOT NULL DEFAULT 0,
                pos_y REAL NOT NULL DEFAULT 0,
                pos_z REAL NOT NULL DEFAULT 0,
                cluster_hash TEXT,
                meta TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (node_hash) REFERENCES nodes(hash) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_hash TEXT NOT NULL,
                level TEXT NOT NULL,
                text TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (node_hash) REFERENCES nodes(hash) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_hash);
            CREATE INDEX IF NOT EXISTS idx_nodes_cluster ON nodes(cluster_hash);
            CREATE INDEX IF NOT EXISTS idx_messages_node ON messages(node_hash, id);
            CREATE INDEX IF NOT EXISTS idx_logs_node ON logs(node_hash, id);
            "#,
        )?;

        Ok(())
    }

    // === Node Operations ===

    /// Insert a node, or overwrite the mutable fields of an existing one.
    pub fn put_node(&self, node: &Node) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO nodes
                (hash, title, parent_hash, pos_x, pos_y, pos_z, cluster_hash, meta,
                 created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(hash) DO UPDATE SET
                    title = excluded.title,
                    parent_hash = excluded.parent_hash,
                    pos_x = excluded.pos_x,
                    pos_y = excluded.pos_y,
                    pos_z = excluded.pos_z,
                    cluster_hash = excluded.cluster_hash,
                    meta = excluded.meta,
                    updated_at = excluded.updated_at
                "#,
                params![
                    node.hash,
                    node.title,
                    node.parent_hash,
                    node.position.x,
                    node.position.y,
                    node.position.z,
                    node.cluster_hash,
                    Value::Object(node.meta.clone()),
                    node.created_at,
                    node.updated_at,
                ],
            )
            .map_err(|e| {
                map_missing_reference(e, || {
                    format!(
                        "Parent node not found: {}",
                        node.parent_hash.as_deref().unwrap_or_default()
                    )
                })
            })?;
        Ok(())
    }

    /// Get a node by hash.
    pub fn get_node(&self, hash: &str) -> Result<Node> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE hash = ?1", NODE_COLUMNS),
                [hash],
                node_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Node not found: {}", hash)))
    }

    /// Check whether a node exists.
    pub fn node_exists(&self, hash: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM nodes WHERE hash = ?1)",
            [hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// List all nodes in creation order.
    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY created_at ASC, hash ASC",
            NODE_COLUMNS
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Refresh a node's `updated_at`.
    pub fn touch_node(&self, hash: &str, at: DateTime<Utc>) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE nodes SET updated_at = ?2 WHERE hash = ?1",
            params![hash, at],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Node not found: {}", hash)));
        }
        Ok(())
    }

    // === Message Operations ===

    /// Append a chat message to a node.
    pub fn append_message(&self, node_hash: &str, role: Role, body: &str) -> Result<Message> {
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO messages (node_hash, role, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![node_hash, role.as_str(), body, created_at],
            )
            .map_err(|e| map_missing_reference(e, || format!("Node not found: {}", node_hash)))?;

        Ok(Message {
            id: self.conn.last_insert_rowid(),
            node_hash: node_hash.to_string(),
            role,
            body: body.to_string(),
            created_at,
        })
    }

    /// List a node's messages in creation order.
    pub fn list_messages(&self, node_hash: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, node_hash, role, body, created_at FROM messages
             WHERE node_hash = ?1 ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map([node_hash], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    node_hash: row.get(1)?,
                    role: parse_column(row, 2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Delete all messages of a node. Returns how many were removed.
    pub fn clear_messages(&self, node_hash: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM messages WHERE node_hash = ?1", [node_hash])?;
        Ok(removed)
    }

    // === Log Operations ===

    /// Append a log entry to a node.
    pub fn append_log(
        &self,
        node_hash: &str,
        level: LogLevel,
        text: &str,
        payload: Option<&Value>,
    ) -> Result<LogEntry> {
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO logs (node_hash, level, text, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![node_hash, level.as_str(), text, payload, created_at],
            )
            .map_err(|e| map_missing_reference(e, || format!("Node not found: {}", node_hash)))?;

        Ok(LogEntry {
            id: self.conn.last_insert_rowid(),
            node_hash: node_hash.to_string(),
            level,
            text: text.to_string(),
            payload: payload.cloned(),
            created_at,
        })
    }

    /// List a node's log entries in creation order.
    pub fn list_logs(&self, node_hash: &str) -> Result<Vec<LogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, node_hash, level, text, payload, created_at FROM logs
             WHERE node_hash = ?1 ORDER BY id ASC",
        )?;
        let logs = stmt
            .query_map([node_hash], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    node_hash: row.get(1)?,
                    level: parse_column(row, 2)?,
                    text: row.get(3)?,
                    payload: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let meta = match row.get::<_, Value>(7)? {
        Value::Object(map) => map,
        _ => Meta::new(),
    };

    Ok(Node {
        hash: row.get(0)?,
        title: row.get(1)?,
        parent_hash: row.get(2)?,
        position: Position::new(row.get(3)?, row.get(4)?, row.get(5)?),
        cluster_hash: row.get(6)?,
        meta,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Read a text column and parse it with `FromStr`.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Turn a foreign key violation into `NotFound`; other errors pass through.
fn map_missing_reference(err: rusqlite::Error, message: impl FnOnce() -> String) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::NotFound(message())
        }
        other => Error::Database(other),
    }
}

/// Get the data directory.
///
/// `TN_DATA_DIR` wins; otherwise `<XDG data dir>/thinknode`.
pub fn get_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::Other("Could not determine data directory".to_string()))?;
    Ok(data_dir.join("thinknode"))
}

/// Path of the store file inside a data directory.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

/// Generate a unique hash for a new node.
///
/// Mixes the title and parent with the current time and a random UUID, so
/// identical titles submitted repeatedly still get distinct hashes.
pub fn generate_node_hash(title: &str, parent_hash: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(parent_hash.unwrap_or_default().as_bytes());
    hasher.update(
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_le_bytes(),
    );
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    format!("{:x}", hasher.finalize())
}
