//! SQLite database shared by the record store and the stream broker
//!
//! Document records, their payloads and the append-only topic log live in one
//! file so a single WAL-mode database gives the whole pipeline its durability.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DocumentRecord, EntryId, PatchOutcome, RecordPatch, StreamEntry};

/// SQLite-backed pipeline database
pub struct PipelineDb {
    conn: Arc<Mutex<Connection>>,
}

impl PipelineDb {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (tests, `backend = "memory"` experiments)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            -- Document records
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                content_ref TEXT,
                recognition_json TEXT,
                extracted_fields_json TEXT,
                validation_errors_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

            -- Binary payloads, removed after successful persistence
            CREATE TABLE IF NOT EXISTS document_payloads (
                document_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                size_bytes INTEGER NOT NULL,
                stored_at TEXT NOT NULL
            );

            -- Topics exist once appended to or grouped on
            CREATE TABLE IF NOT EXISTS stream_topics (
                name TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );

            -- Append-only log; the rowid is the monotonic entry id
            CREATE TABLE IF NOT EXISTS stream_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                body TEXT NOT NULL,
                appended_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stream_entries_topic ON stream_entries(topic, id);

            -- Consumer group cursors
            CREATE TABLE IF NOT EXISTS stream_groups (
                topic TEXT NOT NULL,
                group_name TEXT NOT NULL,
                last_delivered_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (topic, group_name)
            );

            -- Delivered but unacknowledged entries per group
            CREATE TABLE IF NOT EXISTS stream_pending (
                topic TEXT NOT NULL,
                group_name TEXT NOT NULL,
                entry_id INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                delivered_at_ms INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL,
                PRIMARY KEY (topic, group_name, entry_id)
            );

            CREATE INDEX IF NOT EXISTS idx_stream_pending_idle
                ON stream_pending(topic, group_name, delivered_at_ms);
        "#)
        .map_err(|e| Error::Storage(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Database migrations complete");
        Ok(())
    }

    // ==================== Document Operations ====================

    /// Insert a new record together with its payload
    pub fn insert_document(&self, record: &DocumentRecord, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO documents (
                id, filename, status, content_ref, recognition_json,
                extracted_fields_json, validation_errors_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id.to_string(),
                record.filename,
                record.status.as_str(),
                record.content_ref,
                to_json(&record.recognition_result)?,
                to_json(&record.extracted_fields)?,
                to_json(&record.validation_errors)?,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        ).map_err(|e| Error::Storage(format!("Failed to insert document: {}", e)))?;

        tx.execute(
            "INSERT INTO document_payloads (document_id, data, size_bytes, stored_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.to_string(),
                payload,
                payload.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        ).map_err(|e| Error::Storage(format!("Failed to store payload: {}", e)))?;

        tx.commit()?;
        Ok(())
    }

    /// Get a record by id
    pub fn get_document(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let conn = self.conn.lock();
        load_document(&conn, id)
    }

    /// Apply a patch; a status transition is a compare-and-set on the stored status
    pub fn update_document(&self, id: Uuid, patch: &RecordPatch) -> Result<PatchOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let Some(mut record) = load_document(&tx, id)? else {
            return Ok(PatchOutcome::Missing);
        };
        let observed = record.status;

        let outcome = patch.apply_to(&mut record)?;
        if !outcome.is_applied() {
            return Ok(outcome);
        }

        let changed = tx.execute(
            r#"
            UPDATE documents SET
                status = ?2,
                recognition_json = ?3,
                extracted_fields_json = ?4,
                validation_errors_json = ?5,
                updated_at = ?6
            WHERE id = ?1 AND status = ?7
            "#,
            params![
                id.to_string(),
                record.status.as_str(),
                to_json(&record.recognition_result)?,
                to_json(&record.extracted_fields)?,
                to_json(&record.validation_errors)?,
                record.updated_at.to_rfc3339(),
                observed.as_str(),
            ],
        ).map_err(|e| Error::Storage(format!("Failed to update document: {}", e)))?;

        if changed == 0 {
            // Another process moved the record between our read and write
            let actual = load_document(&tx, id)?
                .map(|r| r.status)
                .unwrap_or(observed);
            return Ok(PatchOutcome::Conflict { actual });
        }

        tx.commit()?;
        Ok(PatchOutcome::Applied)
    }

    /// Get the payload bytes for a document
    pub fn get_payload(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT data FROM document_payloads WHERE document_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Storage(format!("Failed to read payload: {}", e)))
    }

    /// Remove a payload and clear the record's content reference
    pub fn delete_payload(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM document_payloads WHERE document_id = ?1",
            params![id.to_string()],
        ).map_err(|e| Error::Storage(format!("Failed to delete payload: {}", e)))?;

        tx.execute(
            "UPDATE documents SET content_ref = NULL, updated_at = ?2 WHERE id = ?1 AND content_ref IS NOT NULL",
            params![id.to_string(), Utc::now().to_rfc3339()],
        ).map_err(|e| Error::Storage(format!("Failed to clear content ref: {}", e)))?;

        tx.commit()?;
        Ok(removed > 0)
    }

    /// Remove a record and its payload
    pub fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM document_payloads WHERE document_id = ?1",
            params![id.to_string()],
        ).map_err(|e| Error::Storage(format!("Failed to delete payload: {}", e)))?;

        let removed = tx.execute(
            "DELETE FROM documents WHERE id = ?1",
            params![id.to_string()],
        ).map_err(|e| Error::Storage(format!("Failed to delete document: {}", e)))?;

        tx.commit()?;
        Ok(removed > 0)
    }

    // ==================== Stream Operations ====================

    /// Create a consumer group at the tail of `topic` if it does not exist
    pub fn ensure_group(&self, topic: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT OR IGNORE INTO stream_topics (name, created_at) VALUES (?1, ?2)",
            params![topic, now],
        ).map_err(|e| Error::Broker(format!("Failed to create topic: {}", e)))?;

        let tail: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM stream_entries WHERE topic = ?1",
            params![topic],
            |row| row.get(0),
        ).map_err(|e| Error::Broker(format!("Failed to read topic tail: {}", e)))?;

        let created = tx.execute(
            "INSERT OR IGNORE INTO stream_groups (topic, group_name, last_delivered_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![topic, group, tail, now],
        ).map_err(|e| Error::Broker(format!("Failed to create group: {}", e)))?;

        tx.commit()?;
        Ok(created > 0)
    }

    /// Append an entry to the tail of `topic`
    pub fn append_entry(&self, topic: &str, body: &str) -> Result<EntryId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT OR IGNORE INTO stream_topics (name, created_at) VALUES (?1, ?2)",
            params![topic, now],
        ).map_err(|e| Error::Broker(format!("Failed to create topic: {}", e)))?;

        tx.execute(
            "INSERT INTO stream_entries (topic, body, appended_at) VALUES (?1, ?2, ?3)",
            params![topic, body, now],
        ).map_err(|e| Error::Broker(format!("Failed to append entry: {}", e)))?;

        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(EntryId(id as u64))
    }

    /// Hand up to `max_count` entries to `consumer`
    ///
    /// Entries left unacknowledged for at least `reclaim_idle` are redelivered
    /// first, then entries past the group cursor in append order.
    pub fn claim_entries(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        reclaim_idle: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let last_delivered: Option<i64> = tx.query_row(
            "SELECT last_delivered_id FROM stream_groups WHERE topic = ?1 AND group_name = ?2",
            params![topic, group],
            |row| row.get(0),
        ).optional()
        .map_err(|e| Error::Broker(format!("Failed to read group cursor: {}", e)))?;

        let Some(last_delivered) = last_delivered else {
            return Err(Error::GroupNotFound {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        };

        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms - reclaim_idle.as_millis() as i64;
        let mut batch = Vec::new();

        {
            let mut stmt = tx.prepare(
                r#"
                SELECT p.entry_id, e.body, p.delivery_count
                FROM stream_pending p
                JOIN stream_entries e ON e.id = p.entry_id
                WHERE p.topic = ?1 AND p.group_name = ?2 AND p.delivered_at_ms <= ?3
                ORDER BY p.entry_id
                LIMIT ?4
                "#,
            ).map_err(|e| Error::Broker(format!("Failed to prepare reclaim: {}", e)))?;

            let rows = stmt.query_map(params![topic, group, cutoff, max_count as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            }).map_err(|e| Error::Broker(format!("Failed to reclaim entries: {}", e)))?;

            for row in rows {
                let (id, body, count) = row?;
                batch.push(StreamEntry {
                    id: EntryId(id as u64),
                    body,
                    delivery_count: count as u32 + 1,
                });
            }
        }

        for entry in &batch {
            tx.execute(
                r#"
                UPDATE stream_pending
                SET consumer = ?4, delivered_at_ms = ?5, delivery_count = delivery_count + 1
                WHERE topic = ?1 AND group_name = ?2 AND entry_id = ?3
                "#,
                params![topic, group, entry.id.0 as i64, consumer, now_ms],
            ).map_err(|e| Error::Broker(format!("Failed to reassign entry: {}", e)))?;
        }

        if !batch.is_empty() {
            tracing::debug!(
                topic,
                group,
                consumer,
                reclaimed = batch.len(),
                "Reclaimed idle entries"
            );
        }

        let remaining = max_count.saturating_sub(batch.len());
        if remaining > 0 {
            let fresh: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, body FROM stream_entries WHERE topic = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                ).map_err(|e| Error::Broker(format!("Failed to prepare read: {}", e)))?;

                let rows = stmt.query_map(params![topic, last_delivered, remaining as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                }).map_err(|e| Error::Broker(format!("Failed to read entries: {}", e)))?;

                rows.collect::<rusqlite::Result<_>>()?
            };

            for (id, body) in &fresh {
                tx.execute(
                    r#"
                    INSERT INTO stream_pending (topic, group_name, entry_id, consumer, delivered_at_ms, delivery_count)
                    VALUES (?1, ?2, ?3, ?4, ?5, 1)
                    "#,
                    params![topic, group, id, consumer, now_ms],
                ).map_err(|e| Error::Broker(format!("Failed to record delivery: {}", e)))?;
            }

            if let Some((last, _)) = fresh.last() {
                tx.execute(
                    "UPDATE stream_groups SET last_delivered_id = ?3 WHERE topic = ?1 AND group_name = ?2",
                    params![topic, group, last],
                ).map_err(|e| Error::Broker(format!("Failed to advance group cursor: {}", e)))?;
            }

            batch.extend(fresh.into_iter().map(|(id, body)| StreamEntry {
                id: EntryId(id as u64),
                body,
                delivery_count: 1,
            }));
        }

        tx.commit()?;
        Ok(batch)
    }

    /// Acknowledge an entry for a group; returns whether it was still pending
    pub fn ack_entry(&self, topic: &str, group: &str, id: EntryId) -> Result<bool> {
        let conn = self.conn.lock();

        let removed = conn.execute(
            "DELETE FROM stream_pending WHERE topic = ?1 AND group_name = ?2 AND entry_id = ?3",
            params![topic, group, id.0 as i64],
        ).map_err(|e| Error::Broker(format!("Failed to ack entry: {}", e)))?;

        Ok(removed > 0)
    }

    /// Read entries of a topic without claiming them
    pub fn list_entries(&self, topic: &str, after: Option<EntryId>, limit: usize) -> Result<Vec<StreamEntry>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, body FROM stream_entries WHERE topic = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        ).map_err(|e| Error::Broker(format!("Failed to prepare query: {}", e)))?;

        let after = after.map(|id| id.0 as i64).unwrap_or(0);
        let entries = stmt.query_map(params![topic, after, limit as i64], |row| {
            Ok(StreamEntry {
                id: EntryId(row.get::<_, i64>(0)? as u64),
                body: row.get(1)?,
                delivery_count: 0,
            })
        })
        .map_err(|e| Error::Broker(format!("Failed to list entries: {}", e)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Number of delivered-but-unacknowledged entries for a group
    pub fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let conn = self.conn.lock();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stream_pending WHERE topic = ?1 AND group_name = ?2",
            params![topic, group],
            |row| row.get(0),
        ).map_err(|e| Error::Broker(format!("Failed to count pending entries: {}", e)))?;

        Ok(count as usize)
    }
}

// ==================== Helper Functions ====================

fn to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Error::from)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Error::from)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Raw column values of a `documents` row
struct DocumentRow {
    id: String,
    filename: String,
    status: String,
    content_ref: Option<String>,
    recognition_json: Option<String>,
    extracted_fields_json: Option<String>,
    validation_errors_json: Option<String>,
    created_at: String,
    updated_at: String,
}

fn load_document(conn: &Connection, id: Uuid) -> Result<Option<DocumentRecord>> {
    let row = conn.query_row(
        r#"
        SELECT id, filename, status, content_ref, recognition_json,
               extracted_fields_json, validation_errors_json, created_at, updated_at
        FROM documents WHERE id = ?1
        "#,
        params![id.to_string()],
        |row| {
            Ok(DocumentRow {
                id: row.get(0)?,
                filename: row.get(1)?,
                status: row.get(2)?,
                content_ref: row.get(3)?,
                recognition_json: row.get(4)?,
                extracted_fields_json: row.get(5)?,
                validation_errors_json: row.get(6)?,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        },
    )
    .optional()
    .map_err(|e| Error::Storage(format!("Failed to get document: {}", e)))?;

    row.map(row_to_document).transpose()
}

fn row_to_document(row: DocumentRow) -> Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: Uuid::parse_str(&row.id)
            .map_err(|e| Error::Storage(format!("Invalid document id '{}': {}", row.id, e)))?,
        status: row.status.parse()?,
        filename: row.filename,
        content_ref: row.content_ref,
        recognition_result: from_json(row.recognition_json)?,
        extracted_fields: from_json(row.extracted_fields_json)?,
        validation_errors: from_json(row.validation_errors_json)?,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}
