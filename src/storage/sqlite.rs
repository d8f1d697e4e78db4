//! SQLite storage implementation.
//!
//! This module provides the durable backend for tracklink. One database
//! holds the local work items, the sync key-value state and the audit
//! trail. It follows the MutationContext pattern for transaction
//! discipline and audit logging.

use crate::error::{Error, Result};
use crate::model::{EntityKind, LocalEntity};
use crate::storage::events::{get_events, insert_event, Event, EventType};
use crate::storage::kv::{ns, KeyValueStore, KvWrite};
use crate::storage::local::LocalStore;
use crate::storage::schema::apply_schema;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::time::Duration;

/// Actor recorded when no explicit actor is configured.
pub const DEFAULT_ACTOR: &str = "tl";

/// SQLite-based storage backend.
///
/// The connection sits behind a mutex so one handle can be shared by the
/// sync tasks; statements are short and never held across an `.await`.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    actor: String,
}

/// Context for a mutation operation, tracking side effects.
///
/// This struct is passed to mutation closures to record audit events that
/// are written in the same transaction.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation.
    pub actor: String,
    /// Events to write at the end of the transaction.
    pub events: Vec<Event>,
}

impl MutationContext {
    /// Create a new mutation context.
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
        }
    }

    /// Record an event for this operation.
    pub fn record_event(&mut self, entity_type: &str, entity_id: &str, event_type: EventType) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor).with_comment(&self.op_name),
        );
    }

    /// Record an event with old/new values for field tracking.
    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor)
                .with_values(old_value, new_value)
                .with_comment(&self.op_name),
        );
    }
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            actor: DEFAULT_ACTOR.to_string(),
        })
    }

    /// Set the actor recorded in audit events.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Writes audit events
    /// 4. Commits (or rolls back on error)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R>(&self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = MutationContext::new(op, &self.actor);

        // Execute the mutation
        let result = f(&tx, &mut ctx)?;

        // Write audit events
        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        // Commit
        tx.commit()?;

        Ok(result)
    }

    /// Audit history for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_for(&self, entity_type: &str, entity_id: &str, limit: Option<u32>) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        Ok(get_events(&conn, entity_type, entity_id, limit)?)
    }

    /// Number of local entities of one kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_entities(&self, kind: EntityKind) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

// ==================
// Local Entities
// ==================

impl LocalStore for SqliteStorage {
    fn load(&self, id: &str) -> Result<Option<LocalEntity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, title, status, assignee, milestone, description, labels, updated_at
             FROM entities WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], map_entity_row).optional()?)
    }

    fn save(&self, entity: &LocalEntity) -> Result<()> {
        let labels = serde_json::to_string(&entity.labels)?;

        self.mutate("save_entity", |tx, ctx| {
            let previous_status: Option<String> = tx
                .query_row(
                    "SELECT status FROM entities WHERE id = ?1",
                    [&entity.id],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO entities (id, kind, title, status, assignee, milestone, description, labels, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   kind = excluded.kind,
                   title = excluded.title,
                   status = excluded.status,
                   assignee = excluded.assignee,
                   milestone = excluded.milestone,
                   description = excluded.description,
                   labels = excluded.labels,
                   updated_at = excluded.updated_at",
                rusqlite::params![
                    entity.id,
                    entity.kind.as_str(),
                    entity.title,
                    entity.status,
                    entity.assignee,
                    entity.milestone,
                    entity.description,
                    labels,
                    entity.updated_at,
                ],
            )?;

            match previous_status {
                None => ctx.record_event(entity.kind.as_str(), &entity.id, EventType::EntityCreated),
                Some(old) => ctx.record_change(
                    entity.kind.as_str(),
                    &entity.id,
                    EventType::EntityUpdated,
                    Some(old),
                    Some(entity.status.clone()),
                ),
            }

            Ok(())
        })
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<LocalEntity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, title, status, assignee, milestone, description, labels, updated_at
             FROM entities WHERE kind = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([kind.as_str()], map_entity_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        self.mutate("remove_entity", |tx, ctx| {
            let kind: Option<String> = tx
                .query_row("SELECT kind FROM entities WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            let Some(kind) = kind else {
                return Ok(false);
            };
            tx.execute("DELETE FROM entities WHERE id = ?1", [id])?;
            ctx.record_event(&kind, id, EventType::EntityRemoved);
            Ok(true)
        })
    }
}

fn map_entity_row(row: &rusqlite::Row) -> rusqlite::Result<LocalEntity> {
    let kind: String = row.get(1)?;
    let labels: String = row.get(7)?;

    Ok(LocalEntity {
        id: row.get(0)?,
        kind: kind.parse().unwrap_or_default(),
        title: row.get(2)?,
        status: row.get(3)?,
        assignee: row.get(4)?,
        milestone: row.get(5)?,
        description: row.get(6)?,
        labels: serde_json::from_str(&labels).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        updated_at: row.get(8)?,
    })
}

// ==================
// Sync Key-Value State
// ==================

impl KeyValueStore for SqliteStorage {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                [namespace, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        upsert_kv(&conn, namespace, key, value)?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            [namespace, key],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt.query_map([namespace], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        self.mutate("clear_namespace", |tx, ctx| {
            let removed = tx.execute("DELETE FROM kv_entries WHERE namespace = ?1", [namespace])?;
            if namespace == ns::CACHE && removed > 0 {
                ctx.record_event("cache", "*", EventType::CacheCleared);
            }
            Ok(removed)
        })
    }

    fn write_batch(&self, writes: &[KvWrite]) -> Result<()> {
        self.mutate("write_batch", |tx, ctx| {
            for write in writes {
                match write {
                    KvWrite::Put {
                        namespace,
                        key,
                        value,
                    } => {
                        upsert_kv(tx, namespace, key, value)?;
                        match *namespace {
                            ns::LINK_LOCAL => ctx.record_change(
                                "link",
                                key,
                                EventType::LinkCreated,
                                None,
                                Some(value.clone()),
                            ),
                            ns::BASE => ctx.record_event("remote", key, EventType::SyncCommitted),
                            _ => {}
                        }
                    }
                    KvWrite::Delete { namespace, key } => {
                        tx.execute(
                            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                            [*namespace, key.as_str()],
                        )?;
                        if *namespace == ns::LINK_LOCAL {
                            ctx.record_event("link", key, EventType::LinkRemoved);
                        }
                    }
                    KvWrite::Require {
                        namespace,
                        key,
                        value,
                    } => {
                        let current: Option<String> = tx
                            .query_row(
                                "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                                [*namespace, key.as_str()],
                                |row| row.get(0),
                            )
                            .optional()?;
                        if current.as_ref() != value.as_ref() {
                            return Err(write.conflict());
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn upsert_kv(conn: &Connection, namespace: &str, key: &str, value: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO kv_entries (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        rusqlite::params![namespace, key, value, chrono::Utc::now().timestamp_millis()],
    )
}
