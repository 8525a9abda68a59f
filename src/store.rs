//! # Transactional persistence.
//!
//! A façade over SQLite (with FTS5) holding every model. Reads may run
//! concurrently on pooled connections; all mutations go through a
//! [`Transaction`] guard that serializes writers behind a store-wide lock and
//! batches change deltas until commit, so observers never see uncommitted
//! state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::folder::Folder;
use crate::imap::UidRange;
use crate::message::{Message, MessageAttributes};

pub(crate) mod migrations;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Capability set every persisted model provides: a table, the projected
/// columns used as indices, and bind/load through the JSON data blob. A
/// single store API dispatches on these; there is no inheritance.
pub trait Model: Serialize + DeserializeOwned {
    const TABLE: &'static str;
    /// Projected columns beyond the shared id/accountId/version/data set.
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> &str;
    fn account_id(&self) -> &str;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
    /// Values for `COLUMNS`, in order.
    fn column_values(&self) -> Result<Vec<Value>>;

    /// Runs after the model is written, inside the same transaction.
    fn after_save(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }

    /// Runs after the model is deleted, inside the same transaction.
    fn after_remove(&self, _tx: &mut Transaction) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    Persist,
    Unpersist,
}

/// One outbound change notification, flushed to the client on commit.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "objectClass")]
    pub object_class: &'static str,
    pub objects: Vec<serde_json::Value>,
    pub op: DeltaOp,
}

/// Conversion into SQLite values for query parameters.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Integer(self)
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        Value::Integer(self as i64)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Integer(self as i64)
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Equal(String, Value),
    Any(String, Vec<Value>),
}

/// Minimal structured query over a model table's projected columns.
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
    limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn equal(mut self, column: &str, value: impl IntoValue) -> Self {
        self.clauses
            .push(Clause::Equal(column.to_string(), value.into_value()));
        self
    }

    pub fn any<V: IntoValue>(mut self, column: &str, values: Vec<V>) -> Self {
        self.clauses.push(Clause::Any(
            column.to_string(),
            values.into_iter().map(IntoValue::into_value).collect(),
        ));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut values = Vec::new();
        for (i, clause) in self.clauses.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            match clause {
                Clause::Equal(column, value) => {
                    sql.push_str(column);
                    sql.push_str(" = ?");
                    values.push(value.clone());
                }
                Clause::Any(_, list) if list.is_empty() => {
                    sql.push_str("1 = 0");
                }
                Clause::Any(column, list) => {
                    sql.push_str(column);
                    sql.push_str(" IN (");
                    sql.push_str(&crate::tools::qmarks(list.len()));
                    sql.push(')');
                    values.extend(list.iter().cloned());
                }
            }
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        (sql, values)
    }
}

pub struct Store {
    dir: PathBuf,
    pool: DbPool,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    delta_tx: Option<async_channel::Sender<DeltaFrame>>,
}

impl Store {
    /// Opens (creating and migrating if necessary) the database under `dir`.
    pub fn open(dir: &Path, delta_tx: Option<async_channel::Sender<DeltaFrame>>) -> Result<Store> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create config dir {}", dir.display()))?;
        let manager = SqliteConnectionManager::file(dir.join("edgehill.db")).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;\
                 PRAGMA synchronous = NORMAL;\
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = r2d2::Pool::builder().max_size(4).build(manager)?;
        let conn = pool.get()?;
        migrations::run(&conn)?;
        drop(conn);
        Ok(Store {
            dir: dir.to_path_buf(),
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            delta_tx,
        })
    }

    /// Directory attachment bytes are written under.
    pub fn files_root(&self) -> PathBuf {
        self.dir.join("files")
    }

    /// Opens a write transaction. There is at most one at a time; reads stay
    /// unaffected.
    pub async fn begin(&self) -> Result<Transaction<'_>> {
        let guard = self.write_lock.clone().lock_owned().await;
        let conn = self.pool.get()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Transaction {
            store: self,
            conn,
            _guard: guard,
            deltas: Vec::new(),
            done: false,
        })
    }

    pub fn find<M: Model>(&self, query: &Query) -> Result<Option<M>> {
        let conn = self.pool.get()?;
        find_where(&conn, query)
    }

    pub fn find_all<M: Model>(&self, query: &Query) -> Result<Vec<M>> {
        let conn = self.pool.get()?;
        find_all_where(&conn, query)
    }

    pub fn find_all_map<M: Model, K: std::hash::Hash + Eq>(
        &self,
        query: &Query,
        key: impl Fn(&M) -> K,
    ) -> Result<HashMap<K, M>> {
        Ok(self
            .find_all::<M>(query)?
            .into_iter()
            .map(|m| (key(&m), m))
            .collect())
    }

    /// Saves a single model in its own short transaction.
    pub async fn save<M: Model>(&self, model: &mut M, emit: bool) -> Result<()> {
        let mut tx = self.begin().await?;
        tx.save(model, emit)?;
        tx.commit()
    }

    /// Returns the `depth`-th most recent known UID in `folder` with
    /// UID ≤ `ceiling`, or 1 if fewer exist.
    pub fn fetch_message_uid_at_depth(
        &self,
        folder: &Folder,
        depth: u32,
        ceiling: u32,
    ) -> Result<u32> {
        let conn = self.pool.get()?;
        let uid: Option<i64> = conn
            .query_row(
                "SELECT remoteUID FROM Message WHERE remoteFolderId = ? AND remoteUID <= ? \
                 ORDER BY remoteUID DESC LIMIT 1 OFFSET ?",
                rusqlite::params![folder.id, ceiling as i64, depth as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(uid.map(|u| u as u32).unwrap_or(1))
    }

    /// Flag/label attributes for every known message in the UID range,
    /// keyed by UID, for diffing against the server's view.
    pub fn fetch_messages_attributes_in_range(
        &self,
        range: UidRange,
        folder: &Folder,
    ) -> Result<HashMap<u32, MessageAttributes>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT remoteUID, unread, starred, draft, labels FROM Message \
             WHERE remoteFolderId = ? AND remoteUID BETWEEN ? AND ?",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![folder.id, range.lo as i64, range.hi as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )?;
        let mut out = HashMap::new();
        for row in rows {
            let (uid, unread, starred, draft, labels) = row?;
            let uid = uid as u32;
            out.insert(
                uid,
                MessageAttributes {
                    uid,
                    unread: unread != 0,
                    starred: starred != 0,
                    draft: draft != 0,
                    labels: labels
                        .map(|l| serde_json::from_str(&l).unwrap_or_default())
                        .unwrap_or_default(),
                },
            );
        }
        Ok(out)
    }

    /// Recent or draft messages in the folder that have no stored body yet,
    /// newest first.
    pub fn fetch_messages_missing_bodies(
        &self,
        folder_id: &str,
        not_before: i64,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT Message.data FROM Message \
             LEFT JOIN MessageBody ON MessageBody.id = Message.id \
             WHERE Message.remoteFolderId = ? AND (Message.date > ? OR Message.draft = 1) \
             AND MessageBody.value IS NULL \
             ORDER BY Message.date DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![folder_id, not_before, limit as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for data in rows {
            out.push(serde_json::from_str(&data?)?);
        }
        Ok(out)
    }

    /// Stored body HTML for a message, if fetched.
    pub fn fetch_body(&self, message_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT value FROM MessageBody WHERE id = ?",
                [message_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn find_where<M: Model>(conn: &Connection, query: &Query) -> Result<Option<M>> {
    let mut first = query.clone();
    first.limit = Some(1);
    let (where_sql, values) = first.to_sql();
    let sql = format!("SELECT data FROM {}{}", M::TABLE, where_sql);
    let data: Option<String> = conn
        .query_row(&sql, params_from_iter(values), |row| row.get(0))
        .optional()?;
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

fn find_all_where<M: Model>(conn: &Connection, query: &Query) -> Result<Vec<M>> {
    let (where_sql, values) = query.to_sql();
    let sql = format!("SELECT data FROM {}{}", M::TABLE, where_sql);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for data in rows {
        out.push(serde_json::from_str(&data?)?);
    }
    Ok(out)
}

/// Scoped write transaction. Commits on [`Transaction::commit`], rolls back
/// when dropped without it. Buffered deltas reach observers only on commit.
pub struct Transaction<'a> {
    store: &'a Store,
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
    deltas: Vec<(DeltaOp, &'static str, serde_json::Value)>,
    done: bool,
}

impl Transaction<'_> {
    /// Raw connection for the non-model tables (FTS, references, counts).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn find<M: Model>(&self, query: &Query) -> Result<Option<M>> {
        find_where(&self.conn, query)
    }

    pub fn find_all<M: Model>(&self, query: &Query) -> Result<Vec<M>> {
        find_all_where(&self.conn, query)
    }

    pub fn find_all_map<M: Model, K: std::hash::Hash + Eq>(
        &self,
        query: &Query,
        key: impl Fn(&M) -> K,
    ) -> Result<HashMap<K, M>> {
        Ok(self
            .find_all::<M>(query)?
            .into_iter()
            .map(|m| (key(&m), m))
            .collect())
    }

    /// Upserts a model: unsaved models (version 0) are INSERTed — a UNIQUE
    /// violation surfaces to the caller — saved ones are UPDATEd. The version
    /// column advances monotonically either way.
    pub fn save<M: Model>(&mut self, model: &mut M, emit: bool) -> Result<()> {
        if model.version() == 0 {
            model.set_version(1);
            let data = serde_json::to_string(model)?;
            let mut columns = vec!["id", "accountId", "version", "data"];
            columns.extend_from_slice(M::COLUMNS);
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                M::TABLE,
                columns.join(", "),
                crate::tools::qmarks(columns.len()),
            );
            let mut values = vec![
                Value::Text(model.id().to_string()),
                Value::Text(model.account_id().to_string()),
                Value::Integer(model.version()),
                Value::Text(data),
            ];
            values.extend(model.column_values()?);
            self.conn.execute(&sql, params_from_iter(values))?;
        } else {
            model.set_version(model.version() + 1);
            let data = serde_json::to_string(model)?;
            let mut assignments = vec![
                "accountId = ?".to_string(),
                "version = ?".to_string(),
                "data = ?".to_string(),
            ];
            assignments.extend(M::COLUMNS.iter().map(|c| format!("{c} = ?")));
            let sql = format!(
                "UPDATE {} SET {} WHERE id = ?",
                M::TABLE,
                assignments.join(", "),
            );
            let mut values = vec![
                Value::Text(model.account_id().to_string()),
                Value::Integer(model.version()),
                Value::Text(data),
            ];
            values.extend(model.column_values()?);
            values.push(Value::Text(model.id().to_string()));
            self.conn.execute(&sql, params_from_iter(values))?;
        }
        if emit {
            self.deltas
                .push((DeltaOp::Persist, M::TABLE, serde_json::to_value(&*model)?));
        }
        model.after_save(self)
    }

    pub fn remove<M: Model>(&mut self, model: &M) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", M::TABLE),
            [model.id()],
        )?;
        self.deltas
            .push((DeltaOp::Unpersist, M::TABLE, serde_json::to_value(model)?));
        model.after_remove(self)
    }

    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;

        if let Some(delta_tx) = &self.store.delta_tx {
            // Coalesce runs of the same (class, op) into one frame.
            let mut frame: Option<DeltaFrame> = None;
            for (op, class, object) in self.deltas.drain(..) {
                match &mut frame {
                    Some(f) if f.op == op && f.object_class == class => f.objects.push(object),
                    _ => {
                        if let Some(f) = frame.take() {
                            delta_tx.try_send(f).ok();
                        }
                        frame = Some(DeltaFrame {
                            kind: "delta",
                            object_class: class,
                            objects: vec![object],
                            op,
                        });
                    }
                }
            }
            if let Some(f) = frame {
                delta_tx.try_send(f).ok();
            }
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.execute_batch("ROLLBACK").ok();
        }
    }
}

/// Whether the error chain bottoms out in a SQLite uniqueness/constraint
/// violation, the signal `insert_fallback_to_update` pivots on.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

#[cfg(test)]
mod store_tests;
