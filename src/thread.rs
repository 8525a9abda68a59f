//! # Thread model.
//!
//! A thread is a conversation aggregator. It exists iff it has at least one
//! message; its counters are derived state recomputed whenever one of its
//! messages is saved or removed.

use std::collections::BTreeSet;

use anyhow::Result;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::store::{Model, Query, Transaction};

/// A conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub gmail_thread_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub unread: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub attachments: i64,
    /// Folder and label ids the thread's messages currently touch.
    #[serde(default)]
    pub categories: Vec<String>,
    /// Rowid of the thread's ThreadSearch FTS row, once indexed.
    #[serde(default)]
    pub search_row_id: Option<i64>,
}

impl Thread {
    /// New threads take the founding message's id as their own.
    pub fn new(
        id: String,
        account_id: &str,
        subject: &str,
        gmail_thread_id: Option<String>,
    ) -> Self {
        Thread {
            id,
            account_id: account_id.to_string(),
            version: 0,
            gmail_thread_id,
            subject: subject.to_string(),
            unread: 0,
            total: 0,
            attachments: 0,
            categories: Vec::new(),
            search_row_id: None,
        }
    }

    /// Search terms for the categories column of the thread's FTS row.
    pub fn categories_search_string(&self) -> String {
        self.categories.join(" ")
    }

    /// Recomputes the thread's counters and category memberships from its
    /// messages, maintains the per-category ThreadCounts aggregates, and
    /// deletes the thread (plus references and search row) when its last
    /// message is gone.
    pub(crate) fn recompute(tx: &mut Transaction, thread_id: &str) -> Result<()> {
        let Some(mut thread) = tx.find::<Thread>(&Query::new().equal("id", thread_id))? else {
            return Ok(());
        };

        let messages = tx.find_all::<Message>(&Query::new().equal("threadId", thread_id))?;

        let old_categories: BTreeSet<String> = thread.categories.iter().cloned().collect();
        let old_unread = thread.unread > 0;

        if messages.is_empty() {
            for category in &old_categories {
                adjust_thread_counts(tx, category, -1, if old_unread { -1 } else { 0 })?;
            }
            tx.conn()
                .execute("DELETE FROM ThreadReference WHERE threadId = ?", [thread_id])?;
            if let Some(row_id) = thread.search_row_id {
                tx.conn()
                    .execute("DELETE FROM ThreadSearch WHERE rowid = ?", [row_id])?;
            }
            return tx.remove(&thread);
        }

        let mut categories: BTreeSet<String> = BTreeSet::new();
        let mut label_names: BTreeSet<String> = BTreeSet::new();
        let mut unread = 0;
        let mut attachments = 0;
        for message in &messages {
            categories.insert(message.remote_folder.id.clone());
            for label in &message.remote_xgm_labels {
                label_names.insert(label.clone());
            }
            if message.unread {
                unread += 1;
            }
            attachments += message.files.len() as i64;
        }
        for id in resolve_label_ids(tx, &thread.account_id, &label_names)? {
            categories.insert(id);
        }

        thread.unread = unread;
        thread.total = messages.len() as i64;
        thread.attachments = attachments;
        thread.categories = categories.iter().cloned().collect();

        let new_unread = thread.unread > 0;
        for removed in old_categories.difference(&categories) {
            adjust_thread_counts(tx, removed, -1, if old_unread { -1 } else { 0 })?;
        }
        for added in categories.difference(&old_categories) {
            adjust_thread_counts(tx, added, 1, if new_unread { 1 } else { 0 })?;
        }
        if new_unread != old_unread {
            let delta = if new_unread { 1 } else { -1 };
            for kept in categories.intersection(&old_categories) {
                adjust_thread_counts(tx, kept, 0, delta)?;
            }
        }

        tx.save(&mut thread, true)
    }
}

fn adjust_thread_counts(
    tx: &mut Transaction,
    category_id: &str,
    total_delta: i64,
    unread_delta: i64,
) -> Result<()> {
    if total_delta == 0 && unread_delta == 0 {
        return Ok(());
    }
    tx.conn().execute(
        "INSERT OR IGNORE INTO ThreadCounts (categoryId, unread, total) VALUES (?, 0, 0)",
        [category_id],
    )?;
    tx.conn().execute(
        "UPDATE ThreadCounts SET total = MAX(0, total + ?), unread = MAX(0, unread + ?) \
         WHERE categoryId = ?",
        rusqlite::params![total_delta, unread_delta, category_id],
    )?;
    Ok(())
}

/// Maps X-GM-LABELS values onto local Label ids. Special labels like
/// `\Inbox` match by role, plain names match the label path.
fn resolve_label_ids(
    tx: &Transaction,
    account_id: &str,
    names: &BTreeSet<String>,
) -> Result<Vec<String>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = tx
        .conn()
        .prepare("SELECT id, path, role FROM Label WHERE accountId = ?")?;
    let rows = stmt.query_map([account_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, path, role) = row?;
        for name in names {
            let special = name.trim_start_matches('\\').to_lowercase();
            if *name == path || (!role.is_empty() && special == role) {
                out.push(id.clone());
                break;
            }
        }
    }
    Ok(out)
}

impl Model for Thread {
    const TABLE: &'static str = "Thread";
    const COLUMNS: &'static [&'static str] = &["gThrId", "subject", "unread", "total"];

    fn id(&self) -> &str {
        &self.id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn column_values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            match &self.gmail_thread_id {
                Some(id) => Value::Text(id.clone()),
                None => Value::Null,
            },
            Value::Text(self.subject.clone()),
            Value::Integer(self.unread),
            Value::Integer(self.total),
        ])
    }
}
