//! # Task execution.
//!
//! Tasks run in two phases: `perform_local` applies the optimistic change to
//! the store the moment the client posts the task, `perform_remote` commits
//! it against the server from the foreground worker. Retryable transport
//! failures leave a task in `remote` so the next cycle picks it up again.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing::{info, warn};

use crate::account::Account;
use crate::error::classify;
use crate::imap::session::Session;
use crate::message::{FolderRef, Message};
use crate::smtp;
use crate::store::{Query, Store};
use crate::task::{Draft, Task, TaskKind, TaskStatus};
use crate::thread::Thread;
use crate::tools;

pub struct TaskProcessor {
    account: Arc<Account>,
    store: Arc<Store>,
}

impl TaskProcessor {
    pub fn new(account: Arc<Account>, store: Arc<Store>) -> Self {
        TaskProcessor { account, store }
    }

    /// Applies the optimistic local change and advances the task to
    /// `remote`. Idempotent on re-entry; precondition failures park the task
    /// in `local-error` with a structured payload.
    pub async fn perform_local(&self, task: &mut Task) -> Result<()> {
        let kind = task.kind.clone();
        let outcome = match &kind {
            TaskKind::MarkUnread { ids, unread } => {
                self.local_update_messages(ids, |m| m.unread = *unread).await
            }
            TaskKind::MarkStarred { ids, starred } => {
                self.local_update_messages(ids, |m| m.starred = *starred).await
            }
            TaskKind::ChangeFolder { ids, folder } => {
                self.local_change_folder(ids, folder).await
            }
            TaskKind::ChangeLabels {
                ids,
                labels_to_add,
                labels_to_remove,
            } => {
                self.local_update_messages(ids, |m| {
                    m.remote_xgm_labels
                        .retain(|label| !labels_to_remove.contains(label));
                    for label in labels_to_add {
                        if !m.remote_xgm_labels.contains(label) {
                            m.remote_xgm_labels.push(label.clone());
                        }
                    }
                })
                .await
            }
            TaskKind::SyncbackDraft { draft } => self.local_syncback_draft(draft).await,
            TaskKind::SendDraft { message_id } => self.require_draft(message_id).map(|_| ()),
            TaskKind::DestroyDraft { message_id } => self.local_destroy_draft(message_id).await,
            TaskKind::ExpungeAllInFolder { folder } => self.local_expunge_folder(folder).await,
        };

        match outcome {
            Ok(()) => task.status = TaskStatus::Remote,
            Err(err) => {
                warn!("task {} failed locally: {err:#}", task.id);
                task.set_error(TaskStatus::LocalError, format!("{err:#}"));
            }
        }
        self.store.save(task, true).await
    }

    /// Commits the task against the server. Runs only on the foreground
    /// worker's session.
    pub async fn perform_remote(&self, task: &mut Task, session: &mut Session) -> Result<()> {
        if task.should_cancel {
            info!("task {} cancelled before remote execution", task.id);
            task.status = TaskStatus::Cancelled;
            return self.store.save(task, true).await;
        }

        let kind = task.kind.clone();
        let outcome = match &kind {
            TaskKind::MarkUnread { ids, unread } => {
                let query = if *unread { "-FLAGS (\\Seen)" } else { "+FLAGS (\\Seen)" };
                self.remote_store_flags(session, ids, query).await
            }
            TaskKind::MarkStarred { ids, starred } => {
                let query = if *starred { "+FLAGS (\\Flagged)" } else { "-FLAGS (\\Flagged)" };
                self.remote_store_flags(session, ids, query).await
            }
            TaskKind::ChangeFolder { ids, folder } => {
                self.remote_change_folder(session, ids, folder).await
            }
            TaskKind::ChangeLabels {
                ids,
                labels_to_add,
                labels_to_remove,
            } => {
                self.remote_change_labels(session, ids, labels_to_add, labels_to_remove)
                    .await
            }
            TaskKind::SyncbackDraft { draft } => self.remote_syncback_draft(session, draft).await,
            TaskKind::SendDraft { message_id } => self.remote_send_draft(message_id).await,
            TaskKind::DestroyDraft { message_id } => {
                self.remote_destroy_draft(session, message_id).await
            }
            TaskKind::ExpungeAllInFolder { folder } => session.expunge_all(&folder.path).await,
        };

        match outcome {
            Ok(()) => {
                info!("task {} complete", task.id);
                task.status = TaskStatus::Complete;
                self.store.save(task, true).await
            }
            Err(err) if classify(&err) == "retryable" => {
                // Leave the task in `remote`; the worker reconnects and the
                // next cycle retries it.
                Err(err)
            }
            Err(err) => {
                warn!("task {} failed remotely: {err:#}", task.id);
                task.set_error(TaskStatus::RemoteError, format!("{err:#}"));
                self.store.save(task, true).await
            }
        }
    }

    // ---- Local phase ----------------------------------------------------

    async fn local_update_messages(
        &self,
        ids: &[String],
        apply: impl Fn(&mut Message),
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut messages =
            tx.find_all::<Message>(&Query::new().any("id", ids.to_vec()))?;
        if messages.len() != ids.len() {
            bail!("one or more messages no longer exist");
        }
        for message in messages.iter_mut() {
            apply(message);
            tx.save(message, true)?;
        }
        tx.commit()
    }

    async fn local_change_folder(&self, ids: &[String], folder: &FolderRef) -> Result<()> {
        let target = self
            .store
            .find::<crate::folder::Folder>(&Query::new().equal("id", folder.id.as_str()))?
            .with_context(|| format!("target folder {} does not exist", folder.id))?;
        self.local_update_messages(ids, |m| {
            m.client_folder = Some(FolderRef::of(&target));
        })
        .await
    }

    fn require_draft(&self, message_id: &str) -> Result<Message> {
        let message = self
            .store
            .find::<Message>(&Query::new().equal("id", message_id))?
            .with_context(|| format!("draft {message_id} does not exist"))?;
        if !message.draft {
            bail!("message {message_id} is not a draft");
        }
        Ok(message)
    }

    async fn local_syncback_draft(&self, draft: &Draft) -> Result<()> {
        let drafts_folder = self
            .store
            .find::<crate::folder::Folder>(&Query::new().equal("role", "drafts"))?
            .context("account has no drafts folder")?;

        let mut tx = self.store.begin().await?;
        let existing = match &draft.id {
            Some(id) => tx.find::<Message>(&Query::new().equal("id", id.as_str()))?,
            None => None,
        };

        let mut message = match existing {
            Some(mut message) => {
                message.subject = draft.subject.clone();
                message.to = draft.to.clone();
                message.cc = draft.cc.clone();
                message.bcc = draft.bcc.clone();
                message
            }
            None => {
                let id = draft
                    .id
                    .clone()
                    .unwrap_or_else(tools::id_randomly_generated);
                Message {
                    id: id.clone(),
                    account_id: self.account.id.clone(),
                    version: 0,
                    thread_id: String::new(),
                    header_message_id: format!("{id}@mailsync"),
                    gmail_message_id: None,
                    gmail_thread_id: None,
                    subject: draft.subject.clone(),
                    snippet: tools::truncate(&tools::flatten_html(&draft.body), 400).to_string(),
                    date: tools::time(),
                    unread: false,
                    starred: false,
                    draft: true,
                    remote_uid: 0,
                    remote_folder: FolderRef::of(&drafts_folder),
                    client_folder: Some(FolderRef::of(&drafts_folder)),
                    remote_xgm_labels: Vec::new(),
                    synced_at: 0,
                    to: draft.to.clone(),
                    from: vec![crate::message::Participant {
                        name: String::new(),
                        email: self.account.email_address.clone(),
                    }],
                    cc: draft.cc.clone(),
                    bcc: draft.bcc.clone(),
                    files: Vec::new(),
                }
            }
        };

        if message.thread_id.is_empty() {
            let mut thread = Thread::new(
                message.id.clone(),
                &self.account.id,
                &message.subject,
                None,
            );
            message.thread_id = thread.id.clone();
            tx.save(&mut thread, true)?;
        }
        tx.save(&mut message, true)?;
        crate::processor::upsert_thread_references(
            &tx,
            &message.thread_id,
            &self.account.id,
            &message.header_message_id,
            &[],
        )?;
        tx.conn().execute(
            "REPLACE INTO MessageBody (id, value, fetchedAt) VALUES (?, ?, ?)",
            rusqlite::params![message.id, draft.body, tools::time()],
        )?;
        tx.commit()
    }

    async fn local_destroy_draft(&self, message_id: &str) -> Result<()> {
        let Some(message) = self
            .store
            .find::<Message>(&Query::new().equal("id", message_id))?
        else {
            // Already gone; destroying twice is fine.
            return Ok(());
        };
        let mut tx = self.store.begin().await?;
        tx.remove(&message)?;
        tx.commit()
    }

    async fn local_expunge_folder(&self, folder: &FolderRef) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let messages =
            tx.find_all::<Message>(&Query::new().equal("remoteFolderId", folder.id.as_str()))?;
        for message in &messages {
            tx.remove(message)?;
        }
        tx.commit()
    }

    // ---- Remote phase ---------------------------------------------------

    fn load_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
        self.store
            .find_all::<Message>(&Query::new().any("id", ids.to_vec()))
    }

    /// Messages grouped by the folder they live in on the server, skipping
    /// anything unlinked or never synced.
    fn group_by_folder(messages: &[Message]) -> HashMap<String, Vec<u32>> {
        let mut groups: HashMap<String, Vec<u32>> = HashMap::new();
        for message in messages {
            if message.remote_uid == 0 || message.is_unlinked() {
                continue;
            }
            groups
                .entry(message.remote_folder.path.clone())
                .or_default()
                .push(message.remote_uid);
        }
        groups
    }

    async fn remote_store_flags(
        &self,
        session: &mut Session,
        ids: &[String],
        query: &str,
    ) -> Result<()> {
        let messages = self.load_messages(ids)?;
        for (path, uids) in Self::group_by_folder(&messages) {
            session.store(&path, &uids, query).await?;
        }
        Ok(())
    }

    async fn remote_change_folder(
        &self,
        session: &mut Session,
        ids: &[String],
        folder: &FolderRef,
    ) -> Result<()> {
        let messages = self.load_messages(ids)?;
        for (path, uids) in Self::group_by_folder(&messages) {
            if path == folder.path {
                continue;
            }
            session.move_messages(&path, &uids, &folder.path).await?;
        }
        Ok(())
    }

    async fn remote_change_labels(
        &self,
        session: &mut Session,
        ids: &[String],
        labels_to_add: &[String],
        labels_to_remove: &[String],
    ) -> Result<()> {
        let messages = self.load_messages(ids)?;
        for (path, uids) in Self::group_by_folder(&messages) {
            if !labels_to_add.is_empty() {
                let query = format!("+X-GM-LABELS ({})", format_labels(labels_to_add));
                session.store(&path, &uids, &query).await?;
            }
            if !labels_to_remove.is_empty() {
                let query = format!("-X-GM-LABELS ({})", format_labels(labels_to_remove));
                session.store(&path, &uids, &query).await?;
            }
        }
        Ok(())
    }

    async fn remote_syncback_draft(&self, session: &mut Session, draft: &Draft) -> Result<()> {
        let id = draft.id.as_deref().context("draft has no id")?;
        let message = self.require_draft(id)?;
        let body = self
            .store
            .fetch_body(&message.id)?
            .context("draft has no body")?;
        let mime = smtp::build_mime(&self.account, &message, &body)?;
        session.append(&message.remote_folder.path, &mime).await
    }

    async fn remote_send_draft(&self, message_id: &str) -> Result<()> {
        let message = self.require_draft(message_id)?;
        let body = self
            .store
            .fetch_body(&message.id)?
            .context("draft has no body")?;
        smtp::send(&self.account, &message, &body).await
    }

    async fn remote_destroy_draft(&self, session: &mut Session, message_id: &str) -> Result<()> {
        let Some(message) = self
            .store
            .find::<Message>(&Query::new().equal("id", message_id))?
        else {
            return Ok(());
        };
        if message.remote_uid == 0 || message.is_unlinked() {
            return Ok(());
        }
        session
            .store(
                &message.remote_folder.path,
                &[message.remote_uid],
                "+FLAGS (\\Deleted)",
            )
            .await?;
        session.expunge().await
    }
}

/// Gmail labels in STORE syntax: special labels are atoms, everything else
/// is quoted.
fn format_labels(labels: &[String]) -> String {
    labels
        .iter()
        .map(|label| {
            if label.starts_with('\\') {
                label.clone()
            } else {
                format!("\"{}\"", label.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod task_processor_tests;
