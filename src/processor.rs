//! # Message ingestion.
//!
//! Inserts and updates messages, attaches them to conversations via the
//! provider thread id or References, maintains the thread/contact search
//! indices, and implements the two-phase unlink-then-delete protocol that
//! tolerates cross-folder moves. Every operation runs under a single
//! transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use mailparse::{MailHeaderMap, ParsedMail};
use rusqlite::OptionalExtension;
use tracing::{info, warn};

use crate::account::Account;
use crate::contact::Contact;
use crate::folder::Folder;
use crate::imap::RemoteMessage;
use crate::message::{File, Message};
use crate::store::{is_unique_violation, Query, Store, Transaction};
use crate::thread::Thread;
use crate::tools;

/// Threading looks at the own Message-ID plus this many References.
const THREADING_REF_LIMIT: usize = 50;
/// ThreadReference rows are written for the own Message-ID plus this many
/// References.
const REFERENCE_UPSERT_LIMIT: usize = 100;
/// Messages carrying more unique correspondents than this are considered
/// mass mail and create no contacts.
const CONTACT_LIMIT: usize = 25;
/// Per-append cap on body text indexed into the thread's FTS row.
const SEARCH_BODY_CAP: usize = 5000;
const SNIPPET_CAP: usize = 400;

pub struct MailProcessor {
    account: Arc<Account>,
    store: Arc<Store>,
}

impl MailProcessor {
    pub fn new(account: Arc<Account>, store: Arc<Store>) -> Self {
        MailProcessor { account, store }
    }

    /// Attempts an insert; on a uniqueness violation, locates the existing
    /// row by its deterministic id and applies an update instead. Any other
    /// constraint failure surfaces unchanged.
    pub async fn insert_fallback_to_update(
        &self,
        remote: &RemoteMessage,
        folder: &Folder,
        synced_at: i64,
    ) -> Result<Message> {
        match self.insert_message(remote, folder, synced_at).await {
            Ok(message) => Ok(message),
            Err(err) if is_unique_violation(&err) => {
                let id = Message::id_for_remote(&self.account.id, &folder.path, remote);
                let Some(mut local) = self.store.find::<Message>(&Query::new().equal("id", id.as_str()))?
                else {
                    return Err(err);
                };
                self.update_message(&mut local, remote, folder, synced_at)
                    .await?;
                Ok(local)
            }
            Err(err) => Err(err),
        }
    }

    /// Inserts a new message, resolving (or creating) its thread and
    /// updating references, contacts, and the search index.
    pub async fn insert_message(
        &self,
        remote: &RemoteMessage,
        folder: &Folder,
        synced_at: i64,
    ) -> Result<Message> {
        let mut message = Message::from_remote(&self.account, remote, folder, synced_at);
        let mut tx = self.store.begin().await?;

        let mut thread = self
            .find_thread_for(&tx, &message, remote)?
            .unwrap_or_else(|| {
                Thread::new(
                    message.id.clone(),
                    &self.account.id,
                    &message.subject,
                    message.gmail_thread_id.clone(),
                )
            });
        message.thread_id = thread.id.clone();

        // Index the thread metadata once here; doing it in save hooks would
        // rewrite the FTS row on every flag change.
        append_to_thread_search(&mut tx, &mut thread, Some(&message), None)?;
        tx.save(&mut thread, true)?;
        tx.save(&mut message, true)?;

        upsert_thread_references(
            &tx,
            &thread.id,
            &self.account.id,
            &message.header_message_id,
            &remote.references,
        )?;
        self.upsert_contacts(&mut tx, &message)?;

        tx.commit()?;
        Ok(message)
    }

    fn find_thread_for(
        &self,
        tx: &Transaction<'_>,
        message: &Message,
        remote: &RemoteMessage,
    ) -> Result<Option<Thread>> {
        if let Some(gmail_thread_id) = &message.gmail_thread_id {
            return tx.find::<Thread>(&Query::new().equal("gThrId", gmail_thread_id.as_str()));
        }
        if tools::is_generated_message_id(&message.header_message_id) {
            return Ok(None);
        }

        // A rogue client can stuff References; bound what we look at.
        let mut ids: Vec<&str> = vec![&message.header_message_id];
        ids.extend(
            remote
                .references
                .iter()
                .take(THREADING_REF_LIMIT)
                .map(String::as_str),
        );
        let sql = format!(
            "SELECT Thread.data FROM Thread \
             INNER JOIN ThreadReference ON ThreadReference.threadId = Thread.id \
             WHERE ThreadReference.accountId = ? AND ThreadReference.headerMessageId IN ({}) \
             LIMIT 1",
            tools::qmarks(ids.len())
        );
        let mut params: Vec<&str> = vec![&self.account.id];
        params.extend(ids);
        let data: Option<String> = tx
            .conn()
            .query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Applies remote attributes onto an existing message. A record older
    /// than what we already applied is ignored; an identical one is a no-op.
    pub async fn update_message(
        &self,
        local: &mut Message,
        remote: &RemoteMessage,
        folder: &Folder,
        synced_at: i64,
    ) -> Result<()> {
        if local.synced_at > synced_at {
            warn!(
                "ignoring changes to {:?}, local data is newer ({} > {})",
                local.subject, local.synced_at, synced_at
            );
            return Ok(());
        }

        let same_folder = local.remote_folder.id == folder.id;
        let unchanged = local.unread == remote.unread
            && local.starred == remote.starred
            && local.draft == remote.draft
            && local.remote_uid == remote.uid
            && same_folder
            && local.remote_xgm_labels == remote.labels;
        if unchanged {
            return Ok(());
        }

        info!("updating message {} in {}", local.id, folder.path);
        local.unread = remote.unread;
        local.starred = remote.starred;
        local.draft = remote.draft;
        local.remote_uid = remote.uid;
        local.remote_folder = crate::message::FolderRef::of(folder);
        local.client_folder = Some(crate::message::FolderRef::of(folder));
        local.remote_xgm_labels = remote.labels.clone();
        local.synced_at = synced_at;

        let mut tx = self.store.begin().await?;
        tx.save(local, true)?;
        tx.commit()
    }

    /// Stores a fetched body: renders it, writes attachments to disk,
    /// updates the MessageBody row, the thread search index and the snippet.
    pub async fn retrieved_message_body(&self, message: &mut Message, raw: &[u8]) -> Result<()> {
        let parsed = mailparse::parse_mail(raw).context("could not parse message")?;

        let mut leaves = Vec::new();
        collect_leaf_parts(&parsed, "", &mut leaves);

        let body_part_id = select_body_part(&leaves);
        let html = match &body_part_id {
            Some(part_id) => leaves
                .iter()
                .find(|(id, _)| id == part_id)
                .and_then(|(_, part)| part.get_body().ok())
                .unwrap_or_default(),
            None => String::new(),
        };
        let text = tools::flatten_html(&html);

        // Build file rows and write their bytes before opening the
        // transaction; filesystem failures only cost us the file row.
        let files_root = self.store.files_root();
        let mut files: Vec<File> = Vec::new();
        for (part_id, part) in &leaves {
            if Some(part_id) == body_part_id.as_ref() || !is_attachment(part) {
                continue;
            }
            if files.iter().any(|f| &f.part_id == part_id) {
                continue;
            }
            let data = match part.get_body_raw() {
                Ok(data) => data,
                Err(err) => {
                    warn!("could not decode attachment {part_id}: {err:#}");
                    continue;
                }
            };
            let filename = attachment_filename(part)
                .unwrap_or_else(|| format!("part-{part_id}"));
            let mut file = File::new(
                message,
                part_id,
                &filename,
                &part.ctype.mimetype,
                data.len(),
            );
            file.content_id = part
                .headers
                .get_first_value("Content-ID")
                .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string());

            // Some senders reference inline images as cid:<filename> without
            // giving the part a Content-ID.
            if file.content_id.is_none() && html.contains(&format!("cid:{}", file.filename)) {
                file.content_id = Some(file.filename.clone());
            }

            let path = file.disk_path(&files_root);
            let write_result = path
                .parent()
                .map(std::fs::create_dir_all)
                .transpose()
                .and_then(|_| std::fs::write(&path, &data).map(Some));
            if let Err(err) = write_result {
                warn!("could not save file data for {}: {err:#}", file.id);
                continue;
            }
            files.push(file);
        }

        let mut tx = self.store.begin().await?;

        tx.conn().execute(
            "REPLACE INTO MessageBody (id, value, fetchedAt) VALUES (?, ?, ?)",
            rusqlite::params![message.id, html, tools::time()],
        )?;

        // Re-fetching a message can race previously stored files; tolerate
        // the uniqueness failure.
        for file in files.iter_mut() {
            if let Err(err) = tx.save(file, true) {
                if is_unique_violation(&err) {
                    warn!("file {} already exists", file.id);
                } else {
                    return Err(err);
                }
            }
        }

        if let Some(mut thread) =
            tx.find::<Thread>(&Query::new().equal("id", message.thread_id.as_str()))?
        {
            append_to_thread_search(&mut tx, &mut thread, None, Some(&text))?;
            tx.save(&mut thread, false)?;
        }

        message.snippet = tools::truncate(&text, SNIPPET_CAP).to_string();
        message.files = files;
        tx.save(message, true)?;

        tx.commit()
    }

    /// Marks every matched message as gone from its folder in this sweep
    /// without deleting it yet. Messages already unlinked keep their phase.
    pub async fn unlink_messages_matching_query(&self, query: &Query, phase: u32) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let messages = tx.find_all::<Message>(query)?;
        let log_subjects = messages.len() < 40;
        info!("unlinking {} messages no longer present in remote range", messages.len());

        for mut message in messages {
            if message.is_unlinked() {
                // Unlinked in a previous cycle; it will be deleted momentarily.
                continue;
            }
            if log_subjects {
                info!("-- unlinking {:?} ({})", message.subject, message.id);
            }
            message.remote_uid = u32::MAX - phase;
            // The client can't see the remoteUID, no delta needed.
            tx.save(&mut message, false)?;
        }
        tx.commit()
    }

    /// Deletes every message still unlinked at `phase`, in bounded chunks so
    /// a mass delete can't monopolize the write lock.
    pub async fn delete_messages_still_unlinked_from_phase(&self, phase: u32) -> Result<()> {
        let chunk_size = 100;
        loop {
            let mut tx = self.store.begin().await?;
            let messages = tx.find_all::<Message>(
                &Query::new()
                    .equal("accountId", self.account.id.as_str())
                    .equal("remoteUID", u32::MAX - phase)
                    .limit(chunk_size),
            )?;
            let more = messages.len() == chunk_size;
            for message in &messages {
                info!("-- removing {:?} ({})", message.subject, message.id);
                tx.remove(message)?;
            }
            tx.commit()?;
            if !more {
                return Ok(());
            }
        }
    }

    /// Collects correspondents for the composer autocomplete. Mass mail
    /// creates no contacts; refcounts only advance on messages the user sent.
    fn upsert_contacts(&self, tx: &mut Transaction<'_>, message: &Message) -> Result<()> {
        let mut by_email: BTreeMap<String, &crate::message::Participant> = BTreeMap::new();
        for participant in message.to.iter().chain(&message.cc).chain(&message.from) {
            let key = tools::contact_key_for_email(&participant.email);
            if !key.is_empty() {
                by_email.entry(key).or_insert(participant);
            }
        }
        if by_email.len() > CONTACT_LIMIT {
            return Ok(());
        }

        let increment = message.is_sent_by_user(&self.account.email_address);
        let existing = tx.find_all::<Contact>(
            &Query::new()
                .equal("accountId", self.account.id.as_str())
                .any("email", by_email.keys().cloned().collect()),
        )?;
        for mut contact in existing {
            if increment {
                contact.refs += 1;
                tx.save(&mut contact, false)?;
            }
            by_email.remove(&contact.email);
        }

        for (email, participant) in by_email {
            let mut contact = Contact::new(&self.account.id, &email, &participant.name);
            if increment {
                contact.refs += 1;
            }
            tx.save(&mut contact, false)?;
            tx.conn().execute(
                "INSERT INTO ContactSearch (content_id, content) VALUES (?, ?)",
                rusqlite::params![contact.id, contact.search_content()],
            )?;
        }
        Ok(())
    }
}

/// Makes the thread reachable from each of the message's identifiers. Every
/// (threadId, accountId, headerMessageId) tuple is inserted independently
/// and duplicates are ignored on the unique index.
pub(crate) fn upsert_thread_references(
    tx: &Transaction<'_>,
    thread_id: &str,
    account_id: &str,
    header_message_id: &str,
    references: &[String],
) -> Result<()> {
    let mut stmt = tx.conn().prepare(
        "INSERT OR IGNORE INTO ThreadReference (threadId, accountId, headerMessageId) \
         VALUES (?, ?, ?)",
    )?;
    stmt.execute(rusqlite::params![thread_id, account_id, header_message_id])?;
    for reference in references.iter().take(REFERENCE_UPSERT_LIMIT) {
        stmt.execute(rusqlite::params![thread_id, account_id, reference])?;
    }
    Ok(())
}

/// Read-modify-write of the thread's single FTS row: participants from the
/// message, body text capped per append, categories refreshed every time.
pub(crate) fn append_to_thread_search(
    tx: &mut Transaction<'_>,
    thread: &mut Thread,
    message: Option<&Message>,
    body_text: Option<&str>,
) -> Result<()> {
    let mut to = String::new();
    let mut from = String::new();
    let mut body = thread.subject.clone();

    if let Some(row_id) = thread.search_row_id {
        let existing = tx
            .conn()
            .query_row(
                "SELECT to_, from_, body FROM ThreadSearch WHERE rowid = ?",
                [row_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        if let Some((existing_to, existing_from, existing_body)) = existing {
            to = existing_to;
            from = existing_from;
            body = existing_body;
        }
    }

    if let Some(message) = message {
        for participant in message.to.iter().chain(&message.cc).chain(&message.bcc) {
            if !participant.email.is_empty() {
                to.push(' ');
                to.push_str(&participant.email);
            }
            if !participant.name.is_empty() {
                to.push(' ');
                to.push_str(&participant.name);
            }
        }
        for participant in &message.from {
            if !participant.email.is_empty() {
                from.push(' ');
                from.push_str(&participant.email);
            }
            if !participant.name.is_empty() {
                from.push(' ');
                from.push_str(&participant.name);
            }
        }
    }

    if let Some(text) = body_text {
        body.push(' ');
        body.push_str(tools::truncate(text, SEARCH_BODY_CAP));
    }

    let categories = thread.categories_search_string();
    if let Some(row_id) = thread.search_row_id {
        tx.conn().execute(
            "UPDATE ThreadSearch SET to_ = ?, from_ = ?, body = ?, categories = ? WHERE rowid = ?",
            rusqlite::params![to, from, body, categories, row_id],
        )?;
    } else {
        tx.conn().execute(
            "INSERT INTO ThreadSearch (to_, from_, body, categories, content_id) \
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![to, from, body, categories, thread.id],
        )?;
        thread.search_row_id = Some(tx.conn().last_insert_rowid());
    }
    Ok(())
}

fn collect_leaf_parts<'a, 'b>(
    part: &'a ParsedMail<'b>,
    prefix: &str,
    out: &mut Vec<(String, &'a ParsedMail<'b>)>,
) {
    if part.subparts.is_empty() {
        let id = if prefix.is_empty() { "1".to_string() } else { prefix.to_string() };
        out.push((id, part));
    } else {
        for (index, sub) in part.subparts.iter().enumerate() {
            let child = if prefix.is_empty() {
                format!("{}", index + 1)
            } else {
                format!("{prefix}.{}", index + 1)
            };
            collect_leaf_parts(sub, &child, out);
        }
    }
}

/// The part rendered as the message body: the first non-attachment text/html
/// leaf, falling back to text/plain.
fn select_body_part(leaves: &[(String, &ParsedMail<'_>)]) -> Option<String> {
    for wanted in ["text/html", "text/plain"] {
        for (part_id, part) in leaves {
            if part.ctype.mimetype.eq_ignore_ascii_case(wanted)
                && part.get_content_disposition().disposition
                    != mailparse::DispositionType::Attachment
            {
                return Some(part_id.clone());
            }
        }
    }
    None
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    let disposition = part.get_content_disposition();
    disposition.disposition == mailparse::DispositionType::Attachment
        || attachment_filename(part).is_some()
}

fn attachment_filename(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}
