//! # Message and File models.

use anyhow::Result;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::folder::Folder;
use crate::imap::RemoteMessage;
use crate::store::{Model, Transaction};
use crate::thread::Thread;
use crate::tools;

/// Sentinel region: `remoteUID = u32::MAX - phase` marks a message as
/// unlinked in that sweep phase. Anything above this bound is "already
/// unlinked".
pub const UNLINKED_UID_FLOOR: u32 = u32::MAX - 5;

/// Reference to a folder carried inside a message blob, so body fetches can
/// address the remote mailbox without a join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRef {
    pub id: String,
    pub path: String,
}

impl FolderRef {
    pub fn of(folder: &Folder) -> Self {
        FolderRef {
            id: folder.id.clone(),
            path: folder.path.clone(),
        }
    }
}

/// One mailbox participant (From/To/Cc/Bcc entry).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub name: String,
    pub email: String,
}

/// Flag/label attributes compared during UID-range reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageAttributes {
    pub uid: u32,
    pub unread: bool,
    pub starred: bool,
    pub draft: bool,
    pub labels: Vec<String>,
}

impl MessageAttributes {
    /// Label comparison ignores ordering.
    pub fn matches(&self, other: &MessageAttributes) -> bool {
        let mut mine = self.labels.clone();
        let mut theirs = other.labels.clone();
        mine.sort_unstable();
        theirs.sort_unstable();
        self.uid == other.uid
            && self.unread == other.unread
            && self.starred == other.starred
            && self.draft == other.draft
            && mine == theirs
    }
}

/// An attachment descriptor. Bytes live on the filesystem at a path derived
/// from the id (see [`File::disk_path`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    pub message_id: String,
    pub filename: String,
    pub part_id: String,
    pub content_type: String,
    #[serde(default)]
    pub content_id: Option<String>,
    pub size: usize,
}

impl File {
    pub fn new(message: &Message, part_id: &str, filename: &str, content_type: &str, size: usize) -> Self {
        File {
            id: tools::id_for_parts(&[&message.id, part_id]),
            account_id: message.account_id.clone(),
            version: 0,
            message_id: message.id.clone(),
            filename: filename.to_string(),
            part_id: part_id.to_string(),
            content_type: content_type.to_string(),
            content_id: None,
            size,
        }
    }

    /// Sharded on-disk location below the files root.
    pub fn disk_path(&self, files_root: &std::path::Path) -> std::path::PathBuf {
        let safe_name: String = self
            .filename
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect();
        files_root
            .join(&self.id[0..2])
            .join(&self.id[2..4])
            .join(&self.id)
            .join(safe_name)
    }
}

impl Model for File {
    const TABLE: &'static str = "File";
    const COLUMNS: &'static [&'static str] = &["messageId", "filename"];

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
            Value::Text(self.message_id.clone()),
            Value::Text(self.filename.clone()),
        ])
    }
}

/// One message in one remote folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub thread_id: String,
    pub header_message_id: String,
    #[serde(default)]
    pub gmail_message_id: Option<String>,
    #[serde(default)]
    pub gmail_thread_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub draft: bool,
    pub remote_uid: u32,
    pub remote_folder: FolderRef,
    #[serde(default)]
    pub client_folder: Option<FolderRef>,
    #[serde(default, rename = "remoteXGMLabels")]
    pub remote_xgm_labels: Vec<String>,
    #[serde(default)]
    pub synced_at: i64,
    #[serde(default)]
    pub to: Vec<Participant>,
    #[serde(default)]
    pub from: Vec<Participant>,
    #[serde(default)]
    pub cc: Vec<Participant>,
    #[serde(default)]
    pub bcc: Vec<Participant>,
    #[serde(default)]
    pub files: Vec<File>,
}

impl Message {
    /// Deterministic id for a remote record.
    ///
    /// Identity is folder-independent whenever the provider gives us a stable
    /// one (Gmail message id, or a real Message-ID header), so a cross-folder
    /// move converges onto the same row. Only messages with a locally
    /// generated Message-ID fall back to folder path + UID.
    pub fn id_for_remote(account_id: &str, folder_path: &str, remote: &RemoteMessage) -> String {
        if let Some(gmid) = &remote.gmail_message_id {
            tools::id_for_parts(&[account_id, "gm", gmid])
        } else if let Some(mid) = &remote.header_message_id {
            tools::id_for_parts(&[account_id, mid])
        } else {
            tools::id_for_parts(&[account_id, folder_path, &remote.uid.to_string()])
        }
    }

    pub fn from_remote(
        account: &Account,
        remote: &RemoteMessage,
        folder: &Folder,
        synced_at: i64,
    ) -> Self {
        let folder_ref = FolderRef::of(folder);
        Message {
            id: Message::id_for_remote(&account.id, &folder.path, remote),
            account_id: account.id.clone(),
            version: 0,
            thread_id: String::new(),
            header_message_id: remote
                .header_message_id
                .clone()
                .unwrap_or_else(tools::generated_message_id),
            gmail_message_id: remote.gmail_message_id.clone(),
            gmail_thread_id: remote.gmail_thread_id.clone(),
            subject: remote.subject.clone(),
            snippet: String::new(),
            date: remote.date,
            unread: remote.unread,
            starred: remote.starred,
            draft: remote.draft,
            remote_uid: remote.uid,
            remote_folder: folder_ref.clone(),
            client_folder: Some(folder_ref),
            remote_xgm_labels: remote.labels.clone(),
            synced_at,
            to: remote.to.clone(),
            from: remote.from.clone(),
            cc: remote.cc.clone(),
            bcc: remote.bcc.clone(),
            files: Vec::new(),
        }
    }

    pub fn attributes(&self) -> MessageAttributes {
        MessageAttributes {
            uid: self.remote_uid,
            unread: self.unread,
            starred: self.starred,
            draft: self.draft,
            labels: self.remote_xgm_labels.clone(),
        }
    }

    /// Whether the message was already unlinked by a previous sweep.
    pub fn is_unlinked(&self) -> bool {
        self.remote_uid > UNLINKED_UID_FLOOR
    }

    /// Whether the account owner sent this message.
    pub fn is_sent_by_user(&self, account_email: &str) -> bool {
        self.from
            .iter()
            .any(|p| p.email.eq_ignore_ascii_case(account_email))
    }
}

impl Model for Message {
    const TABLE: &'static str = "Message";
    const COLUMNS: &'static [&'static str] = &[
        "headerMessageId",
        "threadId",
        "remoteFolderId",
        "remoteUID",
        "date",
        "unread",
        "starred",
        "draft",
        "labels",
    ];

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
            Value::Text(self.header_message_id.clone()),
            Value::Text(self.thread_id.clone()),
            Value::Text(self.remote_folder.id.clone()),
            Value::Integer(self.remote_uid as i64),
            Value::Integer(self.date),
            Value::Integer(self.unread as i64),
            Value::Integer(self.starred as i64),
            Value::Integer(self.draft as i64),
            Value::Text(serde_json::to_string(&self.remote_xgm_labels)?),
        ])
    }

    // Thread counters are derived state: every message mutation refreshes the
    // owning thread within the same transaction.
    fn after_save(&self, tx: &mut Transaction) -> Result<()> {
        if self.thread_id.is_empty() {
            return Ok(());
        }
        Thread::recompute(tx, &self.thread_id)
    }

    fn after_remove(&self, tx: &mut Transaction) -> Result<()> {
        tx.conn()
            .execute("DELETE FROM MessageBody WHERE id = ?", [&self.id])?;
        tx.conn()
            .execute("DELETE FROM File WHERE messageId = ?", [&self.id])?;
        if self.thread_id.is_empty() {
            return Ok(());
        }
        Thread::recompute(tx, &self.thread_id)
    }
}
