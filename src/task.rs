//! # Task model.
//!
//! Tasks are client-initiated operations replayed against the server. The
//! client posts them over the stream; `perform_local` applies the optimistic
//! change and `perform_remote` commits it (see `task_processor`).

use anyhow::Result;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::message::{FolderRef, Participant};
use crate::store::Model;
use crate::tools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "remote")]
    Remote,
    #[serde(rename = "local-error")]
    LocalError,
    #[serde(rename = "remote-error")]
    RemoteError,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "complete")]
    Complete,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Local => "local",
            TaskStatus::Remote => "remote",
            TaskStatus::LocalError => "local-error",
            TaskStatus::RemoteError => "remote-error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Complete => "complete",
        }
    }
}

/// Draft payload carried by the draft tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub to: Vec<Participant>,
    #[serde(default)]
    pub cc: Vec<Participant>,
    #[serde(default)]
    pub bcc: Vec<Participant>,
    #[serde(default)]
    pub body: String,
}

/// Task variants, discriminated by the client's `__cls` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__cls")]
pub enum TaskKind {
    MarkUnread {
        ids: Vec<String>,
        #[serde(default = "default_true")]
        unread: bool,
    },
    MarkStarred {
        ids: Vec<String>,
        #[serde(default = "default_true")]
        starred: bool,
    },
    ChangeFolder {
        ids: Vec<String>,
        folder: FolderRef,
    },
    ChangeLabels {
        ids: Vec<String>,
        #[serde(default, rename = "labelsToAdd")]
        labels_to_add: Vec<String>,
        #[serde(default, rename = "labelsToRemove")]
        labels_to_remove: Vec<String>,
    },
    SyncbackDraft {
        draft: Draft,
    },
    SendDraft {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    DestroyDraft {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    ExpungeAllInFolder {
        folder: FolderRef,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default = "tools::id_randomly_generated")]
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default, rename = "should_cancel")]
    pub should_cancel: bool,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

fn default_status() -> TaskStatus {
    TaskStatus::Local
}

impl Task {
    pub fn new(account_id: &str, kind: TaskKind) -> Self {
        Task {
            id: tools::id_randomly_generated(),
            account_id: account_id.to_string(),
            version: 0,
            status: TaskStatus::Local,
            should_cancel: false,
            error: None,
            kind,
        }
    }

    pub fn set_error(&mut self, status: TaskStatus, message: impl AsRef<str>) {
        self.status = status;
        self.error = Some(serde_json::json!({ "message": message.as_ref() }));
    }
}

impl Model for Task {
    const TABLE: &'static str = "Task";
    const COLUMNS: &'static [&'static str] = &["status"];

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
        Ok(vec![Value::Text(self.status.as_str().to_string())])
    }
}
