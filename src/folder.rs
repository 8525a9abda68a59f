//! # Folder and Label models.
//!
//! A Folder is a remote mailbox identified by its path. On Gmail-like
//! providers only the "all", "spam" and "trash" mailboxes are Folders; every
//! other server-side mailbox is a Label. Both carry a `role` inferred from
//! special-use attributes.

use anyhow::Result;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::store::Model;
use crate::tools;

/// Role priority used to order folders within a sweep.
const ROLE_ORDER: [&str; 7] = ["inbox", "sent", "drafts", "all", "archive", "trash", "spam"];

/// Rank of a role in sweep order; unknown roles sort last.
pub(crate) fn role_rank(role: &str) -> usize {
    ROLE_ORDER
        .iter()
        .position(|r| *r == role)
        .unwrap_or(ROLE_ORDER.len())
}

/// Per-folder sync state, persisted in the folder's data blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FolderLocalStatus {
    /// UIDVALIDITY cookie observed when the folder was first synced.
    pub uidvalidity: Option<u32>,
    /// UIDNEXT up to which recent-change scans have reconciled.
    pub uidnext: u32,
    /// HIGHESTMODSEQ up to which the CONDSTORE feed has been applied.
    pub highestmodseq: u64,
    /// High-water UID from which the next deep-scan chunk counts backward.
    /// `u32::MAX` means no scan pass has started.
    pub full_scan_head: u32,
    /// When the last deep-scan chunk ran (epoch seconds).
    pub full_scan_time: i64,
}

impl Default for FolderLocalStatus {
    fn default() -> Self {
        FolderLocalStatus {
            uidvalidity: None,
            uidnext: 0,
            highestmodseq: 0,
            full_scan_head: u32::MAX,
            full_scan_time: 0,
        }
    }
}

/// A synced remote mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    pub path: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub local_status: FolderLocalStatus,
}

impl Folder {
    pub fn new(account_id: &str, path: &str, role: &str) -> Self {
        Folder {
            id: tools::id_for_parts(&[account_id, path]),
            account_id: account_id.to_string(),
            version: 0,
            path: path.to_string(),
            role: role.to_string(),
            local_status: FolderLocalStatus::default(),
        }
    }
}

impl Model for Folder {
    const TABLE: &'static str = "Folder";
    const COLUMNS: &'static [&'static str] = &["path", "role"];

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
            Value::Text(self.path.clone()),
            Value::Text(self.role.clone()),
        ])
    }
}

/// A server-side label on Gmail-like providers. Shares the folder shape but
/// lives in its own table and is never swept for messages directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    #[serde(flatten)]
    pub folder: Folder,
}

impl Label {
    pub fn new(account_id: &str, path: &str, role: &str) -> Self {
        Label {
            folder: Folder::new(account_id, path, role),
        }
    }
}

impl Model for Label {
    const TABLE: &'static str = "Label";
    const COLUMNS: &'static [&'static str] = &["path", "role"];

    fn id(&self) -> &str {
        &self.folder.id
    }

    fn account_id(&self) -> &str {
        &self.folder.account_id
    }

    fn version(&self) -> i64 {
        self.folder.version
    }

    fn set_version(&mut self, version: i64) {
        self.folder.version = version;
    }

    fn column_values(&self) -> Result<Vec<Value>> {
        self.folder.column_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_rank_order() {
        assert!(role_rank("inbox") < role_rank("sent"));
        assert!(role_rank("trash") < role_rank("spam"));
        assert!(role_rank("spam") < role_rank(""));
        assert_eq!(role_rank("no-such-role"), role_rank(""));
    }

    #[test]
    fn test_folder_id_is_deterministic() {
        let a = Folder::new("acc", "INBOX", "inbox");
        let b = Folder::new("acc", "INBOX", "inbox");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, Folder::new("acc", "Sent", "sent").id);
    }

    #[test]
    fn test_local_status_defaults() {
        let status = FolderLocalStatus::default();
        assert_eq!(status.full_scan_head, u32::MAX);
        assert_eq!(status.uidvalidity, None);

        // Fields absent from older blobs fall back to the defaults.
        let status: FolderLocalStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.full_scan_head, u32::MAX);
    }
}
