//! Shared helpers for the test suite: a disposable on-disk store with a
//! captured delta stream, plus builders for remote records.

use std::sync::Arc;

use crate::account::Account;
use crate::comm_stream;
use crate::folder::Folder;
use crate::imap::RemoteMessage;
use crate::message::Participant;
use crate::processor::MailProcessor;
use crate::store::{DeltaFrame, Store};
use crate::task_processor::TaskProcessor;

pub(crate) struct TestStore {
    pub store: Arc<Store>,
    pub account: Arc<Account>,
    pub deltas: async_channel::Receiver<DeltaFrame>,
    _dir: tempfile::TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let (delta_tx, delta_rx) = comm_stream::delta_channel();
        let store = Arc::new(Store::open(dir.path(), Some(delta_tx)).expect("could not open store"));
        let account = Arc::new(Account {
            id: "a1".to_string(),
            provider: "imap".to_string(),
            email_address: "alice@example.com".to_string(),
            ..Default::default()
        });
        TestStore {
            store,
            account,
            deltas: delta_rx,
            _dir: dir,
        }
    }

    pub fn processor(&self) -> MailProcessor {
        MailProcessor::new(self.account.clone(), self.store.clone())
    }

    pub fn task_processor(&self) -> TaskProcessor {
        TaskProcessor::new(self.account.clone(), self.store.clone())
    }

    pub async fn make_folder(&self, path: &str, role: &str) -> Folder {
        let mut folder = Folder::new(&self.account.id, path, role);
        self.store.save(&mut folder, true).await.unwrap();
        self.drain_deltas();
        folder
    }

    pub fn drain_deltas(&self) -> Vec<DeltaFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = self.deltas.try_recv() {
            out.push(frame);
        }
        out
    }

    pub fn count(&self, table: &str) -> i64 {
        self.query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
    }

    pub fn query_scalar(&self, sql: &str) -> i64 {
        // A second connection onto the WAL database, independent of the pool.
        let conn = rusqlite::Connection::open(self._dir.path().join("edgehill.db")).unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    /// Asserts the cross-table invariants: every message's thread exists,
    /// thread counters are exact, references cover every message id, no
    /// contact has an empty key.
    pub fn assert_invariants(&self) {
        let conn = rusqlite::Connection::open(self._dir.path().join("edgehill.db")).unwrap();

        let orphans: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM Message WHERE threadId != '' AND threadId NOT IN (SELECT id FROM Thread)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0, "messages referencing missing threads");

        let bad_counts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM Thread WHERE \
                 total != (SELECT COUNT(*) FROM Message WHERE threadId = Thread.id) OR \
                 unread != (SELECT COUNT(*) FROM Message WHERE threadId = Thread.id AND unread = 1)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(bad_counts, 0, "thread counters out of sync");

        let unreferenced: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM Message WHERE threadId != '' AND headerMessageId NOT IN \
                 (SELECT headerMessageId FROM ThreadReference)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unreferenced, 0, "messages without a thread reference");

        let empty_contacts: i64 = conn
            .query_row("SELECT COUNT(*) FROM Contact WHERE email = ''", [], |row| row.get(0))
            .unwrap();
        assert_eq!(empty_contacts, 0, "contact with empty key");
    }
}

pub(crate) fn remote_message(uid: u32, message_id: &str, subject: &str) -> RemoteMessage {
    RemoteMessage {
        uid,
        unread: true,
        starred: false,
        draft: false,
        header_message_id: Some(message_id.to_string()),
        subject: subject.to_string(),
        date: 1_600_000_000 + uid as i64,
        references: Vec::new(),
        in_reply_to: Vec::new(),
        from: vec![Participant {
            name: "Bob".to_string(),
            email: "bob@example.com".to_string(),
        }],
        to: vec![Participant {
            name: String::new(),
            email: "alice@example.com".to_string(),
        }],
        cc: Vec::new(),
        bcc: Vec::new(),
        gmail_message_id: None,
        gmail_thread_id: None,
        labels: Vec::new(),
    }
}
