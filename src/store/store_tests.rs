use pretty_assertions::assert_eq;

use super::*;
use crate::folder::Folder;
use crate::imap::UidRange;
use crate::message::{FolderRef, Message};
use crate::test_utils::TestStore;

fn bare_message(account_id: &str, folder: &Folder, uid: u32) -> Message {
    Message {
        id: format!("msg-{uid}"),
        account_id: account_id.to_string(),
        version: 0,
        // Store-level tests bypass threading.
        thread_id: String::new(),
        header_message_id: format!("m{uid}@example.com"),
        gmail_message_id: None,
        gmail_thread_id: None,
        subject: format!("Message {uid}"),
        snippet: String::new(),
        date: uid as i64,
        unread: uid % 2 == 0,
        starred: false,
        draft: false,
        remote_uid: uid,
        remote_folder: FolderRef::of(folder),
        client_folder: None,
        remote_xgm_labels: vec!["\\Inbox".to_string()],
        synced_at: 0,
        to: vec![],
        from: vec![],
        cc: vec![],
        bcc: vec![],
        files: vec![],
    }
}

#[tokio::test]
async fn test_save_assigns_monotonic_versions() {
    let t = TestStore::new();
    let mut folder = Folder::new("a1", "INBOX", "inbox");
    assert_eq!(folder.version, 0);

    t.store.save(&mut folder, true).await.unwrap();
    assert_eq!(folder.version, 1);

    folder.role = "all".to_string();
    t.store.save(&mut folder, true).await.unwrap();
    assert_eq!(folder.version, 2);

    let loaded: Folder = t
        .store
        .find(&Query::new().equal("id", folder.id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.role, "all");
}

#[tokio::test]
async fn test_duplicate_insert_is_unique_violation() {
    let t = TestStore::new();
    let mut first = Folder::new("a1", "INBOX", "inbox");
    t.store.save(&mut first, true).await.unwrap();

    let mut duplicate = Folder::new("a1", "INBOX", "inbox");
    let err = t.store.save(&mut duplicate, true).await.unwrap_err();
    assert!(is_unique_violation(&err));
}

#[tokio::test]
async fn test_query_builder() {
    let t = TestStore::new();
    for (path, role) in [("INBOX", "inbox"), ("Sent", "sent"), ("Archive", "archive")] {
        let mut folder = Folder::new("a1", path, role);
        t.store.save(&mut folder, true).await.unwrap();
    }

    let inbox: Option<Folder> = t.store.find(&Query::new().equal("role", "inbox")).unwrap();
    assert_eq!(inbox.unwrap().path, "INBOX");

    let some: Vec<Folder> = t
        .store
        .find_all(&Query::new().any("role", vec!["inbox", "sent"]))
        .unwrap();
    assert_eq!(some.len(), 2);

    let none: Vec<Folder> = t
        .store
        .find_all(&Query::new().any("role", Vec::<&str>::new()))
        .unwrap();
    assert!(none.is_empty());

    let limited: Vec<Folder> = t
        .store
        .find_all(&Query::new().equal("accountId", "a1").limit(1))
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_deltas_flush_on_commit_only() {
    let t = TestStore::new();
    let mut folder = Folder::new("a1", "INBOX", "inbox");

    let mut tx = t.store.begin().await.unwrap();
    tx.save(&mut folder, true).unwrap();
    assert!(t.deltas.try_recv().is_err(), "uncommitted state leaked");
    tx.commit().unwrap();

    let frames = t.drain_deltas();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].object_class, "Folder");
    assert_eq!(frames[0].op, DeltaOp::Persist);
}

#[tokio::test]
async fn test_rollback_discards_writes_and_deltas() {
    let t = TestStore::new();
    let mut folder = Folder::new("a1", "INBOX", "inbox");

    {
        let mut tx = t.store.begin().await.unwrap();
        tx.save(&mut folder, true).unwrap();
        // Dropped without commit.
    }

    assert!(t.drain_deltas().is_empty());
    let found: Option<Folder> = t.store.find(&Query::new().equal("id", folder.id.as_str())).unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_delta_coalescing_per_class() {
    let t = TestStore::new();
    let mut tx = t.store.begin().await.unwrap();
    for path in ["A", "B", "C"] {
        let mut folder = Folder::new("a1", path, "");
        tx.save(&mut folder, true).unwrap();
    }
    tx.commit().unwrap();

    let frames = t.drain_deltas();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].objects.len(), 3);
}

#[tokio::test]
async fn test_fetch_message_uid_at_depth() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    let mut tx = t.store.begin().await.unwrap();
    for uid in 1..=10 {
        let mut message = bare_message("a1", &folder, uid);
        tx.save(&mut message, false).unwrap();
    }
    tx.commit().unwrap();

    // Depth 3 below the newest (10, 9, 8, →7).
    assert_eq!(t.store.fetch_message_uid_at_depth(&folder, 3, 100).unwrap(), 7);
    // Ceiling excludes newer UIDs.
    assert_eq!(t.store.fetch_message_uid_at_depth(&folder, 0, 5).unwrap(), 5);
    // Fewer than depth known: bottom is 1.
    assert_eq!(t.store.fetch_message_uid_at_depth(&folder, 499, 100).unwrap(), 1);
}

#[tokio::test]
async fn test_fetch_messages_attributes_in_range() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    let mut tx = t.store.begin().await.unwrap();
    for uid in [2, 4, 9] {
        let mut message = bare_message("a1", &folder, uid);
        tx.save(&mut message, false).unwrap();
    }
    tx.commit().unwrap();

    let attrs = t
        .store
        .fetch_messages_attributes_in_range(UidRange::new(1, 5), &folder)
        .unwrap();
    assert_eq!(attrs.len(), 2);
    assert!(attrs.contains_key(&2) && attrs.contains_key(&4));
    assert!(attrs[&2].unread);
    assert_eq!(attrs[&2].labels, vec!["\\Inbox"]);
}

#[tokio::test]
async fn test_fetch_messages_missing_bodies() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    let mut tx = t.store.begin().await.unwrap();
    let mut recent = bare_message("a1", &folder, 1);
    recent.date = crate::tools::time();
    tx.save(&mut recent, false).unwrap();

    let mut old = bare_message("a1", &folder, 2);
    old.date = 1000;
    tx.save(&mut old, false).unwrap();

    let mut old_draft = bare_message("a1", &folder, 3);
    old_draft.date = 1000;
    old_draft.draft = true;
    tx.save(&mut old_draft, false).unwrap();

    let mut fetched = bare_message("a1", &folder, 4);
    fetched.date = crate::tools::time();
    tx.save(&mut fetched, false).unwrap();
    tx.conn()
        .execute(
            "REPLACE INTO MessageBody (id, value, fetchedAt) VALUES (?, 'x', 0)",
            [fetched.id.as_str()],
        )
        .unwrap();
    tx.commit().unwrap();

    let not_before = crate::tools::time() - 30 * 24 * 60 * 60;
    let missing = t
        .store
        .fetch_messages_missing_bodies(&folder.id, not_before, 10)
        .unwrap();
    let ids: Vec<&str> = missing.iter().map(|m| m.id.as_str()).collect();
    // The recent message and the old draft qualify; the old non-draft and
    // the already-fetched one don't.
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&recent.id.as_str()));
    assert!(ids.contains(&old_draft.id.as_str()));
}
