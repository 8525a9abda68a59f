use pretty_assertions::assert_eq;

use super::*;
use crate::imap::UidRange;
use crate::test_utils::{remote_message, TestStore};

#[tokio::test]
async fn test_apply_uid_range_on_empty_account() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    apply_uid_range(
        &t.processor(),
        &t.store,
        &folder,
        UidRange::new(1, 200),
        Vec::new(),
        1,
    )
    .await
    .unwrap();

    assert_eq!(t.count("Message"), 0);
    assert_eq!(t.count("Thread"), 0);
}

#[tokio::test]
async fn test_apply_uid_range_inserts_new_messages() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    let remote = vec![
        remote_message(1, "m1@example.com", "One"),
        remote_message(2, "m2@example.com", "Two"),
    ];
    apply_uid_range(&t.processor(), &t.store, &folder, UidRange::new(1, 10), remote, 1)
        .await
        .unwrap();

    assert_eq!(t.count("Message"), 2);
    assert_eq!(t.count("Thread"), 2);
    t.assert_invariants();
}

#[tokio::test]
async fn test_apply_uid_range_updates_changed_messages() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    let mut remote = remote_message(3, "m3@example.com", "Flagged later");
    let inserted = processor.insert_message(&remote, &folder, 100).await.unwrap();

    // Same UID, flags changed on the server.
    remote.unread = false;
    remote.starred = true;
    apply_uid_range(&processor, &t.store, &folder, UidRange::new(1, 10), vec![remote], 1)
        .await
        .unwrap();

    let updated: Message = t
        .store
        .find(&Query::new().equal("id", inserted.id.as_str()))
        .unwrap()
        .unwrap();
    assert!(!updated.unread);
    assert!(updated.starred);
    assert_eq!(t.count("Message"), 1);
}

#[tokio::test]
async fn test_apply_uid_range_unchanged_messages_untouched() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    let remote = remote_message(3, "m3@example.com", "Stable");
    let inserted = processor.insert_message(&remote, &folder, 100).await.unwrap();
    let version_before: i64 =
        t.query_scalar(&format!("SELECT version FROM Message WHERE id = '{}'", inserted.id));

    apply_uid_range(
        &processor,
        &t.store,
        &folder,
        UidRange::new(1, 10),
        vec![remote],
        1,
    )
    .await
    .unwrap();

    let version_after: i64 =
        t.query_scalar(&format!("SELECT version FROM Message WHERE id = '{}'", inserted.id));
    assert_eq!(version_before, version_after);
}

#[tokio::test]
async fn test_apply_uid_range_unlinks_vanished_messages() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    processor
        .insert_message(&remote_message(4, "m4@example.com", "Stays"), &folder, 100)
        .await
        .unwrap();
    let gone = processor
        .insert_message(&remote_message(5, "m5@example.com", "Goes"), &folder, 100)
        .await
        .unwrap();

    // The server now reports only UID 4 in the range.
    apply_uid_range(
        &processor,
        &t.store,
        &folder,
        UidRange::new(1, 10),
        vec![remote_message(4, "m4@example.com", "Stays")],
        2,
    )
    .await
    .unwrap();

    let unlinked: Message = t
        .store
        .find(&Query::new().equal("id", gone.id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(unlinked.remote_uid, u32::MAX - 2);

    let kept: Message = t
        .store
        .find(&Query::new().equal("remoteUID", 4u32))
        .unwrap()
        .unwrap();
    assert!(!kept.is_unlinked());
}

#[tokio::test]
async fn test_apply_uid_range_leaves_messages_outside_range_alone() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    let outside = processor
        .insert_message(&remote_message(50, "m50@example.com", "Old"), &folder, 100)
        .await
        .unwrap();

    // An empty server response for UIDs 1-10 says nothing about UID 50.
    apply_uid_range(&processor, &t.store, &folder, UidRange::new(1, 10), Vec::new(), 1)
        .await
        .unwrap();

    let untouched: Message = t
        .store
        .find(&Query::new().equal("id", outside.id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(untouched.remote_uid, 50);
}

#[tokio::test]
async fn test_apply_condstore_changes_inserts_and_updates() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    let known = remote_message(6, "m6@example.com", "Known");
    processor.insert_message(&known, &folder, 100).await.unwrap();

    let mut changed = known.clone();
    changed.unread = false;
    let fresh = remote_message(7, "m7@example.com", "Fresh");

    let result = SyncResult {
        modified_or_added: vec![changed, fresh],
        vanished: Some(Vec::new()),
    };
    apply_condstore_changes(&processor, &t.store, &t.account, &folder, &result)
        .await
        .unwrap();

    assert_eq!(t.count("Message"), 2);
    assert_eq!(
        t.query_scalar("SELECT COUNT(*) FROM Message WHERE unread = 1"),
        1
    );
    t.assert_invariants();
}

#[tokio::test]
async fn test_condstore_move_updates_folder() {
    let t = TestStore::new();
    let inbox = t.make_folder("INBOX", "inbox").await;
    let archive = t.make_folder("Archive", "archive").await;
    let processor = t.processor();

    let remote = remote_message(9, "m9@example.com", "Relocated");
    let inserted = processor.insert_message(&remote, &inbox, 100).await.unwrap();

    // The archive's change feed reports the same message under a new UID.
    let mut moved = remote.clone();
    moved.uid = 2;
    let result = SyncResult {
        modified_or_added: vec![moved],
        vanished: None,
    };
    apply_condstore_changes(&processor, &t.store, &t.account, &archive, &result)
        .await
        .unwrap();

    assert_eq!(t.count("Message"), 1);
    let survivor: Message = t
        .store
        .find(&Query::new().equal("id", inserted.id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(survivor.remote_folder.id, archive.id);
    assert_eq!(survivor.remote_uid, 2);
}

#[tokio::test]
async fn test_uidvalidity_reset_resyncs_without_duplicates() {
    let t = TestStore::new();
    let mut folder = t.make_folder("INBOX", "inbox").await;
    folder.local_status.uidvalidity = Some(1);
    folder.local_status.uidnext = 100;
    folder.local_status.full_scan_head = 40;
    t.store.save(&mut folder, true).await.unwrap();

    let processor = t.processor();
    let keeper = remote_message(10, "keep@example.com", "Survives");
    processor.insert_message(&keeper, &folder, 100).await.unwrap();
    processor
        .insert_message(&remote_message(11, "lost@example.com", "Vanishes"), &folder, 100)
        .await
        .unwrap();

    // The server reports a new UIDVALIDITY: all local sync state is dropped
    // and every message is unlinked pending the resync.
    let mut worker = SyncWorker::new("bg", t.account.clone(), t.store.clone(), None);
    worker.reset_folder(&mut folder).await.unwrap();
    assert_eq!(folder.local_status, FolderLocalStatus::default());
    assert_eq!(
        t.query_scalar("SELECT COUNT(*) FROM Message WHERE remoteUID < 4294967290"),
        0
    );

    // The resync rediscovers one message under a new UID; the insert lands
    // on the existing row instead of duplicating its thread.
    let mut rediscovered = keeper.clone();
    rediscovered.uid = 3;
    apply_uid_range(
        &processor,
        &t.store,
        &folder,
        UidRange::new(1, 50),
        vec![rediscovered],
        worker.unlink_phase,
    )
    .await
    .unwrap();
    processor.delete_messages_still_unlinked_from_phase(1).await.unwrap();

    assert_eq!(t.count("Message"), 1);
    assert_eq!(t.count("Thread"), 1);
    let survivor: Message = t
        .store
        .find(&Query::new().equal("remoteUID", 3u32))
        .unwrap()
        .unwrap();
    assert_eq!(survivor.header_message_id, "keep@example.com");
    t.assert_invariants();
}

#[test]
fn test_role_rank_orders_sweep() {
    let mut folders = [
        Folder::new("a1", "Spam", "spam"),
        Folder::new("a1", "INBOX", "inbox"),
        Folder::new("a1", "Newsletters", ""),
        Folder::new("a1", "Sent", "sent"),
    ];
    folders.sort_by_key(|folder| role_rank(&folder.role));
    let paths: Vec<&str> = folders.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["INBOX", "Sent", "Spam", "Newsletters"]);
}
