use pretty_assertions::assert_eq;

use super::*;
use crate::store::DeltaOp;
use crate::task::{Draft, TaskKind, TaskStatus};
use crate::test_utils::{remote_message, TestStore};

#[tokio::test]
async fn test_mark_unread_applies_optimistically() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;

    let mut remote = remote_message(1, "m1@example.com", "Seen mail");
    remote.unread = false;
    let message = t.processor().insert_message(&remote, &folder, 100).await.unwrap();
    t.drain_deltas();

    let mut task = Task::new("a1", TaskKind::MarkUnread {
        ids: vec![message.id.clone()],
        unread: true,
    });
    t.task_processor().perform_local(&mut task).await.unwrap();

    assert_eq!(task.status, TaskStatus::Remote);
    let updated: Message = t
        .store
        .find(&Query::new().equal("id", message.id.as_str()))
        .unwrap()
        .unwrap();
    assert!(updated.unread);

    // The client sees the message change and the task state immediately.
    let frames = t.drain_deltas();
    assert!(frames
        .iter()
        .any(|f| f.object_class == "Message" && f.op == DeltaOp::Persist));
    assert!(frames
        .iter()
        .any(|f| f.object_class == "Task" && f.op == DeltaOp::Persist));

    // Thread unread counters follow the flag.
    let thread: crate::thread::Thread = t
        .store
        .find(&Query::new().equal("id", updated.thread_id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(thread.unread, 1);
    t.assert_invariants();
}

#[tokio::test]
async fn test_perform_local_is_idempotent() {
    let t = TestStore::new();
    let folder = t.make_folder("INBOX", "inbox").await;
    let message = t
        .processor()
        .insert_message(&remote_message(1, "m1@example.com", "Hi"), &folder, 100)
        .await
        .unwrap();

    let mut task = Task::new("a1", TaskKind::MarkStarred {
        ids: vec![message.id.clone()],
        starred: true,
    });
    let tp = t.task_processor();
    tp.perform_local(&mut task).await.unwrap();
    // Re-entry applies the same state again without error.
    task.status = TaskStatus::Local;
    tp.perform_local(&mut task).await.unwrap();

    assert_eq!(task.status, TaskStatus::Remote);
    let updated: Message = t
        .store
        .find(&Query::new().equal("id", message.id.as_str()))
        .unwrap()
        .unwrap();
    assert!(updated.starred);
}

#[tokio::test]
async fn test_missing_message_parks_task_in_local_error() {
    let t = TestStore::new();
    let mut task = Task::new("a1", TaskKind::MarkUnread {
        ids: vec!["nope".to_string()],
        unread: true,
    });
    t.task_processor().perform_local(&mut task).await.unwrap();

    assert_eq!(task.status, TaskStatus::LocalError);
    assert!(task.error.is_some());

    // The parked task is persisted for the client to inspect.
    assert_eq!(
        t.query_scalar("SELECT COUNT(*) FROM Task WHERE status = 'local-error'"),
        1
    );
}

#[tokio::test]
async fn test_change_labels_locally() {
    let t = TestStore::new();
    let folder = t.make_folder("[Gmail]/All Mail", "all").await;
    let mut remote = remote_message(1, "m1@example.com", "Labeled");
    remote.labels = vec!["\\Inbox".to_string(), "Old".to_string()];
    let message = t.processor().insert_message(&remote, &folder, 100).await.unwrap();

    let mut task = Task::new("a1", TaskKind::ChangeLabels {
        ids: vec![message.id.clone()],
        labels_to_add: vec!["New".to_string()],
        labels_to_remove: vec!["Old".to_string()],
    });
    t.task_processor().perform_local(&mut task).await.unwrap();

    let updated: Message = t
        .store
        .find(&Query::new().equal("id", message.id.as_str()))
        .unwrap()
        .unwrap();
    assert_eq!(updated.remote_xgm_labels, vec!["\\Inbox", "New"]);
}

#[tokio::test]
async fn test_change_folder_sets_client_folder() {
    let t = TestStore::new();
    let inbox = t.make_folder("INBOX", "inbox").await;
    let archive = t.make_folder("Archive", "archive").await;
    let message = t
        .processor()
        .insert_message(&remote_message(1, "m1@example.com", "Move me"), &inbox, 100)
        .await
        .unwrap();

    let mut task = Task::new("a1", TaskKind::ChangeFolder {
        ids: vec![message.id.clone()],
        folder: crate::message::FolderRef::of(&archive),
    });
    t.task_processor().perform_local(&mut task).await.unwrap();

    let updated: Message = t
        .store
        .find(&Query::new().equal("id", message.id.as_str()))
        .unwrap()
        .unwrap();
    // Optimistic: the client-visible folder moves, the remote one follows
    // once the server confirms.
    assert_eq!(updated.client_folder.unwrap().id, archive.id);
    assert_eq!(updated.remote_folder.id, inbox.id);
}

#[tokio::test]
async fn test_syncback_draft_creates_draft_with_body() {
    let t = TestStore::new();
    t.make_folder("Drafts", "drafts").await;

    let mut task = Task::new("a1", TaskKind::SyncbackDraft {
        draft: Draft {
            id: Some("draft-1".to_string()),
            subject: "WIP".to_string(),
            to: vec![crate::message::Participant {
                name: String::new(),
                email: "bob@example.com".to_string(),
            }],
            cc: vec![],
            bcc: vec![],
            body: "<p>unfinished thought</p>".to_string(),
        },
    });
    t.task_processor().perform_local(&mut task).await.unwrap();
    assert_eq!(task.status, TaskStatus::Remote);

    let draft: Message = t
        .store
        .find(&Query::new().equal("id", "draft-1"))
        .unwrap()
        .unwrap();
    assert!(draft.draft);
    assert!(!draft.unread);
    assert_eq!(draft.subject, "WIP");
    assert_eq!(
        t.store.fetch_body("draft-1").unwrap().as_deref(),
        Some("<p>unfinished thought</p>")
    );
    t.assert_invariants();

    // Saving again updates the same row.
    task.status = TaskStatus::Local;
    if let TaskKind::SyncbackDraft { draft } = &mut task.kind {
        draft.subject = "WIP v2".to_string();
    }
    t.task_processor().perform_local(&mut task).await.unwrap();
    assert_eq!(t.query_scalar("SELECT COUNT(*) FROM Message WHERE draft = 1"), 1);
    let draft: Message = t
        .store
        .find(&Query::new().equal("id", "draft-1"))
        .unwrap()
        .unwrap();
    assert_eq!(draft.subject, "WIP v2");
}

#[tokio::test]
async fn test_syncback_draft_requires_drafts_folder() {
    let t = TestStore::new();
    let mut task = Task::new("a1", TaskKind::SyncbackDraft { draft: Draft::default() });
    t.task_processor().perform_local(&mut task).await.unwrap();
    assert_eq!(task.status, TaskStatus::LocalError);
}

#[tokio::test]
async fn test_destroy_draft_is_idempotent() {
    let t = TestStore::new();
    t.make_folder("Drafts", "drafts").await;
    let tp = t.task_processor();

    let mut create = Task::new("a1", TaskKind::SyncbackDraft {
        draft: Draft {
            id: Some("draft-2".to_string()),
            subject: "Doomed".to_string(),
            body: "x".to_string(),
            ..Default::default()
        },
    });
    tp.perform_local(&mut create).await.unwrap();

    let mut destroy = Task::new("a1", TaskKind::DestroyDraft {
        message_id: "draft-2".to_string(),
    });
    tp.perform_local(&mut destroy).await.unwrap();
    assert_eq!(destroy.status, TaskStatus::Remote);
    assert_eq!(t.query_scalar("SELECT COUNT(*) FROM Message WHERE draft = 1"), 0);
    // The draft's body row goes with it.
    assert_eq!(t.count("MessageBody"), 0);

    let mut again = Task::new("a1", TaskKind::DestroyDraft {
        message_id: "draft-2".to_string(),
    });
    tp.perform_local(&mut again).await.unwrap();
    assert_eq!(again.status, TaskStatus::Remote);
}

#[tokio::test]
async fn test_expunge_all_in_folder_locally() {
    let t = TestStore::new();
    let folder = t.make_folder("Trash", "trash").await;
    let keep_folder = t.make_folder("INBOX", "inbox").await;
    let processor = t.processor();

    processor
        .insert_message(&remote_message(1, "t1@example.com", "Junk"), &folder, 100)
        .await
        .unwrap();
    processor
        .insert_message(&remote_message(2, "t2@example.com", "More junk"), &folder, 100)
        .await
        .unwrap();
    processor
        .insert_message(&remote_message(3, "keep@example.com", "Keep"), &keep_folder, 100)
        .await
        .unwrap();

    let mut task = Task::new("a1", TaskKind::ExpungeAllInFolder {
        folder: crate::message::FolderRef::of(&folder),
    });
    t.task_processor().perform_local(&mut task).await.unwrap();

    assert_eq!(t.count("Message"), 1);
    assert_eq!(t.count("Thread"), 1);
    t.assert_invariants();
}

#[test]
fn test_format_labels() {
    assert_eq!(
        format_labels(&["\\Inbox".to_string(), "Work & Life".to_string()]),
        "\\Inbox \"Work & Life\""
    );
    assert_eq!(format_labels(&["has\"quote".to_string()]), "\"has\\\"quote\"");
}
