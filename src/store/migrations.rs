//! Schema migrations, applied in order on open. The schema version lives in
//! `PRAGMA user_version`.

use anyhow::Result;
use rusqlite::Connection;

const V1: &str = r#"
CREATE TABLE IF NOT EXISTS Account (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    emailAddress TEXT
);

CREATE TABLE IF NOT EXISTS Folder (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    path TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS FolderPathIndex ON Folder(accountId, path);

CREATE TABLE IF NOT EXISTS Label (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    path TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS LabelPathIndex ON Label(accountId, path);

CREATE TABLE IF NOT EXISTS Thread (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    gThrId TEXT,
    subject TEXT,
    unread INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS ThreadGmailIndex ON Thread(accountId, gThrId);

CREATE TABLE IF NOT EXISTS ThreadReference (
    threadId TEXT NOT NULL,
    accountId TEXT NOT NULL,
    headerMessageId TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ThreadReferenceIndex
    ON ThreadReference(accountId, headerMessageId);
CREATE INDEX IF NOT EXISTS ThreadReferenceThreadIndex ON ThreadReference(threadId);

CREATE TABLE IF NOT EXISTS ThreadCounts (
    categoryId TEXT PRIMARY KEY,
    unread INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS Message (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    headerMessageId TEXT,
    threadId TEXT,
    remoteFolderId TEXT,
    remoteUID INTEGER NOT NULL DEFAULT 0,
    date INTEGER NOT NULL DEFAULT 0,
    unread INTEGER NOT NULL DEFAULT 0,
    starred INTEGER NOT NULL DEFAULT 0,
    draft INTEGER NOT NULL DEFAULT 0,
    labels TEXT
);
CREATE INDEX IF NOT EXISTS MessageThreadIndex ON Message(threadId);
CREATE INDEX IF NOT EXISTS MessageFolderUIDIndex ON Message(remoteFolderId, remoteUID);
CREATE INDEX IF NOT EXISTS MessageUnlinkIndex ON Message(accountId, remoteUID);

CREATE TABLE IF NOT EXISTS MessageBody (
    id TEXT PRIMARY KEY,
    value TEXT,
    fetchedAt INTEGER
);

CREATE TABLE IF NOT EXISTS File (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    messageId TEXT,
    filename TEXT
);
CREATE INDEX IF NOT EXISTS FileMessageIndex ON File(messageId);

CREATE TABLE IF NOT EXISTS Contact (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    email TEXT NOT NULL,
    refs INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS ContactEmailIndex ON Contact(accountId, email);

CREATE TABLE IF NOT EXISTS Task (
    id TEXT PRIMARY KEY,
    accountId TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS TaskStatusIndex ON Task(status);

CREATE VIRTUAL TABLE IF NOT EXISTS ThreadSearch
    USING fts5(to_, from_, body, categories, content_id UNINDEXED);
CREATE VIRTUAL TABLE IF NOT EXISTS ContactSearch
    USING fts5(content, content_id UNINDEXED);
"#;

pub(crate) fn run(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < 1 {
        conn.execute_batch(V1)?;
        conn.execute_batch("PRAGMA user_version = 1")?;
    }
    Ok(())
}
