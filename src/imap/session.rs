//! The per-worker IMAP session collaborator.
//!
//! Stateful wrapper around the protocol library: capabilities, the selected
//! folder, and the explicit operations the sync engine needs. Sessions are
//! never shared across workers.

use anyhow::{bail, Context as _, Result};
use async_imap::imap_proto::Response;
use async_imap::types::UnsolicitedResponse;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

use super::client::{connect_stream, ImapStream, XOAuth2};
use super::{
    build_uid_sets, header_fetch_query, parse_gmail_attributes, remote_message_from_fetch,
    role_for_folder, FolderStatus, RemoteFolder, RemoteMessage, SyncResult, UidRange,
};
use crate::account::Account;
use crate::error::SyncError;
use crate::sync_worker::WorkerEvent;

type InnerSession = async_imap::Session<ImapStream>;

/// What the server let us negotiate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub can_condstore: bool,
    pub can_qresync: bool,
    pub can_idle: bool,
    pub can_move: bool,
    pub is_gmail: bool,
}

#[derive(Debug)]
pub struct Session {
    inner: Option<InnerSession>,
    pub capabilities: Capabilities,
    selected_folder: Option<String>,
}

impl Session {
    /// Connects and authenticates a fresh session for `account`.
    pub async fn connect(account: &Account) -> Result<Session> {
        let settings = &account.settings;
        let stream = connect_stream(settings).await?;
        let client = async_imap::Client::new(stream);

        let mut inner = if let Some(token) = &settings.refresh_token {
            let authenticator = XOAuth2 {
                user: settings.imap_username.clone(),
                access_token: token.clone(),
            };
            client
                .authenticate("XOAUTH2", authenticator)
                .await
                .map_err(|(err, _client)| SyncError::Fatal(format!("XOAUTH2 failed: {err}")))?
        } else {
            client
                .login(&settings.imap_username, &settings.imap_password)
                .await
                .map_err(|(err, _client)| SyncError::Fatal(format!("login failed: {err}")))?
        };

        let caps = inner.capabilities().await.context("CAPABILITY failed")?;
        let capabilities = Capabilities {
            can_condstore: caps.has_str("CONDSTORE"),
            can_qresync: caps.has_str("QRESYNC"),
            can_idle: caps.has_str("IDLE"),
            can_move: caps.has_str("MOVE"),
            is_gmail: caps.has_str("X-GM-EXT-1"),
        };
        drop(caps);

        if capabilities.can_qresync {
            inner
                .run_command_and_check_ok("ENABLE QRESYNC")
                .await
                .context("ENABLE QRESYNC failed")?;
        }

        info!(
            host = settings.imap_host,
            condstore = capabilities.can_condstore,
            qresync = capabilities.can_qresync,
            idle = capabilities.can_idle,
            gmail = capabilities.is_gmail,
            "IMAP session established"
        );

        Ok(Session {
            inner: Some(inner),
            capabilities,
            selected_folder: None,
        })
    }

    fn inner(&mut self) -> Result<&mut InnerSession> {
        self.inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("IMAP session is not connected"))
    }

    /// Fetches the full remote folder list.
    pub async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>> {
        let inner = self.inner()?;
        let names: Vec<_> = inner
            .list(Some(""), Some("*"))
            .await
            .map_err(SyncError::from)?
            .try_collect()
            .await
            .map_err(SyncError::from)?;
        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                path: name.name().to_string(),
                role: role_for_folder(name),
                no_select: name
                    .attributes()
                    .iter()
                    .any(|a| matches!(a, async_imap::types::NameAttribute::NoSelect)),
            })
            .collect())
    }

    /// Selects `path` and returns its status. Always re-selects so the
    /// status is fresh.
    pub async fn folder_status(&mut self, path: &str) -> Result<FolderStatus> {
        let condstore = self.capabilities.can_condstore;
        let inner = self.inner()?;
        let mailbox = if condstore {
            inner.select_condstore(path).await
        } else {
            inner.select(path).await
        }
        .map_err(SyncError::from)
        .with_context(|| format!("could not select folder {path:?}"))?;

        self.selected_folder = Some(path.to_string());
        Ok(FolderStatus {
            uidvalidity: mailbox.uid_validity.unwrap_or(0),
            uidnext: mailbox.uid_next.unwrap_or(1),
            highestmodseq: mailbox.highest_modseq.unwrap_or(0),
            message_count: mailbox.exists,
        })
    }

    async fn ensure_selected(&mut self, path: &str) -> Result<()> {
        if self.selected_folder.as_deref() != Some(path) {
            self.folder_status(path).await?;
        }
        Ok(())
    }

    /// Header-level records for a UID range, newest and oldest alike.
    /// Messages that fail to parse are logged and skipped.
    pub async fn fetch_headers(&mut self, path: &str, range: UidRange) -> Result<Vec<RemoteMessage>> {
        self.ensure_selected(path).await?;
        let is_gmail = self.capabilities.is_gmail;
        let set = range.to_set();
        let query = header_fetch_query();

        let inner = self.inner()?;
        let mut messages = Vec::new();
        {
            let mut stream = inner
                .uid_fetch(&set, &query)
                .await
                .map_err(SyncError::from)?;
            while let Some(fetch) = stream.try_next().await.map_err(SyncError::from)? {
                match remote_message_from_fetch(&fetch) {
                    Ok(message) => messages.push(message),
                    Err(err) => warn!("skipping malformed message in {path}: {err:#}"),
                }
            }
        }

        if is_gmail && !messages.is_empty() {
            self.merge_gmail_attributes(&set, &mut messages).await?;
        }
        Ok(messages)
    }

    /// CHANGEDSINCE feed: everything modified or added since `modseq`, plus
    /// the vanished UID set when QRESYNC is active.
    pub async fn sync_messages_by_uid(&mut self, path: &str, modseq: u64) -> Result<SyncResult> {
        self.ensure_selected(path).await?;
        let qresync = self.capabilities.can_qresync;
        let is_gmail = self.capabilities.is_gmail;
        let query = format!(
            "{} (CHANGEDSINCE {}{})",
            header_fetch_query(),
            modseq,
            if qresync { " VANISHED" } else { "" }
        );

        let inner = self.inner()?;
        // Stale unsolicited responses would pollute the vanished set below.
        while inner.unsolicited_responses.try_recv().is_ok() {}

        let mut modified_or_added = Vec::new();
        {
            let mut stream = inner
                .uid_fetch("1:*", &query)
                .await
                .map_err(SyncError::from)?;
            while let Some(fetch) = stream.try_next().await.map_err(SyncError::from)? {
                if fetch.uid.is_none() {
                    continue;
                }
                match remote_message_from_fetch(&fetch) {
                    Ok(message) => modified_or_added.push(message),
                    Err(err) => warn!("skipping malformed message in {path}: {err:#}"),
                }
            }
        }

        let vanished = if qresync {
            let mut uids = Vec::new();
            while let Ok(response) = inner.unsolicited_responses.try_recv() {
                if let UnsolicitedResponse::Other(data) = &response {
                    if let Response::Vanished { uids: ranges, .. } = data.parsed() {
                        for range in ranges {
                            uids.extend(range.clone());
                        }
                    }
                }
            }
            Some(uids)
        } else {
            None
        };

        if is_gmail && !modified_or_added.is_empty() {
            let uids: Vec<u32> = modified_or_added.iter().map(|m| m.uid).collect();
            for set in build_uid_sets(&uids) {
                self.merge_gmail_attributes(&set, &mut modified_or_added)
                    .await?;
            }
        }

        Ok(SyncResult {
            modified_or_added,
            vanished,
        })
    }

    /// Reads X-GM-MSGID / X-GM-THRID / X-GM-LABELS for the set through the
    /// raw command plumbing and merges them into `messages` by UID.
    async fn merge_gmail_attributes(
        &mut self,
        set: &str,
        messages: &mut [RemoteMessage],
    ) -> Result<()> {
        let inner = self.inner()?;
        let id = inner
            .run_command(&format!(
                "UID FETCH {set} (X-GM-MSGID X-GM-THRID X-GM-LABELS)"
            ))
            .await
            .map_err(SyncError::from)?;
        let mut response = Vec::new();
        loop {
            match inner.read_response().await {
                Some(Ok(data)) => {
                    let is_done = data.request_id() == Some(&id);
                    response.extend_from_slice(data.borrow_owner());
                    if is_done {
                        break;
                    }
                }
                Some(Err(err)) => return Err(SyncError::from(err).into()),
                None => bail!("connection closed while reading UID FETCH response"),
            }
        }
        let parsed = parse_gmail_attributes(&String::from_utf8_lossy(&response));
        for message in messages.iter_mut() {
            if let Some(attrs) = parsed.get(&message.uid) {
                message.gmail_message_id = attrs.message_id.clone();
                message.gmail_thread_id = attrs.thread_id.clone();
                message.labels = attrs.labels.clone();
            }
        }
        Ok(())
    }

    /// Fetches one whole message by UID.
    pub async fn fetch_message(&mut self, path: &str, uid: u32) -> Result<Vec<u8>> {
        self.ensure_selected(path).await?;
        let inner = self.inner()?;
        let mut stream = inner
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(SyncError::from)?;
        while let Some(fetch) = stream.try_next().await.map_err(SyncError::from)? {
            if fetch.uid != Some(uid) {
                continue;
            }
            if let Some(body) = fetch.body() {
                return Ok(body.to_vec());
            }
        }
        bail!("server returned no body for {path}/{uid}");
    }

    /// Applies a STORE query (`+FLAGS (\Seen)`, `-X-GM-LABELS (..)`, ...) to
    /// the given UIDs.
    pub async fn store(&mut self, path: &str, uids: &[u32], query: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.ensure_selected(path).await?;
        let inner = self.inner()?;
        for set in build_uid_sets(uids) {
            let mut stream = inner
                .uid_store(&set, query)
                .await
                .map_err(SyncError::from)?;
            while stream.try_next().await.map_err(SyncError::from)?.is_some() {}
        }
        Ok(())
    }

    /// Moves messages to `destination`, preferring MOVE and falling back to
    /// COPY + \Deleted + EXPUNGE.
    pub async fn move_messages(&mut self, path: &str, uids: &[u32], destination: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.ensure_selected(path).await?;
        let can_move = self.capabilities.can_move;
        for set in build_uid_sets(uids) {
            if can_move {
                let inner = self.inner()?;
                inner
                    .uid_mv(&set, destination)
                    .await
                    .map_err(SyncError::from)?;
            } else {
                {
                    let inner = self.inner()?;
                    inner
                        .uid_copy(&set, destination)
                        .await
                        .map_err(SyncError::from)?;
                }
                self.store(path, uids, "+FLAGS (\\Deleted)").await?;
                self.expunge().await?;
            }
        }
        Ok(())
    }

    /// Appends a complete RFC 822 message to `path`.
    pub async fn append(&mut self, path: &str, content: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        inner
            .append(path, None, None, content)
            .await
            .map_err(SyncError::from)?;
        Ok(())
    }

    /// Expunges the currently selected folder.
    pub async fn expunge(&mut self) -> Result<()> {
        let inner = self.inner()?;
        let stream = inner.expunge().await.map_err(SyncError::from)?;
        futures::pin_mut!(stream);
        while stream.try_next().await.map_err(SyncError::from)?.is_some() {}
        Ok(())
    }

    /// Marks everything in `path` deleted and expunges it.
    pub async fn expunge_all(&mut self, path: &str) -> Result<()> {
        let status = self.folder_status(path).await?;
        if status.message_count == 0 {
            return Ok(());
        }
        let inner = self.inner()?;
        {
            let mut stream = inner
                .store("1:*", "+FLAGS (\\Deleted)")
                .await
                .map_err(SyncError::from)?;
            while stream.try_next().await.map_err(SyncError::from)?.is_some() {}
        }
        self.expunge().await
    }

    /// IDLEs on the selected folder until the server pokes us or a worker
    /// event arrives. Returns the event, if any. There is no client-side
    /// timeout; the orphan guard and server keepalives bound the wait.
    pub async fn idle_until_event(
        &mut self,
        events: &async_channel::Receiver<WorkerEvent>,
    ) -> Result<Option<WorkerEvent>> {
        let session = self
            .inner
            .take()
            .ok_or_else(|| anyhow::anyhow!("IMAP session is not connected"))?;
        let mut handle = session.idle();
        if let Err(err) = handle.init().await {
            // The session inside the handle is likely unusable; drop it.
            return Err(SyncError::from(err).into());
        }

        let event = {
            let (idle_wait, interrupt) = handle.wait();
            let event = tokio::select! {
                result = idle_wait => {
                    result.map_err(SyncError::from)?;
                    debug!("IDLE exited on server activity");
                    None
                }
                event = events.recv() => {
                    debug!("IDLE interrupted by worker event");
                    Some(event.context("worker event channel closed")?)
                }
            };
            drop(interrupt);
            event
        };

        let session = handle.done().await.map_err(SyncError::from)?;
        self.inner = Some(session);
        Ok(event)
    }
}
