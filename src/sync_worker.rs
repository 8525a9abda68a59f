//! # Folder synchronization workers.
//!
//! One worker per account and role: the background worker sweeps every
//! folder (deep scan + change feed + body backfill) and toggles the unlink
//! phase; the foreground worker IDLEs on the inbox, services body fetches on
//! demand and drains the local→remote task queue. Workers never share an
//! IMAP session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use tracing::{info, warn};

use crate::account::Account;
use crate::error::{classify, SyncError};
use crate::folder::{role_rank, Folder, FolderLocalStatus, Label};
use crate::imap::session::Session;
use crate::imap::{FolderStatus, RemoteMessage, SyncResult, UidRange};
use crate::message::{Message, MessageAttributes};
use crate::processor::MailProcessor;
use crate::store::{Query, Store};
use crate::task::Task;
use crate::task_processor::TaskProcessor;
use crate::tools;

/// Pause between background sweeps. Long, because the foreground worker is
/// idling in parallel.
const SYNC_INTERVAL: Duration = Duration::from_secs(120);
/// Pause before re-entering after a retryable failure.
const RETRY_INTERVAL: Duration = Duration::from_secs(120);
/// Without QRESYNC a finished deep scan is re-run this often to find flag
/// changes and deletions outside CONDSTORE range.
const FULL_SCAN_INTERVAL: i64 = 60 * 10;
/// Deep-scan chunk on a fresh pass (gentler on first contact) vs. a
/// continuation (throughput).
const FULL_SCAN_CHUNK_INITIAL: u32 = 200;
const FULL_SCAN_CHUNK: u32 = 1000;
/// Shallow scans reach down to the 500th most recent known UID.
const SHALLOW_SCAN_DEPTH: u32 = 499;
/// Bodies fetched per folder per sweep, and how old a message may be to
/// still get one.
const BODY_BATCH: usize = 10;
const BODY_MAX_AGE: i64 = 30 * 24 * 60 * 60;

/// Wakeup sent to the foreground worker. Replaces shared mutable flags with
/// explicit events serviced at the cycle's poll points.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Restart the cycle from the top.
    Reloop,
    /// Fetch the body for this message id.
    FetchBody(String),
    /// A task reached `remote` status and wants its remote part run.
    TaskReady,
}

pub struct SyncWorker {
    name: &'static str,
    account: Arc<Account>,
    store: Arc<Store>,
    processor: MailProcessor,
    task_processor: TaskProcessor,
    session: Option<Session>,
    unlink_phase: u32,
    events: Option<async_channel::Receiver<WorkerEvent>>,
    pending_bodies: Vec<String>,
}

impl SyncWorker {
    pub fn new(
        name: &'static str,
        account: Arc<Account>,
        store: Arc<Store>,
        events: Option<async_channel::Receiver<WorkerEvent>>,
    ) -> Self {
        SyncWorker {
            name,
            account: account.clone(),
            store: store.clone(),
            processor: MailProcessor::new(account.clone(), store.clone()),
            task_processor: TaskProcessor::new(account, store),
            session: None,
            unlink_phase: 1,
            events,
            pending_bodies: Vec::new(),
        }
    }

    async fn session(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            info!("[{}] connecting IMAP session", self.name);
            self.session = Some(Session::connect(&self.account).await?);
        }
        Ok(self.session.as_mut().expect("session was just connected"))
    }

    /// Background loop: hard-loop while a sweep reports remaining work, then
    /// sleep. Signals `on_first_sweep` once so the supervisor can start the
    /// foreground worker with the folder list populated.
    pub async fn run_background(
        mut self,
        on_first_sweep: tokio::sync::oneshot::Sender<()>,
    ) -> Result<()> {
        let mut on_first_sweep = Some(on_first_sweep);
        loop {
            let mut more_to_sync = true;
            while more_to_sync {
                match self.sync_now().await {
                    Ok(again) => {
                        more_to_sync = again;
                        if let Some(sender) = on_first_sweep.take() {
                            sender.send(()).ok();
                        }
                    }
                    Err(err) => {
                        if classify(&err) == "fatal" {
                            return Err(err.context("background sync failed"));
                        }
                        warn!("[{}] sweep failed, will retry: {err:#}", self.name);
                        self.session = None;
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                }
            }
            tokio::time::sleep(SYNC_INTERVAL).await;
        }
    }

    /// Foreground loop: idle cycles with reconnect-on-retryable.
    pub async fn run_foreground(mut self) -> Result<()> {
        loop {
            let Err(err) = self.idle_cycle().await else {
                continue;
            };
            if classify(&err) == "fatal" {
                return Err(err.context("foreground sync failed"));
            }
            warn!("[{}] idle cycle failed, will retry: {err:#}", self.name);
            self.session = None;
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    // ---- Background behaviors -------------------------------------------

    /// One full pass over every folder. Returns true if any folder has more
    /// deep-scan or body work, prompting an immediate re-loop.
    pub async fn sync_now(&mut self) -> Result<bool> {
        let mut sync_again_immediately = false;

        let mut folders = self.sync_folders_and_labels().await?;
        folders.sort_by_key(|folder| role_rank(&folder.role));

        for mut folder in folders {
            match self.sync_folder(&mut folder).await {
                Ok(more) => sync_again_immediately |= more,
                Err(err) => match classify(&err) {
                    "folder" => {
                        warn!("{err:#}");
                        self.reset_folder(&mut folder).await?;
                    }
                    "retryable" => return Err(err),
                    _ => warn!("syncing folder {} failed: {err:#}", folder.path),
                },
            }
        }

        // Messages this sweep unlinked carry the old phase; toggling first
        // gives anything that vanished one extra cycle to reappear in
        // another folder before it's really, really gone.
        self.unlink_phase = if self.unlink_phase == 1 { 2 } else { 1 };
        info!(
            "[{}] sync loop deleting unlinked messages with phase {}",
            self.name, self.unlink_phase
        );
        self.processor
            .delete_messages_still_unlinked_from_phase(self.unlink_phase)
            .await?;

        info!("[{}] sync loop complete", self.name);
        Ok(sync_again_immediately)
    }

    async fn sync_folder(&mut self, folder: &mut Folder) -> Result<bool> {
        let status = self.session().await?.folder_status(&folder.path).await?;

        if folder.local_status.uidvalidity.is_none() {
            // Seed the CONDSTORE baseline before the deep scan starts
            // working backwards, so it covers everything that could have
            // changed while the scan runs.
            folder.local_status.uidvalidity = Some(status.uidvalidity);
            folder.local_status.highestmodseq = status.highestmodseq;
        }
        if folder.local_status.uidvalidity != Some(status.uidvalidity) {
            return Err(SyncError::UidValidityChanged {
                folder: folder.path.clone(),
                local: folder.local_status.uidvalidity.unwrap_or(0),
                remote: status.uidvalidity,
            }
            .into());
        }

        let full_scan_in_progress = self
            .sync_folder_full_scan_incremental(folder, &status)
            .await?;

        if self.session().await?.capabilities.can_condstore {
            self.sync_folder_changes_via_condstore(folder, &status)
                .await?;
        } else {
            self.sync_folder_changes_via_shallow_scan(folder, &status)
                .await?;
        }

        let bodies_in_progress = self.sync_message_bodies(folder).await?;

        self.store.save(folder, true).await?;
        Ok(full_scan_in_progress || bodies_in_progress)
    }

    /// UIDVALIDITY changed: drop the sync state and unlink everything so the
    /// next sweep rebuilds the folder from scratch.
    async fn reset_folder(&mut self, folder: &mut Folder) -> Result<()> {
        folder.local_status = FolderLocalStatus::default();
        self.processor
            .unlink_messages_matching_query(
                &Query::new().equal("remoteFolderId", folder.id.as_str()),
                self.unlink_phase,
            )
            .await?;
        self.store.save(folder, true).await
    }

    /// Reconciles the remote folder list against local Folder/Label rows.
    /// Returns the folders to sweep.
    async fn sync_folders_and_labels(&mut self) -> Result<Vec<Folder>> {
        info!("[{}] syncing folder list...", self.name);
        let session = self.session().await?;
        let is_gmail = session.capabilities.is_gmail;
        let remote_folders = session.list_folders().await?;

        let account_id = self.account.id.clone();
        let mut tx = self.store.begin().await?;
        let by_id = Query::new().equal("accountId", account_id.as_str());
        let mut local_folders = tx.find_all_map::<Folder, _>(&by_id, |f| f.id.clone())?;
        let mut local_labels = tx.find_all_map::<Label, _>(&by_id, |l| l.folder.id.clone())?;

        let mut folders_to_sync = Vec::new();
        for remote in remote_folders {
            if remote.no_select {
                continue;
            }
            let id = tools::id_for_parts(&[&account_id, &remote.path]);

            if is_gmail && !matches!(remote.role, "all" | "spam" | "trash") {
                let mut label = local_labels
                    .remove(&id)
                    .unwrap_or_else(|| Label::new(&account_id, &remote.path, remote.role));
                if label.folder.version == 0
                    || label.folder.role != remote.role
                    || label.folder.path != remote.path
                {
                    label.folder.path = remote.path.clone();
                    label.folder.role = remote.role.to_string();
                    tx.conn().execute(
                        "INSERT OR IGNORE INTO ThreadCounts (categoryId, unread, total) VALUES (?, 0, 0)",
                        [label.folder.id.as_str()],
                    )?;
                    tx.save(&mut label, true)?;
                }
            } else {
                let mut folder = local_folders
                    .remove(&id)
                    .unwrap_or_else(|| Folder::new(&account_id, &remote.path, remote.role));
                if folder.version == 0 || folder.role != remote.role || folder.path != remote.path {
                    folder.path = remote.path.clone();
                    folder.role = remote.role.to_string();
                    tx.conn().execute(
                        "INSERT OR IGNORE INTO ThreadCounts (categoryId, unread, total) VALUES (?, 0, 0)",
                        [folder.id.as_str()],
                    )?;
                    tx.save(&mut folder, true)?;
                }
                folders_to_sync.push(folder);
            }
        }

        // Anything left locally no longer exists on the remote.
        for (_, folder) in local_folders {
            tx.conn()
                .execute("DELETE FROM ThreadCounts WHERE categoryId = ?", [folder.id.as_str()])?;
            tx.remove(&folder)?;
        }
        for (_, label) in local_labels {
            tx.conn()
                .execute("DELETE FROM ThreadCounts WHERE categoryId = ?", [label.folder.id.as_str()])?;
            tx.remove(&label)?;
        }

        tx.commit()?;
        Ok(folders_to_sync)
    }

    /// One chunk of the incremental deep scan: walk the UID space backwards
    /// from the fullscan head to discover deletions and flag changes out of
    /// CONDSTORE range. Returns true while a pass is in progress.
    async fn sync_folder_full_scan_incremental(
        &mut self,
        folder: &mut Folder,
        status: &FolderStatus,
    ) -> Result<bool> {
        let qresync = self.session().await?.capabilities.can_qresync;

        let mut head = folder.local_status.full_scan_head;
        let mut chunk = FULL_SCAN_CHUNK;

        // With QRESYNC one pass is enough; otherwise re-scan periodically.
        let stale = !qresync
            && tools::time() - folder.local_status.full_scan_time > FULL_SCAN_INTERVAL;
        if head == u32::MAX || stale {
            // The uidnext recorded now is the "oldest" point of this pass;
            // CONDSTORE from here on sees everything that could change.
            folder.local_status.uidnext = status.uidnext;
            head = status.uidnext;
            chunk = FULL_SCAN_CHUNK_INITIAL;
        }

        if head <= 1 {
            return Ok(false);
        }

        // The UID space is sparse; if the folder is small, take it in one
        // bite rather than stepping through empty ranges.
        let mut chunk_next_head = head.saturating_sub(chunk).max(1);
        if status.message_count < chunk {
            chunk_next_head = 1;
        }

        self.sync_folder_uid_range(folder, UidRange::new(chunk_next_head, head))
            .await?;

        folder.local_status.full_scan_head = chunk_next_head;
        folder.local_status.full_scan_time = tools::time();
        Ok(true)
    }

    async fn sync_folder_uid_range(&mut self, folder: &Folder, range: UidRange) -> Result<()> {
        info!(
            "[{}] syncing folder {} (UIDs {} - {})",
            self.name, folder.path, range.lo, range.hi
        );
        let remote = self
            .session()
            .await?
            .fetch_headers(&folder.path, range)
            .await?;
        apply_uid_range(
            &self.processor,
            &self.store,
            folder,
            range,
            remote,
            self.unlink_phase,
        )
        .await
    }

    /// CONDSTORE/QRESYNC change feed; falls back to a shallow scan for
    /// deletion detection when the server can't report vanished UIDs.
    async fn sync_folder_changes_via_condstore(
        &mut self,
        folder: &mut Folder,
        status: &FolderStatus,
    ) -> Result<()> {
        let modseq = folder.local_status.highestmodseq;
        if modseq == status.highestmodseq {
            info!(
                "[{}] syncing folder {}: highestmodseq matches, no changes",
                self.name, folder.path
            );
            return Ok(());
        }

        info!(
            "[{}] syncing folder {}: highestmodseq changed, requesting changes...",
            self.name, folder.path
        );
        let result = self
            .session()
            .await?
            .sync_messages_by_uid(&folder.path, modseq)
            .await?;

        apply_condstore_changes(&self.processor, &self.store, &self.account, folder, &result)
            .await?;

        // vanished is only populated when QRESYNC is available.
        match &result.vanished {
            Some(vanished) => {
                info!("[{}] {} messages vanished", self.name, vanished.len());
                if !vanished.is_empty() {
                    let query = Query::new()
                        .equal("remoteFolderId", folder.id.as_str())
                        .any("remoteUID", vanished.clone());
                    self.processor
                        .unlink_messages_matching_query(&query, self.unlink_phase)
                        .await?;
                }
            }
            None => {
                self.sync_folder_changes_via_shallow_scan(folder, status)
                    .await?;
            }
        }

        folder.local_status.uidnext = status.uidnext;
        folder.local_status.highestmodseq = status.highestmodseq;
        Ok(())
    }

    /// Reconciles just the most recent stretch of the folder: from the
    /// 500th-most-recent known UID up to UIDNEXT. `messageCount` is not a
    /// reliable head pointer on Gmail, so this works in UIDs.
    async fn sync_folder_changes_via_shallow_scan(
        &mut self,
        folder: &mut Folder,
        status: &FolderStatus,
    ) -> Result<()> {
        let bottom = self
            .store
            .fetch_message_uid_at_depth(folder, SHALLOW_SCAN_DEPTH, status.uidnext)?;
        info!(
            "[{}] syncing via shallow scan (UIDs {} - {})",
            self.name, bottom, status.uidnext
        );
        self.sync_folder_uid_range(folder, UidRange::new(bottom, status.uidnext))
            .await?;
        folder.local_status.uidnext = status.uidnext;
        Ok(())
    }

    /// Fetches up to [`BODY_BATCH`] missing bodies, newest first. Returns
    /// true iff it did work.
    async fn sync_message_bodies(&mut self, folder: &Folder) -> Result<bool> {
        // Who needs spam bodies? Probably nobody.
        if folder.role == "spam" || folder.role == "trash" {
            return Ok(false);
        }

        let messages = self.store.fetch_messages_missing_bodies(
            &folder.id,
            tools::time() - BODY_MAX_AGE,
            BODY_BATCH,
        )?;
        let did_work = !messages.is_empty();
        for mut message in messages {
            if let Err(err) = self.sync_message_body(&mut message).await {
                warn!("could not fetch body for {}: {err:#}", message.id);
            }
        }
        Ok(did_work)
    }

    async fn sync_message_body(&mut self, message: &mut Message) -> Result<()> {
        if message.is_unlinked() {
            return Ok(());
        }
        let raw = self
            .session()
            .await?
            .fetch_message(&message.remote_folder.path, message.remote_uid)
            .await?;
        self.processor.retrieved_message_body(message, &raw).await
    }

    // ---- Foreground behaviors -------------------------------------------

    /// The cooperative foreground cycle: body requests, then remote task
    /// parts, then a recent-change pass on the inbox, then IDLE. Any event
    /// arriving between steps restarts the cycle from the top.
    pub async fn idle_cycle(&mut self) -> Result<()> {
        let events = self
            .events
            .clone()
            .context("foreground worker has no event channel")?;

        loop {
            // Run body requests.
            while let Some(id) = self.pending_bodies.pop() {
                let Some(mut message) = self
                    .store
                    .find::<Message>(&Query::new().equal("id", id.as_str()))?
                else {
                    continue;
                };
                info!("[{}] fetching body for message {}", self.name, message.id);
                if let Err(err) = self.sync_message_body(&mut message).await {
                    warn!("could not fetch requested body {}: {err:#}", message.id);
                }
            }
            if self.drain_events(&events) {
                continue;
            }

            // Run tasks ready for their remote part.
            let tasks = self
                .store
                .find_all::<Task>(&Query::new().equal("status", "remote"))?;
            if !tasks.is_empty() {
                self.session().await?;
            }
            for mut task in tasks {
                let session = self.session.as_mut().context("session disappeared")?;
                self.task_processor.perform_remote(&mut task, session).await?;
            }
            if self.drain_events(&events) {
                continue;
            }

            // Locate the inbox, falling back to "all".
            let inbox = match self
                .store
                .find::<Folder>(&Query::new().equal("role", "inbox"))?
            {
                Some(folder) => Some(folder),
                None => self
                    .store
                    .find::<Folder>(&Query::new().equal("role", "all"))?,
            };
            let Some(mut inbox) = inbox else {
                bail!("no inbox to idle on");
            };
            if self.drain_events(&events) {
                continue;
            }

            // Check for mail in the folder.
            let status = self.session().await?.folder_status(&inbox.path).await?;
            if self.session().await?.capabilities.can_condstore {
                self.sync_folder_changes_via_condstore(&mut inbox, &status)
                    .await?;
            } else {
                self.sync_folder_changes_via_shallow_scan(&mut inbox, &status)
                    .await?;
            }
            self.sync_message_bodies(&inbox).await?;
            self.store.save(&mut inbox, true).await?;

            if self.drain_events(&events) {
                continue;
            }

            // Idle on the folder.
            if self.session().await?.capabilities.can_idle {
                info!("[{}] idling on folder {}", self.name, inbox.path);
                let session = self.session.as_mut().context("session disappeared")?;
                if let Some(event) = session.idle_until_event(&events).await? {
                    self.apply_event(event);
                }
            } else {
                // No IDLE capability: poll instead, still interruptible.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    event = events.recv() => {
                        if let Ok(event) = event {
                            self.apply_event(event);
                        }
                    }
                }
            }
        }
    }

    fn apply_event(&mut self, event: WorkerEvent) {
        if let WorkerEvent::FetchBody(id) = event {
            self.pending_bodies.push(id);
        }
    }

    /// Drains pending events; any event means the cycle restarts at its
    /// first step.
    fn drain_events(&mut self, events: &async_channel::Receiver<WorkerEvent>) -> bool {
        let mut any = false;
        while let Ok(event) = events.try_recv() {
            any = true;
            self.apply_event(event);
        }
        any
    }
}

/// Diffs fetched remote records against the local rows in the same UID
/// range: new or changed records are upserted newest-first, local rows the
/// server no longer reports are unlinked at the current phase.
pub(crate) async fn apply_uid_range(
    processor: &MailProcessor,
    store: &Store,
    folder: &Folder,
    range: UidRange,
    mut remote: Vec<RemoteMessage>,
    unlink_phase: u32,
) -> Result<()> {
    let synced_at = tools::time();
    let mut local = store.fetch_messages_attributes_in_range(range, folder)?;

    remote.sort_unstable_by(|a, b| b.uid.cmp(&a.uid));

    let mut window = Instant::now();
    for message in &remote {
        // Never sit in a hard loop writing to the database; yield so a peer
        // worker waiting on the write lock gets a turn.
        if window.elapsed() > Duration::from_millis(250) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            window = Instant::now();
        }

        let attrs = MessageAttributes {
            uid: message.uid,
            unread: message.unread,
            starred: message.starred,
            draft: message.draft,
            labels: message.labels.clone(),
        };
        let changed = match local.remove(&message.uid) {
            Some(known) => !known.matches(&attrs),
            None => true,
        };
        if changed {
            if let Err(err) = processor
                .insert_fallback_to_update(message, folder, synced_at)
                .await
            {
                warn!("could not ingest UID {} in {}: {err:#}", message.uid, folder.path);
            }
        }
    }

    // Whatever is left locally was in the range but absent remotely: unlink
    // now, delete later unless it reappears in another folder.
    if !local.is_empty() {
        let uids: Vec<u32> = local.keys().copied().collect();
        let query = Query::new()
            .equal("remoteFolderId", folder.id.as_str())
            .any("remoteUID", uids);
        processor
            .unlink_messages_matching_query(&query, unlink_phase)
            .await?;
    }
    Ok(())
}

/// Applies a CHANGEDSINCE result: unknown ids are inserted, known ids
/// updated (possibly moving them into this folder), in server order.
pub(crate) async fn apply_condstore_changes(
    processor: &MailProcessor,
    store: &Store,
    account: &Account,
    folder: &Folder,
    result: &SyncResult,
) -> Result<()> {
    let synced_at = tools::time();
    let ids: Vec<String> = result
        .modified_or_added
        .iter()
        .map(|m| Message::id_for_remote(&account.id, &folder.path, m))
        .collect();
    let mut local =
        store.find_all_map::<Message, _>(&Query::new().any("id", ids.clone()), |m| m.id.clone())?;

    for (remote, id) in result.modified_or_added.iter().zip(&ids) {
        let outcome = match local.get_mut(id) {
            None => processor
                .insert_fallback_to_update(remote, folder, synced_at)
                .await
                .map(|_| ()),
            Some(known) => {
                processor
                    .update_message(known, remote, folder, synced_at)
                    .await
            }
        };
        if let Err(err) = outcome {
            warn!("could not apply change for UID {} in {}: {err:#}", remote.uid, folder.path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod sync_worker_tests;
