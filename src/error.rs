//! # Sync error taxonomy.
//!
//! Errors are classified at the sync seam so the supervising loops can decide
//! between retrying a sweep, resetting a single folder, or exiting.

use std::io;

/// Error raised while syncing an account.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The folder's UIDVALIDITY cookie changed. All UIDs known for the folder
    /// are invalid; the folder must be resynced from scratch.
    #[error("UIDVALIDITY of {folder:?} changed from {local} to {remote}, resync required")]
    UidValidityChanged {
        folder: String,
        local: u32,
        remote: u32,
    },

    /// Transient transport failure. The enclosing sweep should be retried
    /// after a pause with a fresh connection.
    #[error("retryable transport error: {0}")]
    Retryable(String),

    /// Unrecoverable failure (authentication, invalid account, protocol
    /// violation). Propagates to process exit.
    #[error("fatal sync error: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Whether the supervising loop should reconnect and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Retryable(_))
    }
}

impl From<async_imap::error::Error> for SyncError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error::*;
        match &err {
            Io(_) | ConnectionLost => SyncError::Retryable(err.to_string()),
            // BAD/NO responses outside of login are server-state dependent;
            // treat them as transient so a sweep retry can observe the new state.
            No(_) | Bad(_) => SyncError::Retryable(err.to_string()),
            _ => SyncError::Fatal(err.to_string()),
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Retryable(err.to_string())
    }
}

/// Classifies an `anyhow` chain for the supervising loops: a `SyncError`
/// anywhere in the chain keeps its classification, IO errors are retryable,
/// everything else is fatal.
pub fn classify(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(sync_err) = cause.downcast_ref::<SyncError>() {
            return match sync_err {
                SyncError::Retryable(_) => "retryable",
                SyncError::UidValidityChanged { .. } => "folder",
                SyncError::Fatal(_) => "fatal",
            };
        }
        if cause.downcast_ref::<io::Error>().is_some()
            || cause.downcast_ref::<async_imap::error::Error>().is_some()
        {
            return "retryable";
        }
    }
    "fatal"
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_classify_chain() {
        let err = anyhow::Error::new(SyncError::Retryable("reset by peer".into()))
            .context("syncing folder INBOX");
        assert_eq!(classify(&err), "retryable");

        let err = anyhow::Error::new(SyncError::UidValidityChanged {
            folder: "INBOX".into(),
            local: 1,
            remote: 2,
        });
        assert_eq!(classify(&err), "folder");

        let err = anyhow::anyhow!("no inbox to idle on");
        assert_eq!(classify(&err), "fatal");
    }
}
