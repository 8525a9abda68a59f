//! # Account model.
//!
//! Accounts are constructed by the supervisor from the JSON the client
//! provides on startup and consumed read-only by the workers. Credentials are
//! never persisted by the core.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// Socket security for a server connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Security {
    /// TLS from the first byte.
    #[default]
    Ssl,
    /// Plaintext connection upgraded via STARTTLS.
    Starttls,
    /// No transport security.
    None,
}

/// Connection settings for one account, IMAP and SMTP sides.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_username: String,
    #[serde(default)]
    pub imap_password: String,
    pub imap_security: Security,
    #[serde(default)]
    pub imap_allow_insecure_ssl: bool,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    pub smtp_security: Security,
    #[serde(default)]
    pub smtp_allow_insecure_ssl: bool,

    /// OAuth refresh token. Token refresh itself is handled by the client;
    /// when present the current value doubles as the XOAUTH2 access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// One synced mailbox account.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    pub email_address: String,
    pub settings: AccountSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_token: Option<String>,
}

impl Account {
    /// Parses the account JSON handed over by the client (§6 shape).
    pub fn from_json(json: &str) -> Result<Self> {
        let account: Account =
            serde_json::from_str(json).context("could not parse account JSON")?;
        anyhow::ensure!(!account.id.is_empty(), "account JSON has no id");
        anyhow::ensure!(
            !account.settings.imap_host.is_empty(),
            "account JSON has no imap_host"
        );
        Ok(account)
    }

    pub fn uses_oauth(&self) -> bool {
        self.settings.refresh_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_from_json() {
        let account = Account::from_json(
            r#"{
                "id": "a1",
                "provider": "gmail",
                "emailAddress": "bob@example.com",
                "settings": {
                    "imap_host": "imap.example.com",
                    "imap_port": 993,
                    "imap_username": "bob@example.com",
                    "imap_password": "hunter2",
                    "imap_security": "SSL",
                    "smtp_host": "smtp.example.com",
                    "smtp_port": 587,
                    "smtp_username": "bob@example.com",
                    "smtp_password": "hunter2",
                    "smtp_security": "STARTTLS"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(account.email_address, "bob@example.com");
        assert_eq!(account.settings.imap_security, Security::Ssl);
        assert_eq!(account.settings.smtp_security, Security::Starttls);
        assert!(!account.uses_oauth());
    }

    #[test]
    fn test_account_json_requires_id() {
        assert!(Account::from_json(r#"{"emailAddress":"x@y.z","settings":{}}"#).is_err());
    }
}
