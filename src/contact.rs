//! # Contact model.
//!
//! Contacts feed the client's composer autocomplete. They are keyed by the
//! normalized email per account; the empty key is never stored.

use anyhow::Result;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::store::Model;
use crate::tools;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub version: i64,
    /// Normalized email (see [`tools::contact_key_for_email`]).
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// How often the user has written to this contact.
    #[serde(default)]
    pub refs: i64,
}

impl Contact {
    pub fn new(account_id: &str, email: &str, name: &str) -> Self {
        Contact {
            id: tools::id_for_parts(&[account_id, "contact", email]),
            account_id: account_id.to_string(),
            version: 0,
            email: email.to_string(),
            name: name.to_string(),
            refs: 0,
        }
    }

    /// Text indexed into the ContactSearch FTS table.
    pub fn search_content(&self) -> String {
        if self.name.is_empty() {
            self.email.clone()
        } else {
            format!("{} {}", self.name, self.email)
        }
    }
}

impl Model for Contact {
    const TABLE: &'static str = "Contact";
    const COLUMNS: &'static [&'static str] = &["email", "refs"];

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
            Value::Text(self.email.clone()),
            Value::Integer(self.refs),
        ])
    }
}
