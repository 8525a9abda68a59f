//! # IMAP handling module.
//!
//! Wraps [async-email/async-imap](https://github.com/async-email/async-imap)
//! behind a per-worker [`session::Session`] collaborator. This module holds
//! the remote-side types the sync engine consumes plus the header/attribute
//! parsing; the protocol state machine itself stays in the library.

use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use mailparse::MailHeaderMap;

use crate::message::Participant;

pub(crate) mod client;
pub mod session;

/// Header fields fetched for every message during reconciliation. Everything
/// the local row needs, without the body.
const HEADER_FIELDS: &str = "BODY.PEEK[HEADER.FIELDS (\
                             MESSAGE-ID \
                             SUBJECT \
                             DATE \
                             FROM \
                             TO \
                             CC \
                             BCC \
                             IN-REPLY-TO \
                             REFERENCES\
                             )]";

pub(crate) fn header_fetch_query() -> String {
    format!("(UID FLAGS INTERNALDATE RFC822.SIZE {HEADER_FIELDS})")
}

/// An inclusive UID range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub lo: u32,
    pub hi: u32,
}

impl UidRange {
    pub fn new(lo: u32, hi: u32) -> Self {
        UidRange { lo, hi }
    }

    pub(crate) fn to_set(self) -> String {
        if self.lo == self.hi {
            self.lo.to_string()
        } else {
            format!("{}:{}", self.lo, self.hi)
        }
    }
}

/// One mailbox as reported by LIST.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub path: String,
    pub role: &'static str,
    pub no_select: bool,
}

/// STATUS-level facts about a selected folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderStatus {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: u64,
    pub message_count: u32,
}

/// One message record as reconciled against the local store. Header-level
/// only; bodies are fetched separately.
#[derive(Debug, Clone, Default)]
pub struct RemoteMessage {
    pub uid: u32,
    pub unread: bool,
    pub starred: bool,
    pub draft: bool,
    /// `None` when the message arrived without a Message-ID; the local row
    /// then gets a generated one and never joins threads by reference.
    pub header_message_id: Option<String>,
    pub subject: String,
    pub date: i64,
    pub references: Vec<String>,
    pub in_reply_to: Vec<String>,
    pub from: Vec<Participant>,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub gmail_message_id: Option<String>,
    pub gmail_thread_id: Option<String>,
    pub labels: Vec<String>,
}

/// Result of a CHANGEDSINCE sync. `vanished` is only populated when the
/// server speaks QRESYNC.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub modified_or_added: Vec<RemoteMessage>,
    pub vanished: Option<Vec<u32>>,
}

/// Canonical mailbox role from special-use attributes, with a by-name
/// fallback for servers that don't advertise them.
pub(crate) fn role_for_folder(name: &Name) -> &'static str {
    for attr in name.attributes() {
        let role = match attr {
            NameAttribute::All => "all",
            NameAttribute::Archive => "archive",
            NameAttribute::Drafts => "drafts",
            NameAttribute::Flagged => "important",
            NameAttribute::Junk => "spam",
            NameAttribute::Sent => "sent",
            NameAttribute::Trash => "trash",
            _ => continue,
        };
        return role;
    }
    role_for_folder_name(name.name())
}

fn role_for_folder_name(path: &str) -> &'static str {
    let base = path.rsplit(['/', '.']).next().unwrap_or(path);
    match base.to_lowercase().as_str() {
        "inbox" => "inbox",
        "spam" | "junk" | "junk mail" => "spam",
        "trash" | "deleted items" | "deleted messages" => "trash",
        "sent" | "sent items" | "sent messages" | "sent mail" => "sent",
        "drafts" | "draft" => "drafts",
        "all mail" | "all" => "all",
        "archive" => "archive",
        "important" => "important",
        _ => "",
    }
}

/// Converts one FETCH response into a [`RemoteMessage`]. Malformed messages
/// error here and are skipped by the caller; they never abort a sweep.
pub(crate) fn remote_message_from_fetch(fetch: &Fetch) -> Result<RemoteMessage> {
    let uid = fetch.uid.context("FETCH response without UID")?;

    let mut unread = true;
    let mut starred = false;
    let mut draft = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => unread = false,
            Flag::Flagged => starred = true,
            Flag::Draft => draft = true,
            _ => {}
        }
    }

    let (headers, _) = mailparse::parse_headers(fetch.header().unwrap_or_default())
        .context("could not parse FETCH headers")?;

    let header_message_id = headers
        .get_first_value("Message-ID")
        .map(|v| trim_message_id(&v))
        .filter(|v| !v.is_empty());

    let date = fetch
        .internal_date()
        .map(|d| d.timestamp())
        .or_else(|| {
            headers
                .get_first_value("Date")
                .and_then(|v| mailparse::dateparse(&v).ok())
        })
        .unwrap_or(0);

    Ok(RemoteMessage {
        uid,
        unread,
        starred,
        draft,
        header_message_id,
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        date,
        references: message_id_list(&headers, "References"),
        in_reply_to: message_id_list(&headers, "In-Reply-To"),
        from: address_list(&headers, "From"),
        to: address_list(&headers, "To"),
        cc: address_list(&headers, "Cc"),
        bcc: address_list(&headers, "Bcc"),
        gmail_message_id: None,
        gmail_thread_id: None,
        labels: Vec::new(),
    })
}

fn trim_message_id(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

fn message_id_list(headers: &[mailparse::MailHeader<'_>], header: &str) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all_values(header) {
        for token in value.split_whitespace() {
            let id = trim_message_id(token);
            if !id.is_empty() {
                out.push(id);
            }
        }
    }
    out
}

fn address_list(headers: &[mailparse::MailHeader<'_>], header: &str) -> Vec<Participant> {
    let mut out = Vec::new();
    for h in headers.get_all_headers(header) {
        let Ok(parsed) = mailparse::addrparse_header(h) else {
            continue;
        };
        for addr in parsed.iter() {
            match addr {
                mailparse::MailAddr::Single(info) => out.push(Participant {
                    name: info.display_name.clone().unwrap_or_default(),
                    email: info.addr.clone(),
                }),
                mailparse::MailAddr::Group(group) => {
                    for info in &group.addrs {
                        out.push(Participant {
                            name: info.display_name.clone().unwrap_or_default(),
                            email: info.addr.clone(),
                        });
                    }
                }
            }
        }
    }
    out
}

/// Builds a list of UID sets, each below the ~1000 character command line
/// length that RFC 2683 says servers must tolerate.
pub(crate) fn build_uid_sets(uids: &[u32]) -> Vec<String> {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for uid in sorted {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == uid => *end = uid,
            _ => ranges.push((uid, uid)),
        }
    }

    let mut out = Vec::new();
    let mut current = String::new();
    for (start, end) in ranges {
        let piece = if start == end {
            start.to_string()
        } else {
            format!("{start}:{end}")
        };
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(&piece);
        if current.len() > 990 {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Gmail attributes of one message, read through the raw FETCH plumbing
/// because the typed API has no accessor for X-GM extension items.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct GmailAttributes {
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub labels: Vec<String>,
}

/// Parses `* N FETCH (UID .. X-GM-MSGID .. X-GM-THRID .. X-GM-LABELS (..))`
/// lines out of a raw response, keyed by UID.
pub(crate) fn parse_gmail_attributes(response: &str) -> HashMap<u32, GmailAttributes> {
    let mut out = HashMap::new();
    for line in response.lines() {
        let Some(rest) = line
            .strip_prefix("* ")
            .and_then(|l| l.split_once("FETCH (").map(|(_, rest)| rest))
        else {
            continue;
        };
        let mut uid = None;
        let mut attrs = GmailAttributes::default();
        let mut cursor = rest;
        while let Some((token, next)) = next_atom(cursor) {
            cursor = next;
            match token.to_ascii_uppercase().as_str() {
                "UID" => {
                    if let Some((value, next)) = next_atom(cursor) {
                        uid = value.parse::<u32>().ok();
                        cursor = next;
                    }
                }
                "X-GM-MSGID" => {
                    if let Some((value, next)) = next_atom(cursor) {
                        attrs.message_id = Some(value.to_string());
                        cursor = next;
                    }
                }
                "X-GM-THRID" => {
                    if let Some((value, next)) = next_atom(cursor) {
                        attrs.thread_id = Some(value.to_string());
                        cursor = next;
                    }
                }
                "X-GM-LABELS" => {
                    let (labels, next) = parse_paren_list(cursor);
                    attrs.labels = labels;
                    cursor = next;
                }
                _ => {}
            }
        }
        if let Some(uid) = uid {
            out.insert(uid, attrs);
        }
    }
    out
}

/// Next whitespace-delimited atom, stopping at parens.
fn next_atom(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() || input.starts_with(')') {
        return None;
    }
    let end = input
        .find(|c: char| c.is_whitespace() || c == ')' || c == '(')
        .unwrap_or(input.len());
    if end == 0 {
        return None;
    }
    Some((&input[..end], &input[end..]))
}

/// Parses a parenthesized list of atoms / quoted strings.
fn parse_paren_list(input: &str) -> (Vec<String>, &str) {
    let input = input.trim_start();
    let Some(mut rest) = input.strip_prefix('(') else {
        // NIL or a single atom.
        return match next_atom(input) {
            Some((atom, next)) if !atom.eq_ignore_ascii_case("NIL") => {
                (vec![atom.to_string()], next)
            }
            Some((_, next)) => (Vec::new(), next),
            None => (Vec::new(), input),
        };
    };

    let mut items = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after) = rest.strip_prefix(')') {
            return (items, after);
        }
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut consumed = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        consumed = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            items.push(value);
            rest = &quoted[consumed..];
        } else if let Some((atom, next)) = next_atom(rest) {
            items.push(atom.to_string());
            rest = next;
        } else {
            break;
        }
    }
    (items, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_for_folder_name() {
        assert_eq!(role_for_folder_name("INBOX"), "inbox");
        assert_eq!(role_for_folder_name("[Gmail]/All Mail"), "all");
        assert_eq!(role_for_folder_name("[Gmail]/Sent Mail"), "sent");
        assert_eq!(role_for_folder_name("INBOX.Junk"), "spam");
        assert_eq!(role_for_folder_name("Newsletters"), "");
    }

    #[test]
    fn test_build_uid_sets_compresses_ranges() {
        assert_eq!(build_uid_sets(&[1, 2, 3, 7, 9, 10]), vec!["1:3,7,9:10"]);
        assert_eq!(build_uid_sets(&[5]), vec!["5"]);
        assert!(build_uid_sets(&[]).is_empty());

        // Duplicates and ordering don't matter.
        assert_eq!(build_uid_sets(&[3, 1, 2, 2]), vec!["1:3"]);
    }

    #[test]
    fn test_parse_gmail_attributes() {
        let response = "* 12 FETCH (UID 42 X-GM-MSGID 1278455344230334865 \
                        X-GM-THRID 1266894439832287888 \
                        X-GM-LABELS (\\Inbox \\Sent \"Work & Life\" Receipts))\r\n\
                        * 13 FETCH (UID 43 X-GM-MSGID 99 X-GM-THRID 100 X-GM-LABELS ())\r\n";
        let parsed = parse_gmail_attributes(response);
        let a = parsed.get(&42).unwrap();
        assert_eq!(a.message_id.as_deref(), Some("1278455344230334865"));
        assert_eq!(a.thread_id.as_deref(), Some("1266894439832287888"));
        assert_eq!(a.labels, vec!["\\Inbox", "\\Sent", "Work & Life", "Receipts"]);
        assert_eq!(parsed.get(&43).unwrap().labels, Vec::<String>::new());
    }

    #[test]
    fn test_parse_gmail_attributes_ignores_other_lines() {
        let parsed = parse_gmail_attributes("a2 OK Success\r\n* 1 EXISTS\r\n");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_uid_range_set() {
        assert_eq!(UidRange::new(4, 4).to_set(), "4");
        assert_eq!(UidRange::new(1, 200).to_set(), "1:200");
    }
}
