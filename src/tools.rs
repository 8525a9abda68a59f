//! Small helpers shared across the crate: time, deterministic ids, string
//! normalization.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Message-IDs we generate locally (the message had none) carry this prefix
/// and never participate in References threading.
pub(crate) const GENERATED_PREFIX: &str = "GEN_";

/// Returns the current time as unix epoch seconds.
pub fn time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Deterministic 40-char hex id derived from the given parts.
///
/// Entity identity must be stable across sweeps so that re-discovering the
/// same remote object maps onto the same row.
pub fn id_for_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x00");
    }
    format!("{:x}", hasher.finalize())[..40].to_string()
}

/// Random id for entities without a deterministic identity (tasks).
pub fn id_randomly_generated() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A placeholder Message-ID for messages that arrived without one.
pub fn generated_message_id() -> String {
    format!("{}{}", GENERATED_PREFIX, id_randomly_generated())
}

/// Whether a Message-ID was generated locally rather than taken from the
/// message headers.
pub fn is_generated_message_id(header_message_id: &str) -> bool {
    header_message_id.starts_with(GENERATED_PREFIX)
}

/// Normalized contact key for an email address. Returns an empty string for
/// addresses that cannot identify a contact; callers must drop those.
pub fn contact_key_for_email(email: &str) -> String {
    let key = email.trim().trim_matches(|c| c == '<' || c == '>').to_lowercase();
    if key.is_empty() || !key.contains('@') || key.contains(char::is_whitespace) {
        return String::new();
    }
    key
}

/// `?,?,?` placeholder list for SQL IN clauses.
pub fn qmarks(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Truncates to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Flattens HTML to plain text for snippets and search indexing: drops tags,
/// script/style contents, decodes the common entities and collapses
/// whitespace.
pub fn flatten_html(html: &str) -> String {
    fn starts_ignore_case(text: &str, prefix: &str) -> bool {
        text.len() >= prefix.len()
            && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }

    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices().peekable();
    let mut skip_until: Option<&str> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(end_tag) = skip_until {
            if c == '<' && starts_ignore_case(&html[i..], end_tag) {
                skip_until = None;
                for (_, c) in chars.by_ref() {
                    if c == '>' {
                        break;
                    }
                }
            }
            continue;
        }
        match c {
            '<' => {
                if starts_ignore_case(&html[i..], "<script") {
                    skip_until = Some("</script");
                } else if starts_ignore_case(&html[i..], "<style") {
                    skip_until = Some("</style");
                } else {
                    for (_, c) in chars.by_ref() {
                        if c == '>' {
                            break;
                        }
                    }
                    out.push(' ');
                }
            }
            '&' => {
                let rest = &html[i..];
                let (entity, replacement) = if starts_ignore_case(rest, "&nbsp;") {
                    ("&nbsp;", " ")
                } else if starts_ignore_case(rest, "&amp;") {
                    ("&amp;", "&")
                } else if starts_ignore_case(rest, "&lt;") {
                    ("&lt;", "<")
                } else if starts_ignore_case(rest, "&gt;") {
                    ("&gt;", ">")
                } else if starts_ignore_case(rest, "&quot;") {
                    ("&quot;", "\"")
                } else if rest.starts_with("&#39;") {
                    ("&#39;", "'")
                } else {
                    ("&", "&")
                };
                out.push_str(replacement);
                for _ in 0..entity.len().saturating_sub(1) {
                    chars.next();
                }
            }
            c => out.push(c),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_for_parts_is_stable() {
        let a = id_for_parts(&["acc", "path", "mid"]);
        let b = id_for_parts(&["acc", "path", "mid"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert_ne!(a, id_for_parts(&["acc", "pathmid", ""]));
    }

    #[test]
    fn test_contact_key() {
        assert_eq!(contact_key_for_email(" Bob@Example.COM "), "bob@example.com");
        assert_eq!(contact_key_for_email("<a@b.c>"), "a@b.c");
        assert_eq!(contact_key_for_email("not-an-address"), "");
        assert_eq!(contact_key_for_email("two words@x.y"), "");
        assert_eq!(contact_key_for_email(""), "");
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_flatten_html() {
        let html = "<html><style>p {color: red}</style><p>Hello &amp; \n <b>world</b></p></html>";
        assert_eq!(flatten_html(html), "Hello & world");
        assert_eq!(flatten_html("a<script>var x = '<p>';</script>b"), "a b");
    }

    #[test]
    fn test_qmarks() {
        assert_eq!(qmarks(3), "?,?,?");
        assert_eq!(qmarks(1), "?");
    }
}
