//! # SMTP sending.
//!
//! Thin layer over lettre's async transport. A transport is built on demand
//! when a SendDraft task reaches its remote phase; nothing is kept open.

use anyhow::{Context as _, Result};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::account::{Account, Security};
use crate::error::SyncError;
use crate::message::{Message, Participant};

pub type SmtpTransport = AsyncSmtpTransport<Tokio1Executor>;

/// Builds the transport for the account's SMTP settings.
pub fn transport(account: &Account) -> Result<SmtpTransport> {
    let settings = &account.settings;
    let host = settings.smtp_host.as_str();

    let tls_parameters = {
        let mut builder = TlsParameters::builder(host.to_string());
        if settings.smtp_allow_insecure_ssl {
            builder = builder
                .dangerous_accept_invalid_certs(true)
                .dangerous_accept_invalid_hostnames(true);
        }
        builder.build()?
    };

    let mut builder = SmtpTransport::builder_dangerous(host).port(settings.smtp_port);
    builder = match settings.smtp_security {
        Security::Ssl => builder.tls(Tls::Wrapper(tls_parameters)),
        Security::Starttls => builder.tls(Tls::Required(tls_parameters)),
        Security::None => builder,
    };

    builder = if let Some(token) = &settings.refresh_token {
        builder
            .credentials(Credentials::new(
                settings.smtp_username.clone(),
                token.clone(),
            ))
            .authentication(vec![Mechanism::Xoauth2])
    } else {
        builder.credentials(Credentials::new(
            settings.smtp_username.clone(),
            settings.smtp_password.clone(),
        ))
    };

    Ok(builder.build())
}

fn mailbox(participant: &Participant) -> Result<Mailbox> {
    let formatted = if participant.name.is_empty() {
        participant.email.clone()
    } else {
        format!("{} <{}>", participant.name, participant.email)
    };
    formatted
        .parse()
        .with_context(|| format!("invalid address {:?}", participant.email))
}

/// Renders a draft message into RFC 822 bytes, ready for sending or
/// appending to the drafts mailbox.
pub fn build_mime(account: &Account, message: &Message, body_html: &str) -> Result<Vec<u8>> {
    let mut builder = lettre::Message::builder()
        .from(mailbox(&Participant {
            name: String::new(),
            email: account.email_address.clone(),
        })?)
        .subject(message.subject.clone())
        .message_id(Some(format!("<{}>", message.header_message_id)));

    for participant in &message.to {
        builder = builder.to(mailbox(participant)?);
    }
    for participant in &message.cc {
        builder = builder.cc(mailbox(participant)?);
    }
    for participant in &message.bcc {
        builder = builder.bcc(mailbox(participant)?);
    }

    let mime = builder
        .singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(body_html.to_string()),
        )
        .context("could not build MIME message")?;
    Ok(mime.formatted())
}

/// Sends the rendered draft. Transient SMTP failures are surfaced as
/// retryable so the task stays queued.
pub async fn send(account: &Account, message: &Message, body_html: &str) -> Result<()> {
    let mime = build_mime(account, message, body_html)?;
    let envelope = lettre::address::Envelope::new(
        Some(account.email_address.parse()?),
        message
            .to
            .iter()
            .chain(&message.cc)
            .chain(&message.bcc)
            .map(|p| p.email.parse())
            .collect::<std::result::Result<Vec<_>, _>>()?,
    )?;

    let transport = transport(account)?;
    transport
        .send_raw(&envelope, &mime)
        .await
        .map_err(|err| -> anyhow::Error {
            if err.is_transient() {
                SyncError::Retryable(format!("SMTP transient failure: {err}")).into()
            } else {
                anyhow::Error::new(err).context("SMTP send failed")
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FolderRef;

    fn draft() -> Message {
        Message {
            id: "d1".into(),
            account_id: "a1".into(),
            version: 1,
            thread_id: "t1".into(),
            header_message_id: "d1@mailsync".into(),
            gmail_message_id: None,
            gmail_thread_id: None,
            subject: "Hello".into(),
            snippet: String::new(),
            date: 0,
            unread: false,
            starred: false,
            draft: true,
            remote_uid: 0,
            remote_folder: FolderRef::default(),
            client_folder: None,
            remote_xgm_labels: vec![],
            synced_at: 0,
            to: vec![Participant { name: "Bob".into(), email: "bob@example.com".into() }],
            from: vec![],
            cc: vec![],
            bcc: vec![],
            files: vec![],
        }
    }

    #[test]
    fn test_build_mime() {
        let account = Account {
            id: "a1".into(),
            email_address: "alice@example.com".into(),
            ..Default::default()
        };
        let mime = build_mime(&account, &draft(), "<p>Hi</p>").unwrap();
        let text = String::from_utf8_lossy(&mime);
        assert!(text.contains("bob@example.com"));
        assert!(text.contains("Subject: Hello"));
        assert!(text.contains("Message-ID: <d1@mailsync>"));
        assert!(text.contains("<p>Hi</p>"));
    }
}
