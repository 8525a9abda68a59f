//! IMAP connection establishment: TCP, TLS or STARTTLS, then LOGIN or
//! XOAUTH2.

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsStream};

use crate::account::{AccountSettings, Security};

/// Wrapper unifying TLS and plain streams so the session can be one concrete
/// type.
pub(crate) enum ImapStream {
    Tls(Box<TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl tokio::io::AsyncRead for ImapStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ImapStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

/// XOAUTH2 authenticator: "user=" {user} "\x01auth=Bearer " {token} "\x01\x01".
pub(crate) struct XOAuth2 {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

fn tls_connector(allow_insecure: bool) -> Result<tokio_native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    if allow_insecure {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    Ok(tokio_native_tls::TlsConnector::from(builder.build()?))
}

/// Opens the transport-level stream for the configured IMAP server. For
/// STARTTLS the server greeting is consumed during the upgrade.
pub(crate) async fn connect_stream(settings: &AccountSettings) -> Result<ImapStream> {
    let host = settings.imap_host.as_str();
    let port = settings.imap_port;
    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("could not connect to {host}:{port}"))?;

    match settings.imap_security {
        Security::Ssl => {
            let tls = tls_connector(settings.imap_allow_insecure_ssl)?
                .connect(host, tcp)
                .await
                .with_context(|| format!("TLS handshake with {host} failed"))?;
            Ok(ImapStream::Tls(Box::new(tls)))
        }
        Security::Starttls => {
            let mut reader = BufReader::new(tcp);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if !line.starts_with("* OK") {
                bail!("unexpected IMAP greeting: {}", line.trim_end());
            }
            reader.get_mut().write_all(b"S1 STARTTLS\r\n").await?;
            line.clear();
            reader.read_line(&mut line).await?;
            if !line.starts_with("S1 OK") {
                bail!("server rejected STARTTLS: {}", line.trim_end());
            }
            let tcp = reader.into_inner();
            let tls = tls_connector(settings.imap_allow_insecure_ssl)?
                .connect(host, tcp)
                .await
                .with_context(|| format!("STARTTLS handshake with {host} failed"))?;
            Ok(ImapStream::Tls(Box::new(tls)))
        }
        Security::None => Ok(ImapStream::Plain(tcp)),
    }
}
