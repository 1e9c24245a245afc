//! Forwarding of captured messages to the operator's mailbox

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use lettre::message::header::{ContentTransferEncoding, ContentType, ContentTypeErr};
use lettre::message::{Attachment, Body, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::info;

/// Separator between addresses in the configured `To` value
pub const RECIPIENT_SEPARATOR: &str = " ,";

/// File name the captured message is attached under
pub const ATTACHMENT_NAME: &str = "cuckoo.eml";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How the connection to the relay server is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// TLS from the first byte (SMTPS)
    #[default]
    Tls,
    /// Plain connection upgraded with STARTTLS, which must be offered
    StartTls,
    /// No encryption; only meant for relays on a trusted local network
    None,
}

impl Security {
    pub fn default_port(self) -> u16 {
        match self {
            Security::Tls => 465,
            Security::StartTls => 587,
            Security::None => 25,
        }
    }
}

impl FromStr for Security {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Security::Tls),
            "starttls" => Ok(Security::StartTls),
            "none" | "plain" => Ok(Security::None),
            other => Err(format!("unknown security mode '{other}'")),
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Security::Tls => "tls",
            Security::StartTls => "starttls",
            Security::None => "none",
        })
    }
}

/// Where and how captured messages are relayed
#[derive(Clone, PartialEq)]
pub struct RelayConfig {
    pub server: String,
    pub port: u16,
    /// Login user; no authentication is attempted when unset
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// Recipients as configured, separated by [`RECIPIENT_SEPARATOR`]
    pub to: String,
    pub security: Security,
    pub timeout: Duration,
}

impl RelayConfig {
    pub fn recipients(&self) -> Vec<&str> {
        split_recipients(&self.to)
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("to", &self.to)
            .field("security", &self.security)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Split a configured recipient list.
///
/// Only the exact sequence `" ,"` separates addresses, so
/// `"a@x.com,b@y.com"` stays a single (invalid) recipient.
pub fn split_recipients(to: &str) -> Vec<&str> {
    to.split(RECIPIENT_SEPARATOR)
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .collect()
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid address '{address}': {source}")]
    Address {
        address: String,
        source: lettre::address::AddressError,
    },

    #[error("no recipients configured")]
    NoRecipients,

    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("invalid content type: {0}")]
    ContentType(#[from] ContentTypeErr),

    #[error("failed to encode attachment")]
    Encoding,

    #[error("SMTP error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

impl RelayError {
    /// Short category used in log output
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Address { .. } | RelayError::NoRecipients => "address",
            RelayError::Message(_) | RelayError::ContentType(_) | RelayError::Encoding => {
                "message"
            }
            RelayError::Transport(e) if e.is_timeout() => "timeout",
            RelayError::Transport(e) if e.is_permanent() => "rejected",
            RelayError::Transport(e) if e.is_transient() => "transient",
            RelayError::Transport(_) => "connection",
        }
    }
}

/// Submits captured messages to the configured relay server
pub struct Relay {
    config: RelayConfig,
    transport: SmtpTransport,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let builder = match config.security {
            Security::Tls => {
                install_crypto_provider();
                SmtpTransport::relay(&config.server)?
            }
            Security::StartTls => {
                install_crypto_provider();
                SmtpTransport::starttls_relay(&config.server)?
            }
            Security::None => SmtpTransport::builder_dangerous(&config.server),
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if let Some(user) = &config.user {
            let password = config.password.clone().unwrap_or_default();
            builder = builder.credentials(Credentials::new(user.clone(), password));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Wrap `body` into a new message addressed to the configured mailbox
    pub fn build_message(&self, body: &[u8], now: DateTime<Local>) -> Result<Message, RelayError> {
        let recipients = self.config.recipients();
        if recipients.is_empty() {
            return Err(RelayError::NoRecipients);
        }

        let mut builder = Message::builder()
            .from(parse_mailbox(&self.config.from)?)
            .subject(format!(
                "Email from smtp sinkhole: {}",
                now.format("%Y-%m-%d %H:%M:%S")
            ));
        for recipient in recipients {
            builder = builder.to(parse_mailbox(recipient)?);
        }

        let content = Body::new_with_encoding(body.to_vec(), ContentTransferEncoding::Base64)
            .map_err(|_| RelayError::Encoding)?;
        let attachment = Attachment::new(ATTACHMENT_NAME.to_string())
            .body(content, ContentType::parse("application/octet-stream")?);

        Ok(builder.multipart(MultiPart::mixed().singlepart(attachment))?)
    }

    /// Send a copy of `body` to the relay
    pub fn forward(&self, body: &[u8]) -> Result<(), RelayError> {
        let message = self.build_message(body, Local::now())?;
        self.transport.send(&message)?;
        info!(
            server = %self.config.server,
            to = %self.config.to,
            "Message forwarded"
        );
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, RelayError> {
    address.parse().map_err(|source| RelayError::Address {
        address: address.to_string(),
        source,
    })
}

/// rustls needs a process-wide crypto provider before any TLS config is built
pub fn install_crypto_provider() {
    // Already installed is fine
    let _ = rustls::crypto::ring::default_provider().install_default();
}
