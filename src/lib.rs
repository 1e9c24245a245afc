//! # smtp-sinkhole
//!
//! An SMTP listener that accepts any mail submitted to it and keeps it from
//! going anywhere else. Point a sandboxed or untrusted environment at it to
//! capture the mail it tries to send.
//!
//! Every accepted message goes through an [`IntakePipeline`]. The stock
//! [`SinkPipeline`] can:
//!
//! - write the raw message to its own file in a directory
//!   (`YYYYMMDDHHMMSS` plus a counter), and
//! - relay a copy, attached as `cuckoo.eml`, to a fixed mailbox over an
//!   authenticated and encrypted SMTP connection.
//!
//! Both steps are best-effort. Their failures are logged and never reach the
//! client, which always gets a normal `250` once its message is in.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smtp_sinkhole::{MailStore, SinkPipeline, SmtpServer};
//! use std::sync::Arc;
//!
//! let pipeline = SinkPipeline::new(Some(MailStore::new("/tmp/sink")), None);
//! let server = SmtpServer::new("sinkhole.local", Arc::new(pipeline));
//!
//! server.start("127.0.0.1:1025").unwrap();
//! ```
//!
//! Any `std::sync::mpsc::Sender<MailTransaction>` is also a pipeline, which
//! is the easiest way to look at captured mail from a test.
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the sender
//! - `MAIL FROM` - Specify the sender's address (anything, including `<>`)
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the message
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! ## Notes
//!
//! - There is no authentication and no TLS on the listening side.
//! - Nothing is queued or retried; a relay failure only shows up in the log.
//! - Input is bounded: 512 byte command lines, 256 byte paths, 100
//!   recipients and 32 MiB per message.

pub mod config;
pub mod intake;
mod smtp;
mod transaction;

pub use config::{ConfigError, SinkConfig};
pub use intake::{IntakePipeline, MailStore, Relay, RelayConfig, RelayError, Security, SinkPipeline};
pub use smtp::{
    ShutdownHandle, SmtpError, SmtpLimits, SmtpResponse, SmtpServer, SmtpSession, SmtpState,
};
pub use transaction::MailTransaction;
