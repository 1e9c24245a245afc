//! The unit of work handed from the listener to the intake pipeline

use std::net::SocketAddr;

use chrono::{DateTime, Local};

/// One completed SMTP mail transaction
#[derive(Debug, Clone)]
pub struct MailTransaction {
    /// Address of the client that submitted the message
    pub peer: SocketAddr,

    /// Envelope sender; empty for the null reverse-path `<>`
    pub mail_from: String,

    /// Envelope recipients in the order they were given
    pub recipients: Vec<String>,

    /// Message content as received, lines joined with `\n`
    pub body: Vec<u8>,

    /// When the DATA phase completed
    pub received_at: DateTime<Local>,
}

impl MailTransaction {
    pub fn new(peer: SocketAddr, mail_from: String, recipients: Vec<String>, body: Vec<u8>) -> Self {
        Self {
            peer,
            mail_from,
            recipients,
            body,
            received_at: Local::now(),
        }
    }

    /// Check if this transaction was addressed to a specific recipient
    pub fn has_recipient(&self, recipient: &str) -> bool {
        self.recipients.iter().any(|addr| addr == recipient)
    }

    /// Size of the message body in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// The `Subject` header of the message, if there is one
    pub fn subject(&self) -> Option<String> {
        for line in self.body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                // End of headers
                break;
            }
            if line.len() > 8 && line[..8].eq_ignore_ascii_case(b"subject:") {
                return Some(String::from_utf8_lossy(&line[8..]).trim().to_string());
            }
        }
        None
    }
}
