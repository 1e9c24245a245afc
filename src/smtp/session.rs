//! SMTP session state management

use std::net::SocketAddr;

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::transaction::MailTransaction;

/// Represents the current state of an SMTP session
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO
    Initial,
    /// HELO received - ready for MAIL command
    GreetingReceived,
    /// MAIL FROM received - ready for RCPT commands
    MailReceived,
    /// At least one RCPT TO received - ready for DATA or more RCPT commands
    RecipientsReceived,
    /// DATA command received - collecting message data
    DataMode,
}

/// Manages the state and data for a single SMTP session
#[derive(Debug)]
pub struct SmtpSession {
    /// Address of the connected client
    pub peer: SocketAddr,
    /// Current state of the session
    pub state: SmtpState,
    /// Sender address from MAIL FROM command
    pub from: Option<String>,
    /// List of recipients from RCPT TO commands
    pub to: Vec<String>,
    /// Message data collected during DATA mode
    pub data: Vec<u8>,
    /// Whether we're currently in data collection mode
    pub in_data_mode: bool,
    /// Set once the message outgrows `MAX_DATA_SIZE`; the rest is discarded
    pub data_overflow: bool,
    /// Client domain from HELO command
    pub client_domain: Option<String>,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: SmtpState::Initial,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            in_data_mode: false,
            data_overflow: false,
            client_domain: None,
        }
    }

    /// Reset the session to post-HELO state (clears transaction data)
    pub fn reset(&mut self) {
        self.state = SmtpState::GreetingReceived;
        self.from = None;
        self.to.clear();
        self.data = Vec::new();
        self.in_data_mode = false;
        self.data_overflow = false;
        // Keep client_domain as it's set by HELO
    }

    /// Set the sender address
    pub fn set_sender(&mut self, sender: String) -> Result<(), SmtpError> {
        if sender.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.from = Some(sender);
        self.to.clear();
        self.data.clear();
        self.state = SmtpState::MailReceived;
        Ok(())
    }

    /// Add a recipient address
    pub fn add_recipient(&mut self, recipient: String) -> Result<(), SmtpError> {
        if recipient.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        if self.to.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        self.to.push(recipient);
        self.state = SmtpState::RecipientsReceived;
        Ok(())
    }

    /// Start data collection mode
    pub fn start_data_mode(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsReceived {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        self.in_data_mode = true;
        self.data.clear();
        self.data_overflow = false;
        self.state = SmtpState::DataMode;
        Ok(())
    }

    /// Add one line of message data, without its line terminator and with
    /// transparency dots already removed.
    ///
    /// Lines past the size limit are dropped; the error surfaces when the
    /// data phase ends.
    pub fn add_data_line(&mut self, line: &[u8]) {
        if self.data_overflow {
            return;
        }

        let separator = usize::from(!self.data.is_empty());
        if self.data.len() + separator + line.len() > SmtpLimits::MAX_DATA_SIZE {
            self.mark_data_overflow();
            return;
        }

        if separator == 1 {
            self.data.push(b'\n');
        }
        self.data.extend_from_slice(line);
    }

    /// Drop the collected data and reject the message once it completes
    pub fn mark_data_overflow(&mut self) {
        self.data_overflow = true;
        self.data = Vec::new();
    }

    /// Finish data collection and build the transaction
    pub fn finish_data_collection(&mut self) -> Result<MailTransaction, SmtpError> {
        if !self.in_data_mode {
            return Err(SmtpError::InvalidState(
                "Not in data collection mode".to_string(),
            ));
        }

        self.in_data_mode = false;
        self.state = SmtpState::GreetingReceived;

        if self.data_overflow {
            return Err(SmtpError::TooMuchData {
                max: SmtpLimits::MAX_DATA_SIZE,
            });
        }

        let from = self
            .from
            .take()
            .ok_or_else(|| SmtpError::InvalidState("No sender specified".to_string()))?;

        if self.to.is_empty() {
            return Err(SmtpError::InvalidState(
                "No recipients specified".to_string(),
            ));
        }

        Ok(MailTransaction::new(
            self.peer,
            from,
            std::mem::take(&mut self.to),
            std::mem::take(&mut self.data),
        ))
    }

    /// Set the client domain from HELO/EHLO command
    pub fn set_client_domain(&mut self, domain: String) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain);
        self.reset(); // Clear any existing transaction
        Ok(())
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            "HELO" | "EHLO" => true, // Can be sent at any time
            "MAIL" => self.state == SmtpState::GreetingReceived,
            "RCPT" => {
                self.state == SmtpState::MailReceived || self.state == SmtpState::RecipientsReceived
            }
            "DATA" => self.state == SmtpState::RecipientsReceived,
            "RSET" => self.state != SmtpState::Initial,
            "NOOP" => true, // NOOP can be sent at any time
            "QUIT" => true, // QUIT can be sent at any time
            _ => false,
        }
    }
}
