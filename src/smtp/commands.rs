//! Implementation of SMTP commands

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

/// Handles SMTP commands and returns appropriate responses
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str) -> Self {
        Self { hostname }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();

        match cmd.as_str() {
            "HELO" => self.handle_helo(&parts, session),
            "EHLO" => self.handle_ehlo(&parts, session),
            "MAIL" => self.handle_mail(&parts, session),
            "RCPT" => self.handle_rcpt(&parts, session),
            "DATA" => self.handle_data(&parts, session),
            "RSET" => self.handle_rset(session),
            "NOOP" => Ok(SmtpResponse::ok()),
            "QUIT" => Ok(SmtpResponse::quit()),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    fn handle_helo(
        &self,
        parts: &[&str],
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = Self::client_domain(parts, "HELO")?;
        session.set_client_domain(client_domain.clone())?;

        Ok(SmtpResponse::helo(self.hostname, &client_domain))
    }

    fn handle_ehlo(
        &self,
        parts: &[&str],
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = Self::client_domain(parts, "EHLO")?;
        session.set_client_domain(client_domain.clone())?;

        Ok(SmtpResponse::ehlo(self.hostname, &client_domain))
    }

    fn client_domain(parts: &[&str], verb: &str) -> Result<String, SmtpError> {
        match parts {
            [_, domain] => Ok((*domain).to_string()),
            _ => Err(SmtpError::InvalidSyntax(format!(
                "{verb} requires a single domain argument"
            ))),
        }
    }

    /// Handle MAIL command. Any sender is accepted, including `<>`.
    fn handle_mail(
        &self,
        parts: &[&str],
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        let addr = Self::extract_path(parts, "FROM:", "MAIL command must be 'MAIL FROM:<address>'")?;
        session.set_sender(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command. Any non-empty recipient is accepted.
    fn handle_rcpt(
        &self,
        parts: &[&str],
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        let addr = Self::extract_path(parts, "TO:", "RCPT command must be 'RCPT TO:<address>'")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        session.add_recipient(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Pull the `<path>` out of `MAIL FROM:<path> [params]` or
    /// `RCPT TO:<path> [params]`. Parameters are ignored.
    fn extract_path(parts: &[&str], keyword: &str, usage: &str) -> Result<String, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(usage.to_string()));
        }

        let argument = parts[1..].join(" ");
        let prefix = argument.get(..keyword.len()).unwrap_or_default();
        if !prefix.eq_ignore_ascii_case(keyword) {
            return Err(SmtpError::InvalidSyntax(usage.to_string()));
        }

        let rest = argument[keyword.len()..].trim_start();
        let Some(rest) = rest.strip_prefix('<') else {
            return Err(SmtpError::InvalidSyntax(
                "address must be enclosed in angle brackets".to_string(),
            ));
        };
        let Some(end) = rest.find('>') else {
            return Err(SmtpError::InvalidSyntax(
                "address must be enclosed in angle brackets".to_string(),
            ));
        };

        let addr = &rest[..end];
        if addr.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        Ok(addr.to_string())
    }

    fn handle_data(
        &self,
        parts: &[&str],
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.start_data_mode()?;

        Ok(SmtpResponse::data_start())
    }

    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RSET") {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        session.reset();
        Ok(SmtpResponse::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_handler<'a>() -> SmtpCommandHandler<'a> {
        SmtpCommandHandler::new("test.local")
    }

    fn new_session() -> SmtpSession {
        SmtpSession::new("127.0.0.1:40000".parse().unwrap())
    }

    fn greeted_session(handler: &SmtpCommandHandler) -> SmtpSession {
        let mut session = new_session();
        handler
            .process_command("HELO client.local", &mut session)
            .unwrap();
        session
    }

    #[test]
    fn test_helo_command() {
        let handler = create_handler();
        let mut session = new_session();

        let response = handler
            .process_command("HELO client.local", &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(response.message, "test.local Hello client.local");
        assert_eq!(session.client_domain, Some("client.local".to_string()));
    }

    #[test]
    fn test_ehlo_command() {
        let handler = create_handler();
        let mut session = new_session();

        let response = handler
            .process_command("ehlo [127.0.0.1]", &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert!(response.multiline.is_some());
        assert_eq!(session.client_domain, Some("[127.0.0.1]".to_string()));
    }

    #[test]
    fn test_helo_missing_domain() {
        let handler = create_handler();
        let mut session = new_session();

        let result = handler.process_command("HELO", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_mail_command() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);

        let response = handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.from, Some("sender@example.com".to_string()));
    }

    #[test]
    fn test_mail_accepts_anything_bracketed() {
        let handler = create_handler();

        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<>", &mut session)
            .unwrap();
        assert_eq!(session.from, Some(String::new()));

        let mut session = greeted_session(&handler);
        handler
            .process_command("mail from: <postmaster>", &mut session)
            .unwrap();
        assert_eq!(session.from, Some("postmaster".to_string()));
    }

    #[test]
    fn test_mail_ignores_parameters() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);

        handler
            .process_command("MAIL FROM:<a@x.com> BODY=8BITMIME SIZE=120", &mut session)
            .unwrap();
        assert_eq!(session.from, Some("a@x.com".to_string()));
    }

    #[test]
    fn test_mail_without_helo() {
        let handler = create_handler();
        let mut session = new_session();

        let result = handler.process_command("MAIL FROM:<sender@example.com>", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_mail_invalid_syntax() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);

        let result = handler.process_command("MAIL sender@example.com", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));

        let result = handler.process_command("MAIL FROM:sender@example.com", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));

        let result = handler.process_command("MAIL FROM:<sender@example.com", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_mail_path_too_long() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);

        let long_path = "a".repeat(SmtpLimits::PATH_MAX_LENGTH + 1);
        let result = handler.process_command(&format!("MAIL FROM:<{long_path}>"), &mut session);
        assert!(matches!(result, Err(SmtpError::PathTooLong { .. })));
    }

    #[test]
    fn test_rcpt_command() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();

        let response = handler
            .process_command("RCPT TO:<recipient@example.com>", &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.to, vec!["recipient@example.com".to_string()]);
    }

    #[test]
    fn test_rcpt_without_mail() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);

        let result = handler.process_command("RCPT TO:<recipient@example.com>", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_empty_recipient() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();

        let result = handler.process_command("RCPT TO:<>", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_data_command() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<recipient@example.com>", &mut session)
            .unwrap();

        let response = handler.process_command("DATA", &mut session).unwrap();

        assert_eq!(response.code, "354");
        assert!(session.in_data_mode);
    }

    #[test]
    fn test_data_without_rcpt() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();

        let result = handler.process_command("DATA", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_rset_command() {
        let handler = create_handler();
        let mut session = greeted_session(&handler);
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<recipient@example.com>", &mut session)
            .unwrap();

        let response = handler.process_command("RSET", &mut session).unwrap();

        assert_eq!(response.code, "250");
        assert!(session.from.is_none());
        assert!(session.to.is_empty());
    }

    #[test]
    fn test_noop_and_quit() {
        let handler = create_handler();
        let mut session = new_session();

        let response = handler.process_command("NOOP", &mut session).unwrap();
        assert_eq!(response.code, "250");

        let response = handler.process_command("QUIT", &mut session).unwrap();
        assert_eq!(response.code, "221");
    }

    #[test]
    fn test_invalid_command() {
        let handler = create_handler();
        let mut session = new_session();

        let result = handler.process_command("VRFY someone", &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidCommand)));
    }

    #[test]
    fn test_command_line_too_long() {
        let handler = create_handler();
        let mut session = new_session();

        let long_command = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
        let result = handler.process_command(&long_command, &mut session);
        assert!(matches!(result, Err(SmtpError::LineTooLong { .. })));
    }
}
