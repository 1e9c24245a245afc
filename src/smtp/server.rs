//! SMTP listener: accepts connections and hands each completed transaction
//! to an [`IntakePipeline`].

use crate::intake::IntakePipeline;
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// How long a client may stay silent before its connection is dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often the accept loop checks for shutdown while no client is connecting
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SMTP listener that passes every accepted message to an intake pipeline
#[derive(Clone)]
pub struct SmtpServer {
    /// Server hostname
    hostname: String,
    pipeline: Arc<dyn IntakePipeline>,
    shutdown: ShutdownHandle,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(hostname: &str, pipeline: Arc<dyn IntakePipeline>) -> Self {
        Self {
            hostname: hostname.to_owned(),
            pipeline,
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Handle used to stop a running server from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bind to `addr` and serve until shut down (blocking)
    pub fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener)
    }

    /// Serve on an existing listener until shut down (blocking)
    ///
    /// Returns once the accept loop has stopped and every transaction that was
    /// inside the pipeline at that point has finished.
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!(addr = %local_addr, "SMTP sinkhole listening");

        while !self.shutdown.is_shutdown() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("smtp-{peer}"))
                        .spawn(move || server.serve_connection(stream, peer));
                    if let Err(e) = spawned {
                        warn!(%peer, error = %e, "Failed to spawn connection thread");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "Error accepting connection");
                }
            }
        }

        info!(addr = %local_addr, "Stopped accepting connections");
        self.shutdown.wait_for_in_flight();
        Ok(())
    }

    fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Connection accepted");
        match self.handle_client(stream, peer) {
            Ok(()) => debug!(%peer, "Connection closed"),
            Err(e) => warn!(%peer, error = %e, "Error handling client"),
        }
    }

    /// Handle a client connection
    fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), SmtpError> {
        // Accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(IDLE_TIMEOUT))?;

        let command_handler = SmtpCommandHandler::new(&self.hostname);
        let mut session = SmtpSession::new(peer);
        let mut reader = BufReader::new(stream.try_clone()?);

        self.send_response(&mut stream, &SmtpResponse::greeting(&self.hostname))?;

        let mut line = Vec::new();
        // Data line being assembled; only CRLF ends one
        let mut pending = Vec::new();
        loop {
            let limit = if session.in_data_mode {
                SmtpLimits::MAX_DATA_SIZE
            } else {
                SmtpLimits::COMMAND_LINE_MAX_LENGTH
            };

            let read = match read_line_limited(&mut reader, &mut line, limit) {
                Ok(read) => read,
                Err(e) if is_timeout(&e) => {
                    debug!(%peer, "Client idle for too long");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            if session.in_data_mode {
                match read {
                    // A transaction cut off mid-DATA is discarded
                    LineRead::Eof => break,
                    LineRead::TooLong => {
                        pending.clear();
                        session.mark_data_overflow();
                    }
                    LineRead::Line { crlf: false } => {
                        // A bare LF is message content
                        pending.extend_from_slice(&line);
                        pending.push(b'\n');
                        if pending.len() > SmtpLimits::MAX_DATA_SIZE {
                            pending.clear();
                            session.mark_data_overflow();
                        }
                    }
                    LineRead::Line { crlf: true } => {
                        pending.extend_from_slice(&line);
                        if pending == b"." {
                            let response = self.finish_data(&mut session);
                            self.send_response(&mut stream, &response)?;
                            if response.code == "421" {
                                break;
                            }
                        } else {
                            // Undo dot-stuffing
                            let content = pending.strip_prefix(b".").unwrap_or(&pending[..]);
                            session.add_data_line(content);
                        }
                        pending.clear();
                    }
                }
                continue;
            }

            let command = match read {
                LineRead::Eof => break,
                LineRead::TooLong => {
                    let e = SmtpError::LineTooLong {
                        max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
                    };
                    let response = SmtpResponse::error(e.to_response_code(), &e.to_response_message());
                    self.send_response(&mut stream, &response)?;
                    continue;
                }
                LineRead::Line { .. } => String::from_utf8_lossy(&line).into_owned(),
            };

            let command = command.trim();
            if command.is_empty() {
                continue;
            }

            if self.shutdown.is_shutdown() {
                self.send_response(&mut stream, &SmtpResponse::shutting_down(&self.hostname))?;
                break;
            }

            debug!(%peer, command, "Command received");
            match command_handler.process_command(command, &mut session) {
                Ok(response) => {
                    self.send_response(&mut stream, &response)?;
                    if response.code == "221" {
                        break; // QUIT command
                    }
                }
                Err(e) => {
                    let response =
                        SmtpResponse::error(e.to_response_code(), &e.to_response_message());
                    self.send_response(&mut stream, &response)?;
                }
            }
        }

        Ok(())
    }

    /// Complete the DATA phase: deliver the transaction, then build the reply
    fn finish_data(&self, session: &mut SmtpSession) -> SmtpResponse {
        let result = session.finish_data_collection();
        session.reset();

        match result {
            Ok(transaction) => {
                info!(
                    peer = %transaction.peer,
                    from = %transaction.mail_from,
                    recipients = ?transaction.recipients,
                    subject = %transaction.subject().unwrap_or_default(),
                    size = transaction.size(),
                    "Message received"
                );
                // Nothing enters the pipeline once shutdown has begun
                let Some(_in_flight) = self.shutdown.enter() else {
                    warn!(peer = %transaction.peer, "Shutting down, message not accepted");
                    return SmtpResponse::shutting_down(&self.hostname);
                };
                self.pipeline.handle(transaction);
                SmtpResponse::ok()
            }
            Err(e) => {
                warn!(peer = %session.peer, error = %e, "Message rejected");
                SmtpResponse::error(e.to_response_code(), &e.to_response_message())
            }
        }
    }

    /// Send a response to the client
    fn send_response(
        &self,
        stream: &mut TcpStream,
        response: &SmtpResponse,
    ) -> Result<(), SmtpError> {
        // Ensure response doesn't exceed maximum line length
        let formatted = response.format();
        if formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
            let truncated_response =
                SmtpResponse::new(&response.code, "Response too long (truncated)");
            stream.write_all(truncated_response.format().as_bytes())?;
        } else {
            stream.write_all(formatted.as_bytes())?;
        }
        stream.flush()?;
        Ok(())
    }
}

/// Stops a running [`SmtpServer`] and tracks transactions still being handled
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    state: Mutex<ShutdownState>,
    drained: Condvar,
}

#[derive(Debug, Default)]
struct ShutdownState {
    stopped: bool,
    in_flight: usize,
}

impl ShutdownHandle {
    /// Ask the server to stop accepting connections and new transactions
    pub fn shutdown(&self) {
        self.lock().stopped = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().stopped
    }

    /// Number of transactions currently inside the pipeline
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    fn lock(&self) -> MutexGuard<'_, ShutdownState> {
        // The counters stay consistent even if a holder panicked
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a transaction entering the pipeline; `None` once stopped
    fn enter(&self) -> Option<InFlightGuard> {
        let mut state = self.lock();
        if state.stopped {
            return None;
        }
        state.in_flight += 1;
        Some(InFlightGuard {
            handle: self.clone(),
        })
    }

    fn wait_for_in_flight(&self) {
        let mut state = self.lock();
        while state.in_flight > 0 {
            state = self
                .inner
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct InFlightGuard {
    handle: ShutdownHandle,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.handle.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.handle.inner.drained.notify_all();
        }
    }
}

#[derive(Debug, PartialEq)]
enum LineRead {
    /// A full line, terminator stripped; `crlf` is false for a bare LF
    Line { crlf: bool },
    /// The line exceeded the limit; the rest of it was discarded
    TooLong,
    /// The peer closed the connection
    Eof,
}

/// Read one line of at most `limit` bytes into `buf`, without its CRLF or LF.
fn read_line_limited<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    buf.clear();
    let read = reader.by_ref().take(limit as u64).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        let crlf = buf.ends_with(b"\r");
        if crlf {
            buf.pop();
        }
        return Ok(LineRead::Line { crlf });
    }

    if read < limit {
        // Connection closed before the terminator
        return Ok(LineRead::Eof);
    }

    let mut discard = Vec::new();
    loop {
        discard.clear();
        let n = reader
            .by_ref()
            .take(limit as u64)
            .read_until(b'\n', &mut discard)?;
        if n == 0 || discard.ends_with(b"\n") {
            break;
        }
    }
    buf.clear();
    Ok(LineRead::TooLong)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
