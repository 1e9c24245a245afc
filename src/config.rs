//! Startup configuration: command line and the relay configuration file.
//!
//! The relay settings live in a separate file so credentials never show up
//! in a process listing. The file uses confindent syntax:
//!
//! ```text
//! Email
//!     Server smtp.example.com
//!     Port 465
//!     User sinkhole@example.com
//!     Password hunter2
//!     From sinkhole@example.com
//!     To analyst@example.com ,soc@example.com
//!     Security tls
//!     Timeout 60
//! ```
//!
//! `Server`, `From` and `To` are required. `Port` defaults to the usual port
//! for `Security` (`tls`, `starttls` or `none`; `tls` when unset).

use std::path::{Path, PathBuf};
use std::time::Duration;

use confindent::Confindent;
use getopts::{Matches, Options};
use thiserror::Error;

use crate::intake::relay::{DEFAULT_TIMEOUT, RelayConfig, Security};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1025;
pub const DEFAULT_CONFIG_PATH: &str = "smtp_sinkhole.conf";

/// Section of the configuration file holding the relay settings
const RELAY_SECTION: &str = "Email";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Arguments(#[from] getopts::Fail),

    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),

    #[error("failed to parse '{value}' as {what}")]
    InvalidArgument { what: &'static str, value: String },

    #[error("failed to read config file {path}: {reason}")]
    File { path: PathBuf, reason: String },

    #[error("'{0}' section not found in config file")]
    MissingSection(&'static str),

    #[error("'{section}.{key}' not found in config file")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },

    #[error("invalid value '{value}' for '{section}.{key}'")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

/// Everything the sinkhole needs to start; built once, never changed
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Name the listener greets clients with
    pub hostname: String,
    /// Directory to dump messages into; persistence is off when unset
    pub mail_dir: Option<PathBuf>,
    pub forward: bool,
    /// Loaded only when forwarding is enabled
    pub relay: Option<RelayConfig>,
}

impl SinkConfig {
    /// Configuration with every optional feature off
    pub fn new(listen_host: &str, listen_port: u16) -> Self {
        Self {
            listen_host: listen_host.to_string(),
            listen_port,
            hostname: default_hostname(),
            mail_dir: None,
            forward: false,
            relay: None,
        }
    }

    pub fn listen_address(&self) -> (&str, u16) {
        (&self.listen_host, self.listen_port)
    }

    fn options() -> Options {
        let mut opts = Options::new();
        opts.optflag("h", "help", "Print this help message");
        opts.optopt("", "dir", "Directory used to dump emails", "DIR");
        opts.optflag(
            "",
            "forward",
            "Forward emails to the address in the config file",
        );
        opts.optopt(
            "c",
            "config",
            &format!("Relay config file used with --forward\nDefault: {DEFAULT_CONFIG_PATH}"),
            "PATH",
        );
        opts.optopt(
            "",
            "hostname",
            "Name to greet clients with\nDefault: this machine's host name",
            "NAME",
        );
        opts
    }

    pub fn usage(program: &str) -> String {
        let brief = format!("Usage: {program} [options] [host [port]]");
        Self::options().usage(&brief)
    }

    /// Parse command line arguments (without the program name).
    ///
    /// Returns `Ok(None)` when help was requested.
    pub fn from_args<I, S>(args: I) -> Result<Option<Self>, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let matches = Self::options().parse(args)?;
        if matches.opt_present("help") {
            return Ok(None);
        }

        Self::from_matches(&matches).map(Some)
    }

    fn from_matches(matches: &Matches) -> Result<Self, ConfigError> {
        let mut free = matches.free.iter();
        let listen_host = free
            .next()
            .cloned()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let listen_port = match free.next() {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidArgument {
                what: "a port",
                value: port.clone(),
            })?,
            None => DEFAULT_PORT,
        };
        if let Some(extra) = free.next() {
            return Err(ConfigError::UnexpectedArgument(extra.clone()));
        }

        let forward = matches.opt_present("forward");
        let relay = if forward {
            let path = matches
                .opt_str("config")
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
            Some(load_relay_config(Path::new(&path))?)
        } else {
            None
        };

        Ok(Self {
            listen_host,
            listen_port,
            hostname: matches.opt_str("hostname").unwrap_or_else(default_hostname),
            mail_dir: matches.opt_str("dir").map(PathBuf::from),
            forward,
            relay,
        })
    }
}

fn default_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Read the relay settings from a confindent file
pub fn load_relay_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let config = Confindent::from_file(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let section = config
        .child(RELAY_SECTION)
        .ok_or(ConfigError::MissingSection(RELAY_SECTION))?;

    let optional = |key: &'static str| -> Option<String> {
        section
            .child_value(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let required = |key: &'static str| -> Result<String, ConfigError> {
        optional(key).ok_or(ConfigError::MissingKey {
            section: RELAY_SECTION,
            key,
        })
    };
    let invalid = |key: &'static str, value: String| ConfigError::InvalidValue {
        section: RELAY_SECTION,
        key,
        value,
    };

    let security = match optional("Security") {
        Some(value) => value.parse().map_err(|_| invalid("Security", value))?,
        None => Security::default(),
    };
    let port = match optional("Port") {
        Some(value) => value.parse().map_err(|_| invalid("Port", value))?,
        None => security.default_port(),
    };
    let timeout = match optional("Timeout") {
        Some(value) => Duration::from_secs(value.parse().map_err(|_| invalid("Timeout", value))?),
        None => DEFAULT_TIMEOUT,
    };

    Ok(RelayConfig {
        server: required("Server")?,
        port,
        user: optional("User"),
        password: optional("Password"),
        from: required("From")?,
        to: required("To")?,
        security,
        timeout,
    })
}
