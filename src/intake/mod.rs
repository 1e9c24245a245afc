//! What happens to a message once the listener has accepted it

pub mod relay;
pub mod store;

use std::sync::mpsc;

use tracing::{error, info, warn};

use crate::config::SinkConfig;
use crate::transaction::MailTransaction;

pub use relay::{Relay, RelayConfig, RelayError, Security};
pub use store::MailStore;

/// Receives every transaction the listener completes.
///
/// `handle` runs on the connection's thread before the client gets its reply,
/// so it must not panic and should report its own failures.
pub trait IntakePipeline: Send + Sync {
    fn handle(&self, transaction: MailTransaction);
}

/// Hands transactions to a channel; handy for embedding and tests
impl IntakePipeline for mpsc::Sender<MailTransaction> {
    fn handle(&self, transaction: MailTransaction) {
        if let Err(mpsc::SendError(lost)) = self.send(transaction) {
            warn!(
                peer = %lost.peer,
                from = %lost.mail_from,
                "Receiver gone, message dropped"
            );
        }
    }
}

/// Persists and/or relays each message; both steps are optional and
/// best-effort, and a failure in one never prevents the other
pub struct SinkPipeline {
    store: Option<MailStore>,
    relay: Option<Relay>,
}

impl SinkPipeline {
    pub fn new(store: Option<MailStore>, relay: Option<Relay>) -> Self {
        Self { store, relay }
    }

    /// Build the pipeline described by the startup configuration
    pub fn from_config(config: &SinkConfig) -> Result<Self, RelayError> {
        let store = config.mail_dir.as_ref().map(MailStore::new);
        if let Some(store) = &store {
            if let Err(e) = store.create_dir() {
                warn!(dir = %store.dir().display(), error = %e, "Cannot create mail directory");
            }
        }

        let relay = match &config.relay {
            Some(relay_config) if config.forward => Some(Relay::new(relay_config.clone())?),
            _ => None,
        };

        Ok(Self::new(store, relay))
    }

    fn persist(&self, store: &MailStore, transaction: &MailTransaction) {
        match store.store_at(transaction.received_at, &transaction.body) {
            Ok(path) => info!(path = %path.display(), "Message stored"),
            Err(e) => error!(
                dir = %store.dir().display(),
                peer = %transaction.peer,
                error = %e,
                "Failed to store message"
            ),
        }
    }

    fn forward(&self, relay: &Relay, transaction: &MailTransaction) {
        if let Err(e) = relay.forward(&transaction.body) {
            error!(
                server = %relay.config().server,
                peer = %transaction.peer,
                kind = e.kind(),
                error = %e,
                "Failed to forward message"
            );
        }
    }
}

impl IntakePipeline for SinkPipeline {
    fn handle(&self, transaction: MailTransaction) {
        if let Some(store) = &self.store {
            self.persist(store, &transaction);
        }
        if let Some(relay) = &self.relay {
            self.forward(relay, &transaction);
        }
    }
}
