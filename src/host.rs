//! Boundary to the mail-composition host.
//!
//! The host shim implements [`MailHost`] and pushes [`HostEvent`]s into the
//! bounded queue returned by [`event_channel`]; the validator consumes them.
//! Results flow back out through a [`NotificationSink`].

use crate::error::{GuardError, HostErrorCode, UserMessage};
use crate::matching::ValidationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One addressee as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddresseeRecord {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AddresseeRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }

    pub fn with_name(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: Some(display_name.into()),
        }
    }

    /// Parse `Name <user@host>` or a bare address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match (raw.rfind('<'), raw.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let name = raw[..open].trim().trim_matches('"').trim();
                let address = raw[open + 1..close].trim();
                if name.is_empty() {
                    Self::new(address)
                } else {
                    Self::with_name(address, name)
                }
            }
            _ => Self::new(raw),
        }
    }
}

#[async_trait]
pub trait MailHost: Send + Sync {
    async fn initialize(&self) -> Result<(), GuardError>;
    async fn get_addressees(&self) -> Result<Vec<AddresseeRecord>, GuardError>;
    async fn get_body_text(&self) -> Result<String, GuardError>;
    async fn set_body_text(&self, text: &str) -> Result<(), GuardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    AddresseesChanged,
    BodyChanged,
    Shutdown,
}

/// Producer half handed to the host shim.
#[derive(Debug, Clone)]
pub struct HostEventSender {
    sender: mpsc::Sender<HostEvent>,
}

impl HostEventSender {
    /// Queue an event without waiting. A full queue drops the event: the
    /// pending debounced run already covers it.
    pub fn emit(&self, event: HostEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("Host event queue full, dropping {event:?}");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                log::warn!("Host event queue closed, dropping {event:?}");
                false
            }
        }
    }

    pub async fn send(&self, event: HostEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }
}

pub fn event_channel(capacity: usize) -> (HostEventSender, mpsc::Receiver<HostEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (HostEventSender { sender }, receiver)
}

/// Receives the outcome of every validation run. `on_validation_started` is
/// always called first; exactly one of the other two ends the run.
pub trait NotificationSink: Send + Sync {
    fn on_validation_started(&self);
    fn on_validation_complete(&self, results: &[ValidationResult]);
    fn on_validation_error(&self, error: &GuardError);
}

/// Sink that writes outcomes to the log.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl NotificationSink for LoggingNotifier {
    fn on_validation_started(&self) {
        log::debug!("Greeting validation started");
    }

    fn on_validation_complete(&self, results: &[ValidationResult]) {
        for result in results.iter().filter(|r| !r.is_valid) {
            match &result.suggested_identity {
                Some(identity) => log::warn!(
                    "Greeting '{}' does not match any recipient (closest: {}, confidence {:.2})",
                    result.greeting_name,
                    identity.address,
                    result.confidence
                ),
                None => log::warn!(
                    "Greeting '{}' does not match any recipient",
                    result.greeting_name
                ),
            }
        }
        log::info!("Greeting validation complete: {} greeting(s) checked", results.len());
    }

    fn on_validation_error(&self, error: &GuardError) {
        let message = UserMessage::for_error(error);
        log::error!("Greeting validation failed: {error} ({})", message.title);
    }
}

/// Host backed by plain values, used by the command-line front end.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    addressees: Mutex<Vec<AddresseeRecord>>,
    body: Mutex<String>,
}

impl InMemoryHost {
    pub fn new(addressees: Vec<AddresseeRecord>, body: impl Into<String>) -> Self {
        Self {
            addressees: Mutex::new(addressees),
            body: Mutex::new(body.into()),
        }
    }

    pub fn set_addressees(&self, addressees: Vec<AddresseeRecord>) {
        if let Ok(mut guard) = self.addressees.lock() {
            *guard = addressees;
        }
    }

    pub fn body(&self) -> String {
        self.body.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MailHost for InMemoryHost {
    async fn initialize(&self) -> Result<(), GuardError> {
        Ok(())
    }

    async fn get_addressees(&self) -> Result<Vec<AddresseeRecord>, GuardError> {
        self.addressees
            .lock()
            .map(|a| a.clone())
            .map_err(|_| GuardError::host(HostErrorCode::Internal, "addressee lock poisoned"))
    }

    async fn get_body_text(&self) -> Result<String, GuardError> {
        self.body
            .lock()
            .map(|b| b.clone())
            .map_err(|_| GuardError::host(HostErrorCode::Internal, "body lock poisoned"))
    }

    async fn set_body_text(&self, text: &str) -> Result<(), GuardError> {
        let mut body = self
            .body
            .lock()
            .map_err(|_| GuardError::host(HostErrorCode::Internal, "body lock poisoned"))?;
        *body = text.to_string();
        Ok(())
    }
}
