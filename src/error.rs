//! Error taxonomy shared by every stage of the greeting check.
//!
//! Host failures arrive as [`GuardError::HostApi`] with a [`HostErrorCode`];
//! pipeline and extraction failures carry a [`Stage`] tag and may wrap the
//! error that caused them. [`ErrorReport`] is the serialisable form written
//! to the diagnostic log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static REPORT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorCode {
    PermissionDenied,
    ApiUnavailable,
    ItemNotFound,
    Internal,
    Network,
}

impl HostErrorCode {
    /// Map a host-specific error code onto the taxonomy.
    /// Unknown codes are treated as internal host failures.
    pub fn from_host_code(code: &str) -> Self {
        match code.trim().to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "permissiondenied" | "accessdenied" | "forbidden" | "403" => Self::PermissionDenied,
            "apinotsupported" | "apiunavailable" | "notsupported" | "501" => Self::ApiUnavailable,
            "itemnotfound" | "notfound" | "404" => Self::ItemNotFound,
            "network" | "networkerror" | "offline" | "connectionlost" => Self::Network,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for HostErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission-denied",
            Self::ApiUnavailable => "api-unavailable",
            Self::ItemNotFound => "item-not-found",
            Self::Internal => "internal",
            Self::Network => "network",
        };
        f.write_str(s)
    }
}

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    ContentParsing,
    IdentityParsing,
    Matching,
    Correction,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::ContentParsing => "content parsing",
            Self::IdentityParsing => "identity parsing",
            Self::Matching => "matching",
            Self::Correction => "correction",
        };
        f.write_str(s)
    }
}

/// Discriminant used to key recovery strategies and user messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    ApiUnavailable,
    ItemNotFound,
    HostInternal,
    Network,
    Timeout,
    CircuitOpen,
    Validation,
    Parsing,
    Configuration,
    InvalidInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    HostApi,
    Validation,
    Parsing,
    Configuration,
    Input,
    Resilience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("host API error ({code}): {message}")]
    HostApi { code: HostErrorCode, message: String },
    #[error("validation failed during {stage}: {message}")]
    Validation {
        stage: Stage,
        message: String,
        #[source]
        cause: Option<Box<GuardError>>,
    },
    #[error("parsing failed during {stage}: {message}")]
    Parsing {
        stage: Stage,
        message: String,
        #[source]
        cause: Option<Box<GuardError>>,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    #[error("circuit open for {operation}, next attempt allowed in {retry_after:?}")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },
}

impl GuardError {
    pub fn host(code: HostErrorCode, message: impl Into<String>) -> Self {
        Self::HostApi {
            code,
            message: message.into(),
        }
    }

    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        Self::Validation {
            stage,
            message: message.into(),
            cause: None,
        }
    }

    pub fn parsing(stage: Stage, message: impl Into<String>) -> Self {
        Self::Parsing {
            stage,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a wrapped cause. Only pipeline and parsing errors keep one;
    /// other variants are returned unchanged.
    pub fn with_cause(self, err: GuardError) -> Self {
        match self {
            Self::Validation { stage, message, .. } => Self::Validation {
                stage,
                message,
                cause: Some(Box::new(err)),
            },
            Self::Parsing { stage, message, .. } => Self::Parsing {
                stage,
                message,
                cause: Some(Box::new(err)),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HostApi { code, .. } => match code {
                HostErrorCode::PermissionDenied => ErrorKind::PermissionDenied,
                HostErrorCode::ApiUnavailable => ErrorKind::ApiUnavailable,
                HostErrorCode::ItemNotFound => ErrorKind::ItemNotFound,
                HostErrorCode::Internal => ErrorKind::HostInternal,
                HostErrorCode::Network => ErrorKind::Network,
            },
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Parsing { .. } => ErrorKind::Parsing,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostApi { .. } => ErrorCategory::HostApi,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Parsing { .. } => ErrorCategory::Parsing,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::InvalidInput(_) => ErrorCategory::Input,
            Self::Timeout { .. } | Self::CircuitOpen { .. } => ErrorCategory::Resilience,
        }
    }

    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Configuration => Severity::Critical,
            ErrorKind::PermissionDenied | ErrorKind::ApiUnavailable | ErrorKind::Validation => {
                Severity::High
            }
            ErrorKind::HostInternal
            | ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::CircuitOpen => Severity::Medium,
            ErrorKind::ItemNotFound | ErrorKind::Parsing | ErrorKind::InvalidInput => {
                Severity::Low
            }
        }
    }

    /// Permission, missing-API and configuration failures never succeed on retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied | ErrorKind::ApiUnavailable | ErrorKind::Configuration
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HostApi { .. } => !self.is_terminal(),
            Self::Timeout { .. } => true,
            Self::Validation {
                cause: Some(cause), ..
            } => cause.is_retryable(),
            _ => false,
        }
    }

    pub fn report(&self) -> ErrorReport {
        let mut causes = Vec::new();
        let mut source = self.source();
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }

        let recorded_at = Utc::now();
        let seq = REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        ErrorReport {
            id: format!("err-{}-{}", recorded_at.timestamp_millis(), seq),
            kind: self.kind(),
            category: self.category(),
            severity: self.severity(),
            message: self.to_string(),
            causes,
            context: BTreeMap::new(),
            recorded_at,
        }
    }
}

/// Serialisable snapshot of one error, as kept by the diagnostic log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub causes: Vec<String>,
    pub context: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl ErrorReport {
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"id\":\"{}\"}}", self.id))
    }
}

/// Short user-facing explanation with remediation hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub title: String,
    pub suggestions: Vec<String>,
}

impl UserMessage {
    fn new(title: &str, suggestions: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn unexpected() -> Self {
        Self::new(
            "An unexpected error occurred",
            &["Try again", "Restart the mail client if the problem persists"],
        )
    }

    pub fn for_error(err: &GuardError) -> Self {
        match err.kind() {
            ErrorKind::PermissionDenied => Self::new(
                "Greeting check is not allowed to read this message",
                &["Grant the add-in read/write access to the message", "Ask your administrator to review add-in permissions"],
            ),
            ErrorKind::ApiUnavailable => Self::new(
                "This mail client does not support greeting checks",
                &["Update the mail client", "Use a client version with compose-mode add-in support"],
            ),
            ErrorKind::ItemNotFound => Self::new(
                "The message being composed could not be found",
                &["Reopen the draft", "Try again"],
            ),
            ErrorKind::HostInternal => Self::new(
                "The mail client reported an internal error",
                &["Try again", "Restart the mail client if the problem persists"],
            ),
            ErrorKind::Network | ErrorKind::Timeout => Self::new(
                "The mail client did not respond in time",
                &["Check your network connection", "Try again in a moment"],
            ),
            ErrorKind::CircuitOpen => Self::new(
                "Greeting checks are paused after repeated failures",
                &["Wait a few seconds and try again"],
            ),
            ErrorKind::Validation | ErrorKind::Parsing => Self::new(
                "The greeting could not be checked",
                &["Make sure the greeting is on its own line", "Try again"],
            ),
            ErrorKind::Configuration => Self::new(
                "Greeting check settings are invalid",
                &["Review the confidence threshold (0 to 1)", "Check custom greeting patterns", "Reset settings to defaults"],
            ),
            ErrorKind::InvalidInput => Self::new(
                "A recipient address could not be read",
                &["Check the recipient list for malformed addresses"],
            ),
        }
    }

    /// Falls back to the generic message for anything that is not a [`GuardError`].
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        err.downcast_ref::<GuardError>()
            .map(Self::for_error)
            .unwrap_or_else(Self::unexpected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors_are_not_retryable() {
        let denied = GuardError::host(HostErrorCode::PermissionDenied, "no access");
        assert!(denied.is_terminal());
        assert!(!denied.is_retryable());

        let config = GuardError::Configuration("bad threshold".to_string());
        assert!(config.is_terminal());
        assert!(!config.is_retryable());

        let network = GuardError::host(HostErrorCode::Network, "offline");
        assert!(!network.is_terminal());
        assert!(network.is_retryable());
    }

    #[test]
    fn test_validation_retryable_follows_cause() {
        let err = GuardError::validation(Stage::Fetch, "fetch failed")
            .with_cause(GuardError::host(HostErrorCode::Internal, "boom"));
        assert!(err.is_retryable());

        let err = GuardError::validation(Stage::Fetch, "fetch failed")
            .with_cause(GuardError::host(HostErrorCode::PermissionDenied, "no"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_report_includes_cause_chain() {
        let err = GuardError::parsing(Stage::ContentParsing, "chunk failed")
            .with_cause(GuardError::Timeout {
                operation: "parse_chunk".to_string(),
                timeout: Duration::from_millis(10),
            });
        let report = err.report().with_context("chunk", "3");

        assert_eq!(report.kind, ErrorKind::Parsing);
        assert_eq!(report.category, ErrorCategory::Parsing);
        assert_eq!(report.causes.len(), 1);
        assert!(report.causes[0].contains("timed out"));
        assert!(report.id.starts_with("err-"));

        let json = report.to_json();
        assert!(json.contains("\"chunk\":\"3\""));
        assert!(json.contains("\"severity\":\"low\""));
    }

    #[test]
    fn test_report_ids_are_unique() {
        let err = GuardError::InvalidInput("empty".to_string());
        assert_ne!(err.report().id, err.report().id);
    }

    #[test]
    fn test_host_code_mapping() {
        assert_eq!(
            HostErrorCode::from_host_code("PermissionDenied"),
            HostErrorCode::PermissionDenied
        );
        assert_eq!(
            HostErrorCode::from_host_code("item-not-found"),
            HostErrorCode::ItemNotFound
        );
        assert_eq!(HostErrorCode::from_host_code("weird"), HostErrorCode::Internal);
    }

    #[test]
    fn test_user_messages() {
        let msg = UserMessage::for_error(&GuardError::host(HostErrorCode::Network, "x"));
        assert!(!msg.suggestions.is_empty());

        let other = anyhow::anyhow!("something odd");
        assert_eq!(UserMessage::from_anyhow(&other), UserMessage::unexpected());

        let wrapped: anyhow::Error = GuardError::Configuration("bad".to_string()).into();
        assert_eq!(
            UserMessage::from_anyhow(&wrapped).title,
            "Greeting check settings are invalid"
        );
    }
}
