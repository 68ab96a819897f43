pub mod cache;
pub mod chunking;
pub mod config;
pub mod content_parser;
pub mod debounce;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod identity_parser;
pub mod language;
pub mod matching;
pub mod normalization;
pub mod resilience;
pub mod settings;
pub mod validator;

pub use config::{GuardConfig, ValidationSettings};
pub use content_parser::{ContentParseResult, ContentParser, GreetingCandidate};
pub use error::{ErrorReport, GuardError, UserMessage};
pub use host::{AddresseeRecord, HostEvent, MailHost, NotificationSink};
pub use identity_parser::{Identity, IdentityParser};
pub use language::{Language, LanguageDetector, LanguageSelector};
pub use matching::{MatchKind, MatchVerdict, MatchingEngine, ValidationResult};
pub use validator::{GreetingValidator, ValidatorStatus};
