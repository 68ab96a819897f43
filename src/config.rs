use crate::cache::CacheLimits;
use crate::chunking::ChunkSettings;
use crate::content_parser::compile_custom_pattern;
use crate::error::GuardError;
use crate::language::LanguageSelector;
use crate::matching::{MatchingOptions, DEFAULT_MIN_CONFIDENCE};
use crate::resilience::{BreakerSettings, RetryPolicy};
use crate::settings::SettingsStore;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const KEY_GREETING_PATTERNS: &str = "greetguard.greeting_patterns";
pub const KEY_MIN_CONFIDENCE: &str = "greetguard.min_confidence";
pub const KEY_FUZZY_MATCHING: &str = "greetguard.fuzzy_matching";
pub const KEY_EXCLUDE_GENERIC: &str = "greetguard.exclude_generic";
pub const KEY_LANGUAGE: &str = "greetguard.language";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub validation: ValidationSettings,
    pub resilience: ResilienceConfig,
    pub scheduling: SchedulingConfig,
    pub cache: CacheConfig,
    pub chunking: ChunkingConfig,
    pub diagnostics: DiagnosticsConfig,
    pub logging: LoggingConfig,
}

/// The user-adjustable part of the configuration, also persisted through
/// the host settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub greeting_patterns: Vec<String>,
    pub min_confidence: f64,
    pub fuzzy_matching: bool,
    pub exclude_generic: bool,
    pub language: String,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            greeting_patterns: Vec::new(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            fuzzy_matching: true,
            exclude_generic: true,
            language: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            backoff_factor: 2.0,
            jitter_ms: 50,
        }
    }
}

impl RetryConfig {
    fn pipeline_default() -> Self {
        Self {
            max_attempts: 2,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub call_timeout_ms: u64,
    pub retry: RetryConfig,
    pub pipeline_retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub degrade_after_failures: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            retry: RetryConfig::default(),
            pipeline_retry: RetryConfig::pipeline_default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            degrade_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub debounce_ms: u64,
    pub min_interval_ms: u64,
    pub event_queue_capacity: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            min_interval_ms: 200,
            event_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_entries: 128,
            max_size_bytes: 4 * 1024 * 1024,
            cleanup_interval_seconds: 60,
        }
    }
}

impl CacheConfig {
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            ttl: Duration::from_secs(self.ttl_seconds),
            max_entries: self.max_entries,
            max_size_bytes: self.max_size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub threshold_bytes: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_in_flight: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let defaults = ChunkSettings::default();
        Self {
            threshold_bytes: defaults.threshold_bytes,
            chunk_size: defaults.chunk_size,
            overlap: defaults.overlap,
            max_in_flight: defaults.max_in_flight,
        }
    }
}

impl ChunkingConfig {
    pub fn settings(&self) -> ChunkSettings {
        ChunkSettings {
            threshold_bytes: self.threshold_bytes,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            max_in_flight: self.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub capacity: usize,
    pub retention_seconds: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            retention_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<Option<log::LevelFilter>, GuardError> {
        match &self.level {
            None => Ok(None),
            Some(level) => level.parse().map(Some).map_err(|_| {
                GuardError::Configuration(format!("unknown log level '{level}'"))
            }),
        }
    }
}

impl ValidationSettings {
    pub fn language_selector(&self) -> Result<LanguageSelector, GuardError> {
        self.language.parse()
    }

    pub fn matching_options(&self) -> MatchingOptions {
        MatchingOptions {
            fuzzy_enabled: self.fuzzy_matching,
            min_confidence: self.min_confidence,
            exclude_generic: self.exclude_generic,
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(GuardError::Configuration(format!(
                "min_confidence must be between 0 and 1, got {}",
                self.min_confidence
            )));
        }
        self.language_selector()?;
        for pattern in &self.greeting_patterns {
            compile_custom_pattern(pattern)?;
        }
        Ok(())
    }

    /// Read settings from the host store. Missing keys keep their defaults;
    /// unparseable or out-of-range values are rejected.
    pub fn load_from_store(store: &dyn SettingsStore) -> Result<Self, GuardError> {
        let mut settings = Self::default();
        if let Some(raw) = store.get(KEY_GREETING_PATTERNS) {
            settings.greeting_patterns = serde_json::from_str(&raw).map_err(|e| {
                GuardError::Configuration(format!("{KEY_GREETING_PATTERNS} is not a JSON string array: {e}"))
            })?;
        }
        if let Some(raw) = store.get(KEY_MIN_CONFIDENCE) {
            settings.min_confidence = parse_value(KEY_MIN_CONFIDENCE, &raw)?;
        }
        if let Some(raw) = store.get(KEY_FUZZY_MATCHING) {
            settings.fuzzy_matching = parse_value(KEY_FUZZY_MATCHING, &raw)?;
        }
        if let Some(raw) = store.get(KEY_EXCLUDE_GENERIC) {
            settings.exclude_generic = parse_value(KEY_EXCLUDE_GENERIC, &raw)?;
        }
        if let Some(raw) = store.get(KEY_LANGUAGE) {
            settings.language = raw.trim().to_lowercase();
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_to_store(&self, store: &dyn SettingsStore) -> Result<(), GuardError> {
        self.validate()?;
        let patterns = serde_json::to_string(&self.greeting_patterns)
            .map_err(|e| GuardError::Configuration(format!("failed to encode patterns: {e}")))?;
        store.set(KEY_GREETING_PATTERNS, &patterns);
        store.set(KEY_MIN_CONFIDENCE, &self.min_confidence.to_string());
        store.set(KEY_FUZZY_MATCHING, &self.fuzzy_matching.to_string());
        store.set(KEY_EXCLUDE_GENERIC, &self.exclude_generic.to_string());
        store.set(KEY_LANGUAGE, &self.language);
        store.save()
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, GuardError> {
    raw.trim()
        .parse()
        .map_err(|_| GuardError::Configuration(format!("invalid value '{raw}' for {key}")))
}

impl GuardConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: GuardConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn default_yaml() -> anyhow::Result<String> {
        Self::default().to_yaml()
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        self.validation.validate()?;
        self.logging.level_filter()?;

        let resilience = &self.resilience;
        for (name, retry) in [("retry", &resilience.retry), ("pipeline_retry", &resilience.pipeline_retry)] {
            if retry.max_attempts == 0 {
                return Err(GuardError::Configuration(format!(
                    "resilience.{name}.max_attempts must be at least 1"
                )));
            }
            if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
                return Err(GuardError::Configuration(format!(
                    "resilience.{name}.backoff_factor must be >= 1.0"
                )));
            }
        }
        if resilience.circuit_breaker.failure_threshold == 0 {
            return Err(GuardError::Configuration(
                "resilience.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if resilience.degrade_after_failures == 0 {
            return Err(GuardError::Configuration(
                "resilience.degrade_after_failures must be at least 1".to_string(),
            ));
        }
        if self.scheduling.event_queue_capacity == 0 {
            return Err(GuardError::Configuration(
                "scheduling.event_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.max_entries == 0 || self.cache.max_size_bytes == 0 {
            return Err(GuardError::Configuration(
                "cache limits must be non-zero".to_string(),
            ));
        }
        if self.chunking.chunk_size == 0 || self.chunking.max_in_flight == 0 {
            return Err(GuardError::Configuration(
                "chunking.chunk_size and chunking.max_in_flight must be non-zero".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(GuardError::Configuration(format!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap, self.chunking.chunk_size
            )));
        }
        if self.diagnostics.capacity == 0 {
            return Err(GuardError::Configuration(
                "diagnostics.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validation.min_confidence, 0.6);
        assert_eq!(config.resilience.pipeline_retry.max_attempts, 2);
        assert_eq!(config.scheduling.debounce_ms, 500);
    }

    #[test]
    fn test_default_yaml_round_trips() {
        let yaml = GuardConfig::default_yaml().unwrap();
        let parsed: GuardConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, GuardConfig::default());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "validation:\n  min_confidence: 0.4\n  language: de\nscheduling:\n  debounce_ms: 250"
        )
        .unwrap();

        let config = GuardConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.validation.min_confidence, 0.4);
        assert_eq!(
            config.validation.language_selector().unwrap(),
            LanguageSelector::Fixed(crate::language::Language::German)
        );
        assert_eq!(config.scheduling.debounce_ms, 250);
        assert_eq!(config.cache.ttl_seconds, 300);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = GuardConfig::default();
        config.validation.min_confidence = 1.2;
        assert!(matches!(config.validate(), Err(GuardError::Configuration(_))));

        let mut config = GuardConfig::default();
        config.validation.language = "xx".to_string();
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.validation.greeting_patterns = vec![r"(?i)yo\s+(\w+)".to_string()];
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.validation.greeting_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.chunking.overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.logging.level = Some("loud".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_store_round_trip() {
        let store = MemorySettings::new();
        let settings = ValidationSettings {
            greeting_patterns: vec![r"(?i)\byo\s+(?P<name>\w+)".to_string()],
            min_confidence: 0.35,
            fuzzy_matching: false,
            exclude_generic: false,
            language: "fr".to_string(),
        };
        settings.save_to_store(&store).unwrap();
        assert_eq!(store.get(KEY_LANGUAGE).as_deref(), Some("fr"));

        let loaded = ValidationSettings::load_from_store(&store).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_store_rejects_bad_values() {
        let store = MemorySettings::new();
        store.set(KEY_MIN_CONFIDENCE, "high");
        assert!(ValidationSettings::load_from_store(&store).is_err());

        let store = MemorySettings::new();
        store.set(KEY_GREETING_PATTERNS, "not json");
        assert!(ValidationSettings::load_from_store(&store).is_err());

        let store = MemorySettings::new();
        store.set(KEY_LANGUAGE, "klingon");
        assert!(ValidationSettings::load_from_store(&store).is_err());

        let empty = MemorySettings::new();
        assert_eq!(
            ValidationSettings::load_from_store(&empty).unwrap(),
            ValidationSettings::default()
        );
    }
}
