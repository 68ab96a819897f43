//! Orchestration of a greeting check.
//!
//! One [`GreetingValidator`] owns the cross-run state: addressee/body slots,
//! the identity and result caches, the shared host circuit breaker, the
//! consecutive-failure count and degraded mode. Only one run is active at a
//! time; callers arriving while a run is in flight wait for its outcome.

use crate::cache::{Cache, CacheStats};
use crate::chunking::{BlockingPoolExecutor, ChunkSettings, ChunkedParser, TaskExecutor};
use crate::config::{GuardConfig, ValidationSettings};
use crate::content_parser::{ContentParseResult, ContentParser};
use crate::debounce::Debouncer;
use crate::diagnostics::DiagnosticLog;
use crate::error::{ErrorKind, GuardError, Stage};
use crate::host::{AddresseeRecord, HostEvent, MailHost, NotificationSink};
use crate::identity_parser::{Identity, IdentityParser};
use crate::matching::{MatchingEngine, ValidationResult};
use crate::resilience::{
    CircuitBreaker, CircuitState, RecoveryRegistry, ReinitializeHost, ResilientCaller,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const ADDRESSEES_SLOT: &str = "addressees";
const BODY_SLOT: &str = "body";

type RunOutcome = Result<Vec<ValidationResult>, GuardError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Validating,
    DegradedIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LiveFetch,
    Matching,
    Correction,
}

const FULL_CAPABILITIES: [Capability; 3] =
    [Capability::LiveFetch, Capability::Matching, Capability::Correction];

#[derive(Debug, Clone, PartialEq)]
pub struct DegradedMode {
    pub since: DateTime<Utc>,
    pub capabilities: Vec<Capability>,
}

impl DegradedMode {
    fn enter() -> Self {
        Self {
            since: Utc::now(),
            capabilities: vec![Capability::Matching],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorStatus {
    pub phase: RunPhase,
    pub degraded: Option<DegradedMode>,
    pub capabilities: Vec<Capability>,
    pub consecutive_failures: u32,
    pub breaker: CircuitState,
    pub addressee_cache: CacheStats,
    pub body_cache: CacheStats,
    pub identity_cache: CacheStats,
    pub result_cache: CacheStats,
    pub last_result_count: usize,
}

struct RunState {
    phase: RunPhase,
    last_results: Vec<ValidationResult>,
    last_started: Option<Instant>,
    consecutive_failures: u32,
    degraded: Option<DegradedMode>,
    in_flight: Option<watch::Receiver<Option<RunOutcome>>>,
}

impl RunState {
    fn idle_phase(&self) -> RunPhase {
        if self.degraded.is_some() {
            RunPhase::DegradedIdle
        } else {
            RunPhase::Idle
        }
    }
}

/// Parser and engine built from one [`ValidationSettings`]; swapped as a unit.
struct Pipeline {
    settings: ValidationSettings,
    content: ChunkedParser,
    engine: MatchingEngine,
}

impl Pipeline {
    fn build(
        settings: ValidationSettings,
        executor: Arc<dyn TaskExecutor>,
        chunking: ChunkSettings,
    ) -> Result<Self, GuardError> {
        settings.validate()?;
        let parser = ContentParser::new(settings.language_selector()?, &settings.greeting_patterns)?;
        let engine = MatchingEngine::new(settings.matching_options())?;
        Ok(Self {
            content: ChunkedParser::new(Arc::new(parser), executor, chunking),
            engine,
            settings,
        })
    }
}

struct PipelineOutput {
    results: Vec<ValidationResult>,
    substituted: bool,
}

enum Admission {
    Run(watch::Sender<Option<RunOutcome>>),
    Wait(watch::Receiver<Option<RunOutcome>>),
    Throttled(Vec<ValidationResult>),
}

/// Resets the run state if a run is abandoned before it finishes.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.phase = state.idle_phase();
            state.in_flight = None;
        }
    }
}

pub struct ValidatorBuilder {
    config: GuardConfig,
    executor: Arc<dyn TaskExecutor>,
    breaker: Option<Arc<CircuitBreaker>>,
    diagnostics: Option<Arc<DiagnosticLog>>,
}

impl ValidatorBuilder {
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Share a breaker with other components talking to the same host.
    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<DiagnosticLog>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(
        self,
        host: Arc<dyn MailHost>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Arc<GreetingValidator>, GuardError> {
        let config = self.config;
        config.validate()?;

        let chunking = config.chunking.settings();
        let pipeline = Pipeline::build(config.validation.clone(), self.executor.clone(), chunking)?;

        let breaker = self.breaker.unwrap_or_else(|| {
            Arc::new(CircuitBreaker::new(
                "host",
                config.resilience.circuit_breaker.settings(),
            ))
        });
        let diagnostics = self.diagnostics.unwrap_or_else(|| {
            Arc::new(DiagnosticLog::new(
                config.diagnostics.capacity,
                Duration::from_secs(config.diagnostics.retention_seconds),
            ))
        });

        let mut recovery = RecoveryRegistry::new();
        let reinitialize = Arc::new(ReinitializeHost::new(Arc::clone(&host)));
        recovery.register(ErrorKind::HostInternal, reinitialize.clone());
        recovery.register(ErrorKind::ItemNotFound, reinitialize);

        let host_caller = ResilientCaller::new(config.resilience.retry.policy())
            .with_timeout(Duration::from_millis(config.resilience.call_timeout_ms))
            .with_breaker(Arc::clone(&breaker))
            .with_recovery(Arc::new(recovery));
        let pipeline_caller = ResilientCaller::new(config.resilience.pipeline_retry.policy());

        let limits = config.cache.limits();
        let validator = GreetingValidator {
            host,
            notifier,
            executor: self.executor,
            chunking,
            pipeline: RwLock::new(Arc::new(pipeline)),
            identity_parser: IdentityParser::new(),
            host_caller,
            pipeline_caller,
            breaker,
            addressee_cache: Cache::new("addressee", limits),
            body_cache: Cache::new("body", limits),
            identity_cache: Cache::new("identity", limits),
            result_cache: Cache::new("result", limits),
            diagnostics,
            debouncer: Debouncer::new(Duration::from_millis(config.scheduling.debounce_ms)),
            min_interval: Duration::from_millis(config.scheduling.min_interval_ms),
            degrade_after: config.resilience.degrade_after_failures,
            state: Mutex::new(RunState {
                phase: RunPhase::Idle,
                last_results: Vec::new(),
                last_started: None,
                consecutive_failures: 0,
                degraded: None,
                in_flight: None,
            }),
            janitors: Mutex::new(Vec::new()),
        };
        validator.start_janitors(Duration::from_secs(config.cache.cleanup_interval_seconds));
        Ok(Arc::new(validator))
    }
}

pub struct GreetingValidator {
    host: Arc<dyn MailHost>,
    notifier: Arc<dyn NotificationSink>,
    executor: Arc<dyn TaskExecutor>,
    chunking: ChunkSettings,
    pipeline: RwLock<Arc<Pipeline>>,
    identity_parser: IdentityParser,
    host_caller: ResilientCaller,
    pipeline_caller: ResilientCaller,
    breaker: Arc<CircuitBreaker>,
    addressee_cache: Cache<Vec<AddresseeRecord>>,
    body_cache: Cache<String>,
    identity_cache: Cache<Vec<Identity>>,
    result_cache: Cache<Vec<ValidationResult>>,
    diagnostics: Arc<DiagnosticLog>,
    debouncer: Debouncer,
    min_interval: Duration,
    degrade_after: u32,
    state: Mutex<RunState>,
    janitors: Mutex<Vec<JoinHandle<()>>>,
}

impl GreetingValidator {
    pub fn builder(config: GuardConfig) -> ValidatorBuilder {
        ValidatorBuilder {
            config,
            executor: Arc::new(BlockingPoolExecutor),
            breaker: None,
            diagnostics: None,
        }
    }

    pub fn new(
        config: GuardConfig,
        host: Arc<dyn MailHost>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Arc<Self>, GuardError> {
        Self::builder(config).build(host, notifier)
    }

    fn start_janitors(&self, every: Duration) {
        if tokio::runtime::Handle::try_current().is_err() || every.is_zero() {
            return;
        }
        if let Ok(mut janitors) = self.janitors.lock() {
            janitors.push(self.addressee_cache.spawn_janitor(every));
            janitors.push(self.body_cache.spawn_janitor(every));
            janitors.push(self.identity_cache.spawn_janitor(every));
            janitors.push(self.result_cache.spawn_janitor(every));
        }
    }

    pub fn diagnostics(&self) -> Arc<DiagnosticLog> {
        Arc::clone(&self.diagnostics)
    }

    pub fn settings(&self) -> ValidationSettings {
        self.current_pipeline().settings.clone()
    }

    pub fn last_results(&self) -> Vec<ValidationResult> {
        self.state
            .lock()
            .map(|s| s.last_results.clone())
            .unwrap_or_default()
    }

    fn current_pipeline(&self) -> Arc<Pipeline> {
        match self.pipeline.read() {
            Ok(pipeline) => Arc::clone(&pipeline),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn is_degraded(&self) -> bool {
        self.state.lock().map(|s| s.degraded.is_some()).unwrap_or(false)
    }

    pub async fn initialize(&self) -> Result<(), GuardError> {
        self.host_caller
            .call("initialize", || self.host.initialize())
            .await
            .map_err(|e| {
                self.diagnostics.record(&e, &[("operation", "initialize".to_string())]);
                e
            })
    }

    /// Run one validation pass, or return the last results when a pass ran
    /// too recently. A call made while a pass is in flight resolves to that
    /// pass's outcome.
    pub async fn validate(&self) -> Result<Vec<ValidationResult>, GuardError> {
        let admission = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| GuardError::validation(Stage::Fetch, "run state lock poisoned"))?;
            let in_flight = match state.phase {
                RunPhase::Validating => state.in_flight.clone(),
                _ => None,
            };
            if let Some(receiver) = in_flight {
                Admission::Wait(receiver)
            } else if state
                .last_started
                .is_some_and(|started| started.elapsed() < self.min_interval)
            {
                Admission::Throttled(state.last_results.clone())
            } else {
                let (sender, receiver) = watch::channel(None);
                state.phase = RunPhase::Validating;
                state.last_started = Some(Instant::now());
                state.in_flight = Some(receiver);
                Admission::Run(sender)
            }
        };

        match admission {
            Admission::Throttled(results) => {
                log::debug!("Validation throttled, returning last results");
                Ok(results)
            }
            Admission::Wait(mut receiver) => loop {
                if let Some(outcome) = receiver.borrow().clone() {
                    return outcome;
                }
                if receiver.changed().await.is_err() {
                    return Ok(self.last_results());
                }
            },
            Admission::Run(sender) => {
                let mut guard = RunGuard {
                    state: &self.state,
                    armed: true,
                };
                self.notifier.on_validation_started();
                let outcome = self
                    .pipeline_caller
                    .call("validate", || self.run_pipeline())
                    .await;
                let outcome = self.finish_run(outcome);
                guard.armed = false;

                match &outcome {
                    Ok(results) => self.notifier.on_validation_complete(results),
                    Err(e) => self.notifier.on_validation_error(e),
                }
                sender.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }

    fn finish_run(&self, outcome: Result<PipelineOutput, GuardError>) -> RunOutcome {
        let Ok(mut state) = self.state.lock() else {
            return outcome.map(|o| o.results);
        };
        state.in_flight = None;

        let result = match outcome {
            Ok(output) => {
                state.consecutive_failures = 0;
                if !output.substituted && state.degraded.take().is_some() {
                    log::info!("Host calls succeeding again, leaving degraded mode");
                }
                state.last_results = output.results.clone();
                log::info!(
                    "Greeting validation complete: {} greeting(s), {} flagged",
                    output.results.len(),
                    output.results.iter().filter(|r| !r.is_valid).count()
                );
                Ok(output.results)
            }
            Err(error) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                self.diagnostics.record(
                    &error,
                    &[
                        ("operation", "validate".to_string()),
                        ("consecutive_failures", state.consecutive_failures.to_string()),
                    ],
                );
                log::error!(
                    "Greeting validation failed ({} in a row): {error}",
                    state.consecutive_failures
                );
                if state.degraded.is_none() && state.consecutive_failures >= self.degrade_after {
                    log::info!(
                        "Entering degraded mode after {} consecutive failures",
                        state.consecutive_failures
                    );
                    state.degraded = Some(DegradedMode::enter());
                }
                Err(error)
            }
        };
        state.phase = state.idle_phase();
        result
    }

    async fn run_pipeline(&self) -> Result<PipelineOutput, GuardError> {
        let pipeline = self.current_pipeline();
        let degraded = self.is_degraded();

        let (addressees, body) = tokio::join!(
            self.fetch_addressees(degraded),
            self.fetch_body(degraded)
        );
        let (addressees, addressees_substituted) = addressees?;
        let (body, body_substituted) = body?;
        let substituted = addressees_substituted || body_substituted;

        let content_key = content_key(&body, &addressees);
        if !substituted {
            if let Some(results) = self.result_cache.get(&content_key) {
                log::debug!("Result cache hit");
                return Ok(PipelineOutput {
                    results,
                    substituted,
                });
            }
        }

        if addressees_substituted {
            log::warn!("Addressees unavailable in degraded mode, skipping greeting checks");
            return Ok(PipelineOutput {
                results: Vec::new(),
                substituted,
            });
        }

        let parsed = match pipeline.content.parse(&body).await {
            Ok(parsed) => parsed,
            Err(e) => {
                self.diagnostics
                    .record(&e, &[("operation", "content_parse".to_string())]);
                log::warn!("Greeting extraction failed, treating body as greeting-free: {e}");
                ContentParseResult::default()
            }
        };

        let results = if parsed.greetings.is_empty() {
            log::debug!("No greetings found");
            Vec::new()
        } else {
            let identities = self.identities_for(&addressees);
            pipeline.engine.validate_all(&parsed.greetings, &identities)
        };

        if !substituted {
            self.result_cache.set(content_key, results.clone());
        }
        Ok(PipelineOutput {
            results,
            substituted,
        })
    }

    fn identities_for(&self, addressees: &[AddresseeRecord]) -> Vec<Identity> {
        let key = addressee_key(addressees);
        if let Some(identities) = self.identity_cache.get(&key) {
            log::debug!("Identity cache hit");
            return identities;
        }
        let identities = self.identity_parser.parse_batch(addressees);
        self.identity_cache.set(key, identities.clone());
        identities
    }

    async fn fetch_addressees(
        &self,
        degraded: bool,
    ) -> Result<(Vec<AddresseeRecord>, bool), GuardError> {
        if let Some(addressees) = self.addressee_cache.get(ADDRESSEES_SLOT) {
            return Ok((addressees, false));
        }
        match self
            .host_caller
            .call("get_addressees", || self.host.get_addressees())
            .await
        {
            Ok(addressees) => {
                self.addressee_cache.set(ADDRESSEES_SLOT, addressees.clone());
                Ok((addressees, false))
            }
            Err(e) => self.fetch_failed("get_addressees", e, degraded).map(|()| (Vec::new(), true)),
        }
    }

    async fn fetch_body(&self, degraded: bool) -> Result<(String, bool), GuardError> {
        if let Some(body) = self.body_cache.get(BODY_SLOT) {
            return Ok((body, false));
        }
        match self
            .host_caller
            .call("get_body_text", || self.host.get_body_text())
            .await
        {
            Ok(body) => {
                self.body_cache.set(BODY_SLOT, body.clone());
                Ok((body, false))
            }
            Err(e) => self.fetch_failed("get_body_text", e, degraded).map(|()| (String::new(), true)),
        }
    }

    /// Ok means the caller substitutes an empty value.
    fn fetch_failed(&self, operation: &str, error: GuardError, degraded: bool) -> Result<(), GuardError> {
        self.diagnostics
            .record(&error, &[("operation", operation.to_string())]);
        if degraded {
            log::warn!("{operation} failed in degraded mode, substituting empty value: {error}");
            return Ok(());
        }
        Err(GuardError::validation(Stage::Fetch, format!("{operation} failed")).with_cause(error))
    }

    /// Invalidate the addressee slot and schedule a debounced run.
    pub fn on_addressees_changed(self: &Arc<Self>) {
        self.addressee_cache.invalidate(ADDRESSEES_SLOT);
        self.schedule();
    }

    /// Invalidate the body slot and schedule a debounced run.
    pub fn on_body_changed(self: &Arc<Self>) {
        self.body_cache.invalidate(BODY_SLOT);
        self.schedule();
    }

    fn schedule(self: &Arc<Self>) {
        let validator = Arc::clone(self);
        self.debouncer.trigger(move || async move {
            if let Err(e) = validator.validate().await {
                log::debug!("Debounced validation failed: {e}");
            }
        });
    }

    /// Consume host events until `Shutdown` or the sender side closes.
    pub async fn run_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<HostEvent>) {
        log::debug!("Host event loop started");
        while let Some(event) = events.recv().await {
            match event {
                HostEvent::AddresseesChanged => self.on_addressees_changed(),
                HostEvent::BodyChanged => self.on_body_changed(),
                HostEvent::Shutdown => break,
            }
        }
        self.debouncer.cancel();
        log::debug!("Host event loop stopped");
    }

    /// Validate and swap in new settings. Invalid settings leave the current
    /// ones in place.
    pub fn update_settings(&self, settings: ValidationSettings) -> Result<(), GuardError> {
        let pipeline = Pipeline::build(settings, Arc::clone(&self.executor), self.chunking)
            .map_err(|e| {
                self.diagnostics
                    .record(&e, &[("operation", "update_settings".to_string())]);
                e
            })?;
        match self.pipeline.write() {
            Ok(mut current) => *current = Arc::new(pipeline),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(pipeline),
        }
        self.result_cache.clear();
        log::info!("Validation settings updated");
        Ok(())
    }

    /// Rewrite the flagged greeting name to the suggested identity's name.
    /// Returns the new body text.
    pub async fn apply_correction(&self, result: &ValidationResult) -> Result<String, GuardError> {
        if self.is_degraded() {
            return Err(GuardError::validation(
                Stage::Correction,
                "corrections are unavailable in degraded mode",
            ));
        }
        let replacement = result
            .suggested_identity
            .as_ref()
            .and_then(Identity::preferred_name)
            .ok_or_else(|| {
                GuardError::InvalidInput(format!(
                    "no suggested name for greeting '{}'",
                    result.greeting_name
                ))
            })?;

        let body = self
            .host_caller
            .call("get_body_text", || self.host.get_body_text())
            .await
            .map_err(|e| {
                GuardError::validation(Stage::Correction, "could not read body").with_cause(e)
            })?;

        let start = find_from(&body, &result.greeting_name, result.position).ok_or_else(|| {
            GuardError::validation(
                Stage::Correction,
                format!("greeting '{}' no longer in body", result.greeting_name),
            )
        })?;
        let mut corrected = String::with_capacity(body.len() + replacement.len());
        corrected.push_str(&body[..start]);
        corrected.push_str(&replacement);
        corrected.push_str(&body[start + result.greeting_name.len()..]);

        self.host_caller
            .call("set_body_text", || self.host.set_body_text(&corrected))
            .await
            .map_err(|e| {
                GuardError::validation(Stage::Correction, "could not write body").with_cause(e)
            })?;
        self.body_cache.invalidate(BODY_SLOT);
        log::info!(
            "Corrected greeting '{}' to '{replacement}'",
            result.greeting_name
        );
        Ok(corrected)
    }

    /// Clear degraded mode, failure counts, breaker and caches.
    pub fn reset(&self) {
        self.breaker.reset();
        if let Ok(mut state) = self.state.lock() {
            state.consecutive_failures = 0;
            state.degraded = None;
            state.last_started = None;
            if state.phase != RunPhase::Validating {
                state.phase = RunPhase::Idle;
            }
        }
        self.addressee_cache.clear();
        self.body_cache.clear();
        self.identity_cache.clear();
        self.result_cache.clear();
        log::info!("Greeting validator reset");
    }

    pub fn status(&self) -> ValidatorStatus {
        let (phase, degraded, consecutive_failures, last_result_count) = self
            .state
            .lock()
            .map(|s| {
                (
                    s.phase,
                    s.degraded.clone(),
                    s.consecutive_failures,
                    s.last_results.len(),
                )
            })
            .unwrap_or((RunPhase::Idle, None, 0, 0));
        let capabilities = degraded
            .as_ref()
            .map(|d| d.capabilities.clone())
            .unwrap_or_else(|| FULL_CAPABILITIES.to_vec());
        ValidatorStatus {
            phase,
            degraded,
            capabilities,
            consecutive_failures,
            breaker: self.breaker.state(),
            addressee_cache: self.addressee_cache.stats(),
            body_cache: self.body_cache.stats(),
            identity_cache: self.identity_cache.stats(),
            result_cache: self.result_cache.stats(),
            last_result_count,
        }
    }
}

impl Drop for GreetingValidator {
    fn drop(&mut self) {
        if let Ok(janitors) = self.janitors.lock() {
            for janitor in janitors.iter() {
                janitor.abort();
            }
        }
    }
}

fn hash_addressees(hasher: &mut Sha256, addressees: &[AddresseeRecord]) {
    let mut sorted: Vec<(String, &str)> = addressees
        .iter()
        .map(|a| (a.address.trim().to_lowercase(), a.display_name.as_deref().unwrap_or("")))
        .collect();
    sorted.sort();
    for (address, name) in sorted {
        hasher.update(address.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
}

fn addressee_key(addressees: &[AddresseeRecord]) -> String {
    let mut hasher = Sha256::new();
    hash_addressees(&mut hasher, addressees);
    format!("{:x}", hasher.finalize())
}

fn content_key(body: &str, addressees: &[AddresseeRecord]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update([0xffu8]);
    hash_addressees(&mut hasher, addressees);
    format!("{:x}", hasher.finalize())
}

/// Byte offset of the first `needle` at or after `from`.
fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let from = from.min(haystack.len());
    haystack
        .get(from..)
        .and_then(|tail| tail.find(needle))
        .map(|offset| from + offset)
}
