use crate::error::{ErrorKind, GuardError};
use crate::host::MailHost;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Remediation attempted between a failed call and its next retry.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn can_recover(&self, error: &GuardError) -> bool;
    async fn recover(&self, error: &GuardError) -> Result<(), GuardError>;
}

#[derive(Default, Clone)]
pub struct RecoveryRegistry {
    strategies: HashMap<ErrorKind, Vec<Arc<dyn RecoveryStrategy>>>,
}

impl RecoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ErrorKind, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.entry(kind).or_default().push(strategy);
    }

    pub fn strategies_for(&self, kind: ErrorKind) -> usize {
        self.strategies.get(&kind).map_or(0, Vec::len)
    }

    /// Run the first registered strategy that accepts `error`. Returns true
    /// when one reported success.
    pub async fn attempt(&self, error: &GuardError) -> bool {
        let Some(strategies) = self.strategies.get(&error.kind()) else {
            return false;
        };
        for strategy in strategies.iter().filter(|s| s.can_recover(error)) {
            match strategy.recover(error).await {
                Ok(()) => {
                    log::debug!("Recovery '{}' succeeded for: {error}", strategy.name());
                    return true;
                }
                Err(e) => log::warn!("Recovery '{}' failed: {e}", strategy.name()),
            }
        }
        false
    }
}

impl std::fmt::Debug for RecoveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self
            .strategies
            .iter()
            .map(|(kind, list)| (format!("{kind:?}"), list.len()))
            .collect();
        kinds.sort();
        f.debug_struct("RecoveryRegistry").field("strategies", &kinds).finish()
    }
}

/// Re-runs host initialisation after internal or missing-item failures,
/// which hosts report when their composition context went stale.
pub struct ReinitializeHost {
    host: Arc<dyn MailHost>,
}

impl ReinitializeHost {
    pub fn new(host: Arc<dyn MailHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl RecoveryStrategy for ReinitializeHost {
    fn name(&self) -> &str {
        "reinitialize-host"
    }

    fn can_recover(&self, error: &GuardError) -> bool {
        matches!(error.kind(), ErrorKind::HostInternal | ErrorKind::ItemNotFound)
    }

    async fn recover(&self, _error: &GuardError) -> Result<(), GuardError> {
        self.host.initialize().await
    }
}
