//! Integrity service configuration

use std::time::Duration;

use crate::policy::RecordingPolicy;

/// Runtime settings for [`IntegrityService`](crate::IntegrityService).
#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    /// Upper bound on any single ledger submit or query
    pub ledger_timeout: Duration,
    /// Re-query the issuing ledger during verification
    pub confirm_on_verify: bool,
    /// Which CRUD changes are recorded by `record_with_policy`
    pub policy: RecordingPolicy,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            ledger_timeout: Duration::from_secs(10),
            confirm_on_verify: true,
            policy: RecordingPolicy::default(),
        }
    }
}

impl IntegrityConfig {
    pub fn with_ledger_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_timeout = timeout;
        self
    }

    pub fn with_confirm_on_verify(mut self, confirm: bool) -> Self {
        self.confirm_on_verify = confirm;
        self
    }

    pub fn with_policy(mut self, policy: RecordingPolicy) -> Self {
        self.policy = policy;
        self
    }
}
