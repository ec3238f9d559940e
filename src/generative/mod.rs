//! Generative repair for LOGIC and TYPE_ERROR diagnostics.
//!
//! The client owns a [`CredentialPool`] for the lifetime of one Run. Each
//! call walks the pool from its cursor:
//!
//! 1. send the prompt with the current credential;
//! 2. on a transient failure, back off and retry the same credential until
//!    its attempts run out;
//! 3. then rotate to the next credential;
//! 4. when every credential is exhausted, return no fixes.
//!
//! An authentication failure exhausts the credential at once. A response
//! that cannot be used yields no fixes for this call but keeps the
//! credential in rotation.

pub mod credentials;
pub mod parse;
pub mod prompt;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use credentials::{Credential, CredentialPool};
pub use service::{GenerationService, OpenAiCompatibleService, ServiceError};

use crate::config::GenerativeConfig;
use crate::diagnostics::Diagnostic;
use crate::error::HealError;
use crate::repair::FixRecord;
use crate::workspace::Workspace;

/// Backoff before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let multiplier = 2u64.saturating_pow(exponent);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

/// Retry knobs taken from [`GenerativeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts_per_credential: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl From<&GenerativeConfig> for RetryPolicy {
    fn from(config: &GenerativeConfig) -> Self {
        Self {
            max_attempts_per_credential: config.max_attempts_per_credential.max(1),
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        }
    }
}

/// What one generative attempt produced.
#[derive(Debug, Default)]
pub struct GenerativeOutcome {
    pub records: Vec<FixRecord>,
    /// Every credential is used up.
    pub exhausted: bool,
    /// Service calls made during this attempt.
    pub calls: u32,
    /// Instructions dropped while parsing the response.
    pub discarded: usize,
}

/// Summary of the generative outcome for events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerativeReport {
    pub proposed: usize,
    pub discarded: usize,
    pub calls: u32,
    pub credentials_remaining: usize,
}

/// Client for the external generation service.
pub struct GenerativeClient {
    service: Arc<dyn GenerationService>,
    pool: CredentialPool,
    policy: RetryPolicy,
    max_prompt_chars: usize,
}

impl GenerativeClient {
    #[must_use]
    pub fn new(
        service: Arc<dyn GenerationService>,
        credentials: Vec<Credential>,
        config: &GenerativeConfig,
    ) -> Self {
        Self {
            service,
            pool: CredentialPool::new(credentials),
            policy: RetryPolicy::from(config),
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Report for the latest outcome.
    #[must_use]
    pub fn report(&self, outcome: &GenerativeOutcome) -> GenerativeReport {
        GenerativeReport {
            proposed: outcome.records.len(),
            discarded: outcome.discarded,
            calls: outcome.calls,
            credentials_remaining: self.pool.states().iter().filter(|s| !s.exhausted).count(),
        }
    }

    /// Propose fixes for the generative-category diagnostics in `diagnostics`.
    pub async fn attempt(
        &mut self,
        diagnostics: &[Diagnostic],
        workspace: &Workspace,
    ) -> GenerativeOutcome {
        let mut outcome = GenerativeOutcome::default();
        let targets: Vec<Diagnostic> = diagnostics
            .iter()
            .filter(|d| d.category.is_generative())
            .cloned()
            .collect();
        if targets.is_empty() {
            return outcome;
        }

        let Some(prompt) = prompt::build(&targets, workspace, self.max_prompt_chars) else {
            warn!(diagnostics = targets.len(), "No diagnostic fits the prompt budget");
            return outcome;
        };
        debug!(
            chars = prompt.text.len(),
            diagnostics = prompt.diagnostics.len(),
            service = self.service.name(),
            "Prompt built"
        );

        loop {
            let Some((idx, credential)) = self.pool.current() else {
                let err = HealError::GenerativeServiceExhausted {
                    credentials: self.pool.len(),
                };
                warn!("{}", err);
                outcome.exhausted = true;
                return outcome;
            };
            let credential = credential.clone();

            let wait = self.pool.wait_time(idx);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            outcome.calls += 1;
            match self.service.generate(&prompt.text, &credential).await {
                Ok(text) => {
                    self.pool.record_success(idx);
                    let parsed = parse::parse_response(&text, &prompt, workspace);
                    info!(
                        credential = %credential,
                        proposed = parsed.records.len(),
                        discarded = parsed.discarded,
                        "Generative fixes parsed"
                    );
                    outcome.records = parsed.records;
                    outcome.discarded = parsed.discarded;
                    return outcome;
                }
                Err(err) if err.is_transient() => {
                    warn!(credential = %credential, error = %err, "Transient generation failure");
                    if let Some(attempt) =
                        self.pool.record_failure(idx, self.policy.max_attempts_per_credential)
                    {
                        let backoff = calculate_backoff(
                            attempt,
                            self.policy.backoff_base_ms,
                            self.policy.backoff_max_ms,
                        );
                        let max = Duration::from_millis(self.policy.backoff_max_ms);
                        let delay = err.retry_after().map_or(backoff, |d| d.min(max).max(backoff));
                        self.pool.cool_down(idx, delay);
                    }
                }
                Err(err @ ServiceError::Authentication { .. }) => {
                    warn!(credential = %credential, error = %err, "Credential rejected");
                    self.pool.exhaust(idx);
                }
                Err(err) => {
                    warn!(credential = %credential, error = %err, "Unusable generation response");
                    return outcome;
                }
            }
        }
    }
}

impl std::fmt::Debug for GenerativeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeClient")
            .field("service", &self.service.name())
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::BugCategory;
    use crate::testing::mocks::MockGenerationService;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config() -> GenerativeConfig {
        GenerativeConfig {
            max_attempts_per_credential: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..GenerativeConfig::default()
        }
    }

    fn creds(n: usize) -> Vec<Credential> {
        (0..n)
            .map(|i| Credential::new(format!("KEY_{i}"), format!("secret-{i}")))
            .collect()
    }

    fn setup() -> (TempDir, Workspace, Vec<Diagnostic>) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("calc.py"), "def sub(a, b):\n    return a + b\n").unwrap();
        let ws = Workspace::open(temp.path()).unwrap();
        let diags = vec![Diagnostic {
            file: PathBuf::from("calc.py"),
            line: Some(2),
            category: BugCategory::Logic,
            message: "AssertionError: assert 5 == -1".into(),
            context: String::new(),
            code: None,
        }];
        (temp, ws, diags)
    }

    const GOOD: &str = r#"{"fixes": [{"file": "calc.py", "line": 2, "old_code": "    return a + b", "new_code": "    return a - b"}]}"#;

    fn rate_limited() -> ServiceError {
        ServiceError::RateLimited {
            message: "429".into(),
            retry_after_secs: None,
        }
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(1, 2000, 30_000), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(2, 2000, 30_000), Duration::from_millis(4000));
        assert_eq!(calculate_backoff(3, 2000, 30_000), Duration::from_millis(8000));
        assert_eq!(calculate_backoff(10, 2000, 30_000), Duration::from_millis(30_000));
        assert_eq!(calculate_backoff(200, 2000, 30_000), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::new(vec![Ok(GOOD.to_string())]));
        let mut client = GenerativeClient::new(service.clone(), creds(1), &config());

        let outcome = client.attempt(&diags, &ws).await;
        assert_eq!(outcome.records.len(), 1);
        assert!(!outcome.exhausted);
        assert_eq!(service.credentials_used(), vec!["KEY_0"]);
    }

    #[tokio::test]
    async fn test_retry_then_rotate() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Ok(GOOD.to_string()),
        ]));
        let mut client = GenerativeClient::new(service.clone(), creds(2), &config());

        let outcome = client.attempt(&diags, &ws).await;
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.calls, 3);
        assert_eq!(service.credentials_used(), vec!["KEY_0", "KEY_0", "KEY_1"]);
    }

    #[tokio::test]
    async fn test_all_exhausted_returns_empty() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::always(Err(rate_limited())));
        let mut client = GenerativeClient::new(service.clone(), creds(3), &config());

        let outcome = client.attempt(&diags, &ws).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.exhausted);
        assert_eq!(outcome.calls, 6);
        assert!(client.pool().is_exhausted());
    }

    #[tokio::test]
    async fn test_rotation_persists_across_calls() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::new(vec![
            Err(ServiceError::Authentication {
                message: "revoked".into(),
            }),
            Ok("{}".to_string()),
            Ok(GOOD.to_string()),
        ]));
        let mut client = GenerativeClient::new(service.clone(), creds(3), &config());

        client.attempt(&diags, &ws).await;
        client.attempt(&diags, &ws).await;
        assert_eq!(service.credentials_used(), vec!["KEY_0", "KEY_1", "KEY_1"]);
    }

    #[tokio::test]
    async fn test_invalid_response_keeps_credential() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::new(vec![
            Err(ServiceError::InvalidResponse {
                message: "html".into(),
            }),
            Ok(GOOD.to_string()),
        ]));
        let mut client = GenerativeClient::new(service.clone(), creds(2), &config());

        let first = client.attempt(&diags, &ws).await;
        assert!(first.records.is_empty());
        assert!(!first.exhausted);
        let second = client.attempt(&diags, &ws).await;
        assert_eq!(second.records.len(), 1);
        assert_eq!(service.credentials_used(), vec!["KEY_0", "KEY_0"]);
    }

    #[tokio::test]
    async fn test_no_credentials_is_exhausted() {
        let (_t, ws, diags) = setup();
        let service = Arc::new(MockGenerationService::always(Ok(GOOD.to_string())));
        let mut client = GenerativeClient::new(service.clone(), Vec::new(), &config());
        let outcome = client.attempt(&diags, &ws).await;
        assert!(outcome.exhausted);
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn test_deterministic_categories_are_not_sent() {
        let (_t, ws, mut diags) = setup();
        diags[0].category = BugCategory::Syntax;
        let service = Arc::new(MockGenerationService::always(Ok(GOOD.to_string())));
        let mut client = GenerativeClient::new(service.clone(), creds(1), &config());
        let outcome = client.attempt(&diags, &ws).await;
        assert!(outcome.records.is_empty());
        assert_eq!(service.call_count(), 0);
    }
}
