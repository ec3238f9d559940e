//! Ordered credential queue with per-credential attempt and cooldown state.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::GenerativeConfig;

/// Comma-separated list of extra credentials, appended after the named ones.
pub const EXTRA_KEYS_ENV: &str = "MEND_API_KEYS";

/// An access credential for the generation service.
///
/// `Debug` and `Display` only ever show the label.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    label: String,
    secret: String,
}

impl Credential {
    #[must_use]
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }

    /// Where the credential came from, e.g. `OPENROUTER_API_KEY`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Collect credentials from the environment.
///
/// Every variable in `credential_envs` that is set and non-empty, then the
/// entries of [`EXTRA_KEYS_ENV`]; duplicate secrets keep their first position.
pub fn from_env(
    config: &GenerativeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<Credential> {
    let mut found: Vec<Credential> = Vec::new();
    let mut push = |label: String, secret: &str| {
        let secret = secret.trim();
        if !secret.is_empty() && !found.iter().any(|c| c.secret == secret) {
            found.push(Credential::new(label, secret));
        }
    };

    for name in &config.credential_envs {
        if let Some(value) = lookup(name) {
            push(name.clone(), &value);
        }
    }
    if let Some(list) = lookup(EXTRA_KEYS_ENV) {
        for (i, value) in list.split(',').enumerate() {
            push(format!("{EXTRA_KEYS_ENV}[{i}]"), value);
        }
    }
    found
}

/// Per-credential bookkeeping.
#[derive(Debug, Clone)]
pub struct CredentialState {
    pub credential: Credential,
    pub attempts_used: u32,
    pub cooldown_until: Option<Instant>,
    pub exhausted: bool,
}

/// Credentials in rotation order.
///
/// The cursor only moves forward, and an exhausted credential stays
/// exhausted for the lifetime of the pool, so a pool that lives as long as
/// one Run never goes back to a credential it already gave up on.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    states: Vec<CredentialState>,
    cursor: usize,
}

impl CredentialPool {
    #[must_use]
    pub fn new(credentials: Vec<Credential>) -> Self {
        let states = credentials
            .into_iter()
            .map(|credential| CredentialState {
                credential,
                attempts_used: 0,
                cooldown_until: None,
                exhausted: false,
            })
            .collect();
        Self { states, cursor: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[must_use]
    pub fn states(&self) -> &[CredentialState] {
        &self.states
    }

    /// True once no credential can be used any more.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.states.iter().all(|s| s.exhausted)
    }

    /// The credential to use next, starting at the cursor.
    pub fn current(&mut self) -> Option<(usize, &Credential)> {
        while self.cursor < self.states.len() && self.states[self.cursor].exhausted {
            self.cursor += 1;
        }
        let idx = self.cursor;
        self.states.get(idx).map(|s| (idx, &s.credential))
    }

    /// How long until the credential at `idx` may be used again.
    #[must_use]
    pub fn wait_time(&self, idx: usize) -> Duration {
        self.states
            .get(idx)
            .and_then(|s| s.cooldown_until)
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Count a transient failure.
    ///
    /// Returns the attempts used so far, or `None` when that was the last
    /// allowed attempt and the credential is now exhausted.
    pub fn record_failure(&mut self, idx: usize, max_attempts: u32) -> Option<u32> {
        let state = self.states.get_mut(idx)?;
        state.attempts_used += 1;
        if state.attempts_used >= max_attempts {
            self.exhaust(idx);
            return None;
        }
        Some(state.attempts_used)
    }

    /// Put the credential at `idx` on cooldown.
    pub fn cool_down(&mut self, idx: usize, delay: Duration) {
        if let Some(state) = self.states.get_mut(idx) {
            state.cooldown_until = Some(Instant::now() + delay);
        }
    }

    /// Mark the credential at `idx` unusable for the rest of the pool's life.
    pub fn exhaust(&mut self, idx: usize) {
        if let Some(state) = self.states.get_mut(idx) {
            state.exhausted = true;
            state.cooldown_until = None;
            info!(credential = %state.credential, "Credential exhausted, rotating");
        }
        if idx >= self.cursor {
            self.cursor = idx + 1;
        }
    }

    /// A successful call resets the attempt counter.
    pub fn record_success(&mut self, idx: usize) {
        if let Some(state) = self.states.get_mut(idx) {
            debug!(credential = %state.credential, "Credential succeeded");
            state.attempts_used = 0;
            state.cooldown_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pool(n: usize) -> CredentialPool {
        CredentialPool::new(
            (0..n)
                .map(|i| Credential::new(format!("K{i}"), format!("secret-{i}")))
                .collect(),
        )
    }

    #[test]
    fn test_debug_is_redacted() {
        let cred = Credential::new("OPENROUTER_API_KEY", "sk-very-secret");
        let shown = format!("{cred:?} {cred}");
        assert!(!shown.contains("sk-very-secret"));
        assert!(shown.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn test_from_env_order_and_dedup() {
        let env: HashMap<&str, &str> = [
            ("OPENROUTER_API_KEY", "a"),
            ("OPENROUTER_API_KEY_2", ""),
            ("OPENROUTER_API_KEY_3", "c"),
            ("MEND_API_KEYS", "d, a ,e"),
        ]
        .into_iter()
        .collect();
        let creds = from_env(&GenerativeConfig::default(), |k| {
            env.get(k).map(|v| v.to_string())
        });
        let secrets: Vec<&str> = creds.iter().map(Credential::secret).collect();
        assert_eq!(secrets, ["a", "c", "d", "e"]);
        assert_eq!(creds[2].label(), "MEND_API_KEYS[0]");
    }

    #[test]
    fn test_failures_exhaust_then_rotate() {
        let mut pool = pool(2);
        assert_eq!(pool.current().map(|(i, _)| i), Some(0));
        assert_eq!(pool.record_failure(0, 2), Some(1));
        assert_eq!(pool.current().map(|(i, _)| i), Some(0));
        assert_eq!(pool.record_failure(0, 2), None);
        assert_eq!(pool.current().map(|(i, _)| i), Some(1));
        pool.exhaust(1);
        assert!(pool.current().is_none());
        assert!(pool.is_exhausted());
    }

    #[test]
    fn test_exhausted_credential_never_returns() {
        let mut pool = pool(3);
        pool.exhaust(0);
        pool.record_success(1);
        for _ in 0..5 {
            assert_eq!(pool.current().map(|(i, _)| i), Some(1));
        }
        assert!(pool.states()[0].exhausted);
    }

    #[test]
    fn test_cooldown() {
        let mut pool = pool(1);
        assert_eq!(pool.wait_time(0), Duration::ZERO);
        pool.cool_down(0, Duration::from_secs(30));
        assert!(pool.wait_time(0) > Duration::from_secs(29));
        pool.record_success(0);
        assert_eq!(pool.wait_time(0), Duration::ZERO);
    }
}
