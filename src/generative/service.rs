//! The external text-generation service boundary.
//!
//! A request is a prompt plus one credential; the response is free-form
//! text. Failures are mapped into [`ServiceError`] so the client can decide
//! between retrying, rotating and giving up.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::credentials::Credential;
use crate::config::GenerativeConfig;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by a generation service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Credit or quota for this credential is used up.
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// The credential was refused.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The service answered but the body could not be used.
    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },
}

impl ServiceError {
    /// Whether the same credential may be retried after a backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::QuotaExceeded { .. }
                | Self::Server { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
        )
    }

    /// Delay the service asked for, if it named one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Map an HTTP status code and body to an error.
    #[must_use]
    pub fn from_response(status_code: u16, body: &str) -> Self {
        let lower = body.to_lowercase();
        match status_code {
            429 if lower.contains("quota") || lower.contains("credit") => Self::QuotaExceeded {
                message: body.to_string(),
            },
            429 => Self::RateLimited {
                message: body.to_string(),
                retry_after_secs: extract_retry_after(body),
            },
            402 => Self::QuotaExceeded {
                message: body.to_string(),
            },
            401 | 403 => Self::Authentication {
                message: body.to_string(),
            },
            500..=599 => Self::Server {
                message: body.to_string(),
            },
            _ if lower.contains("quota") => Self::QuotaExceeded {
                message: body.to_string(),
            },
            _ => Self::InvalidResponse {
                message: format!("HTTP {status_code}: {body}"),
            },
        }
    }
}

/// Extract retry-after seconds from an error body.
fn extract_retry_after(body: &str) -> Option<u64> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"retry.?after[:\s]+(\d+)",
            r"wait[:\s]+(\d+)",
            r"(\d+)\s*seconds?",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    let lower = body.to_lowercase();
    patterns.iter().find_map(|re| {
        re.captures(&lower)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    })
}

// =============================================================================
// Service Trait
// =============================================================================

/// A text-generation backend.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Send `prompt` authenticated with `credential`.
    async fn generate(&self, prompt: &str, credential: &Credential)
        -> Result<String, ServiceError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// OpenAI-compatible HTTP Service
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You repair Python code. Reply with JSON only.";

/// Chat-completions client for OpenRouter and other OpenAI-compatible APIs.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleService {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleService {
    /// Build from the generative configuration section.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &GenerativeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            model: config.model.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationService for OpenAiCompatibleService {
    async fn generate(
        &self,
        prompt: &str,
        credential: &Credential,
    ) -> Result<String, ServiceError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        debug!(model = %self.model, credential = %credential.label(), "Sending generation request");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential.secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    ServiceError::Connection {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ServiceError::Connection {
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ServiceError::from_response(status.as_u16(), &body));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| ServiceError::InvalidResponse {
                message: format!("undecodable body: {e}"),
            })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ServiceError::InvalidResponse {
                message: "no completion content".to_string(),
            })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}
