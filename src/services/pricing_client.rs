//! HTTP client for the external pricing-recommendation service
//!
//! Owns retry/backoff and cancellation plumbing for the single upstream
//! call shape: POST the material group, get back a JSON-encoded list of
//! recommendation records.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{PricingConfig, RetryPolicy};
use crate::error::{AuditError, PipelineResult};
use crate::services::registry::CancelToken;
use crate::traits::PricingApi;
use crate::types::{PricingMaterial, Recommendation, RecommendEnvelope};

/// Stateless pricing client over reqwest
#[derive(Debug)]
pub struct HttpPricingClient {
    client: reqwest::Client,
    config: PricingConfig,
    retry: RetryPolicy,
}

impl HttpPricingClient {
    /// Build a client. Missing credentials are a fatal configuration
    /// error, never retried.
    pub fn new(config: PricingConfig, retry: RetryPolicy) -> PipelineResult<Self> {
        if config.api_url.trim().is_empty() {
            return Err(AuditError::Config {
                field: "api_url".to_string(),
            });
        }
        if config.api_key.trim().is_empty() {
            return Err(AuditError::Config {
                field: "api_key".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(retry.attempt_timeout)
            .build()
            .map_err(|err| AuditError::Upstream {
                attempts: 0,
                message: format!("http client construction failed: {err}"),
            })?;
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    /// Client configured from the environment with default retry policy
    pub fn from_env() -> PipelineResult<Self> {
        Self::new(PricingConfig::from_env()?, RetryPolicy::default())
    }

    fn build_body(
        &self,
        materials: &[PricingMaterial],
        region: Option<&str>,
        date_range: Option<&str>,
    ) -> PipelineResult<serde_json::Value> {
        // The service expects the material array as a JSON string field
        let material = serde_json::to_string(materials)?;
        let mut inputs = json!({ "material": material });
        if let Some(city) = region {
            inputs["city"] = json!(city);
        }
        if let Some(date) = date_range {
            inputs["date"] = json!(date);
        }
        Ok(json!({
            "inputs": inputs,
            "response_mode": "blocking",
            "user": format!("audit_{}", chrono::Utc::now().timestamp_millis()),
        }))
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<Vec<Recommendation>, String> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| format!("transport failure: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("upstream returned status {status}"));
        }

        let envelope: RecommendEnvelope = response
            .json()
            .await
            .map_err(|err| format!("response decode failed: {err}"))?;
        extract_recommendations(envelope)
    }
}

/// Pull the recommendation list out of a response envelope
fn extract_recommendations(envelope: RecommendEnvelope) -> Result<Vec<Recommendation>, String> {
    let data = envelope
        .data
        .ok_or_else(|| "response missing data".to_string())?;
    if data.status.as_deref() == Some("failed") {
        let reason = data.error.unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("upstream workflow failed: {reason}"));
    }
    let text = data
        .outputs
        .and_then(|outputs| outputs.text)
        .ok_or_else(|| "response missing outputs.text".to_string())?;
    serde_json::from_str(&text).map_err(|err| format!("recommendation payload invalid: {err}"))
}

#[async_trait]
impl PricingApi for HttpPricingClient {
    async fn recommend<'a>(
        &self,
        materials: &[PricingMaterial],
        region: Option<&'a str>,
        date_range: Option<&'a str>,
        token: CancelToken,
    ) -> PipelineResult<Vec<Recommendation>> {
        let body = self.build_body(materials, region, date_range)?;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if token.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            debug!(
                attempt,
                materials = materials.len(),
                "calling pricing service"
            );

            let outcome = tokio::select! {
                result = self.attempt(&body) => result,
                _ = token.cancelled() => return Err(AuditError::Cancelled),
            };

            match outcome {
                Ok(recommendations) => {
                    debug!(
                        count = recommendations.len(),
                        "pricing service returned recommendations"
                    );
                    return Ok(recommendations);
                }
                Err(message) => {
                    warn!(attempt, %message, "pricing request failed");
                    last_error = message;
                }
            }

            if attempt < self.retry.max_attempts {
                let delay = self.retry.backoff_delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(AuditError::Cancelled),
                }
            }
        }

        Err(AuditError::Upstream {
            attempts: self.retry.max_attempts,
            message: last_error,
        })
    }
}
