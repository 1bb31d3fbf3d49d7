//! The value model seam. The guard only ever sees `Predictor`; the HTTP
//! client and the fixed-value stand-in are the two shipped implementations.

use std::time::Duration;

use async_trait::async_trait;
use bidguard_core::{GuardError, GuardResult, Platform, TransportError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::guard::BidRequest;

#[async_trait]
pub trait Predictor: Send + Sync {
    /// Predicted lifetime value for the request's campaign.
    async fn predict(&self, request: &BidRequest) -> Result<f64, TransportError>;
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    platform: &'a str,
    campaign_id: &'a str,
    features: &'a std::collections::HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predicted_ltv: f64,
}

/// JSON-over-HTTP client for a remote LTV model.
pub struct HttpPredictor {
    client: reqwest::Client,
    url: String,
    platform: Platform,
    timeout: Duration,
}

impl HttpPredictor {
    /// `timeout` bounds the whole HTTP exchange; the breaker applies its own
    /// deadline on top.
    pub fn new(url: impl Into<String>, platform: Platform, timeout: Duration) -> GuardResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GuardError::Config(format!("predictor client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            platform,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            TransportError::ConnectionReset(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else if e.is_decode() || e.is_body() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, request: &BidRequest) -> Result<f64, TransportError> {
        let body = PredictRequest {
            platform: self.platform.slug(),
            campaign_id: &request.campaign_id,
            features: &request.features,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(platform = %self.platform, status = status.as_u16(), "predictor returned error status");
            return Err(TransportError::Status(status.as_u16()));
        }

        let parsed: PredictResponse = response.json().await.map_err(|e| self.map_error(e))?;
        if !parsed.predicted_ltv.is_finite() {
            return Err(TransportError::Decode(format!(
                "non-finite prediction {}",
                parsed.predicted_ltv
            )));
        }
        Ok(parsed.predicted_ltv)
    }
}

/// Always answers with the same value. Used for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticPredictor {
    value: f64,
}

impl StaticPredictor {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Predictor for StaticPredictor {
    async fn predict(&self, _request: &BidRequest) -> Result<f64, TransportError> {
        Ok(self.value)
    }
}
