//! HTTP provider client
//!
//! JSON REST client for the banking provider. Its main job beyond transport
//! is turning every non-success response into a classified [`ProviderError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::TransferProvider;
use super::error::ProviderError;
use crate::config::ProviderConfig;
use crate::reconcile::types::MinorAmount;

pub struct HttpTransferProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct TransferRequestBody<'a> {
    source_account_id: &'a str,
    destination_account_id: &'a str,
    amount: MinorAmount,
    reason: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TransferData {
    id: String,
}

#[derive(Deserialize)]
struct BalanceData {
    available_balance: MinorAmount,
}

/// Provider error body: `{"error": {"code": ..., "message": ...}}`
#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default, alias = "detail")]
    message: String,
}

impl HttpTransferProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn read_success<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status().as_u16();
        let body = response.text().await?;

        if !(200..300).contains(&status) {
            return Err(classify_error_response(status, &body));
        }

        serde_json::from_str::<Envelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|e| ProviderError::UnexpectedResponse(format!("{} ({})", e, status)))
    }
}

/// Classify a non-2xx response.
///
/// A rejection status only counts as explicit when the body has the provider's
/// error shape; an HTML error page from a proxy proves nothing.
pub fn classify_error_response(status: u16, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();

    match parsed {
        Some(envelope) if ProviderError::is_rejection_status(status) => ProviderError::Rejected {
            status,
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Some(envelope) if status == 408 => ProviderError::Timeout(envelope.error.message),
        Some(envelope) if status == 429 || status >= 500 => ProviderError::Unavailable {
            status,
            message: envelope.error.message,
        },
        _ if status >= 500 || status == 429 => ProviderError::Unavailable {
            status,
            message: truncate(body),
        },
        _ => ProviderError::UnexpectedResponse(format!("status {}: {}", status, truncate(body))),
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

#[async_trait]
impl TransferProvider for HttpTransferProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn initiate_transfer(
        &self,
        source_account_ref: &str,
        destination_account_ref: &str,
        reason: &str,
        amount: MinorAmount,
    ) -> Result<String, ProviderError> {
        debug!(
            source = source_account_ref,
            destination = destination_account_ref,
            amount = amount,
            "Initiating provider transfer"
        );

        let response = self
            .client
            .post(format!("{}/v1/transfers", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&TransferRequestBody {
                source_account_id: source_account_ref,
                destination_account_id: destination_account_ref,
                amount,
                reason,
            })
            .send()
            .await?;

        let data: TransferData = Self::read_success(response).await.inspect_err(|e| {
            warn!(error = %e, explicit = e.is_explicit_rejection(), "Provider transfer failed");
        })?;

        if data.id.trim().is_empty() {
            return Err(ProviderError::UnexpectedResponse(
                "transfer accepted without id".to_string(),
            ));
        }
        Ok(data.id)
    }

    async fn get_balance(&self, account_ref: &str) -> Result<MinorAmount, ProviderError> {
        let response = self
            .client
            .get(format!("{}/v1/accounts/{}/balance", self.base_url, account_ref))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let data: BalanceData = Self::read_success(response).await?;
        Ok(data.available_balance)
    }
}
