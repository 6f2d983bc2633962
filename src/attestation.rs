//! Client for the Gateway attestation service.
//!
//! A signed burn intent is posted once to `/v1/transfer`. The service
//! answers with a transfer id and, once it has checked the depositor's
//! unified balance, an attestation plus its own signature authorizing the
//! mint on the destination chain. When the attestation is not returned
//! inline it is fetched from `/v1/transfer/{id}` with bounded polling.
//!
//! Submission is never retried here: a 4xx usually means the intent is
//! malformed or already consumed, and resending a successful submission
//! would spend the unified balance twice.

use std::time::Duration;

use alloy::primitives::{B256, Bytes, U256};
use backon::{ConstantBuilder, Retryable};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::signer::SignedIntent;

#[derive(Debug, Clone)]
pub struct AttestationConfig {
    pub base_url: Url,
    pub poll_interval: Duration,
    pub max_attempts: usize,
    pub request_timeout: Duration,
}

/// Proof from the attestation service that a burn intent may be redeemed
/// on its destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub transfer_id: String,
    pub payload: Bytes,
    pub signature: Bytes,
    /// Fee actually charged, in whole USDC.
    pub fee: Option<Decimal>,
    pub expiration_block: Option<U256>,
}

/// Result of posting a signed intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub transfer_id: String,
    pub attestation: Option<Attestation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestationStatus {
    Complete(Attestation),
    Pending { status: String },
    Rejected { status: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("attestation service returned {status}: {body}")]
    ServiceError { status: u16, body: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("attestation pending: {status}")]
    Pending { status: String },
    #[error("transfer rejected by attestation service: {status}")]
    Rejected { status: String },
    #[error("attestation not ready after {attempts} attempts")]
    Timeout {
        attempts: usize,
        #[source]
        last: Box<AttestationError>,
    },
    #[error("malformed attestation response: {0}")]
    Malformed(String),
}

impl AttestationError {
    /// Pending attestations, server-side failures, rate limiting and
    /// connection problems may clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ServiceError { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Pending { .. } | Self::Timeout { .. } => true,
            Self::Rejected { .. } | Self::Malformed(_) => false,
        }
    }
}

/// Statuses after which the service will never produce an attestation.
const REJECTED_STATUSES: &[&str] = &["failed", "rejected", "expired", "cancelled"];
const COMPLETE_STATUS: &str = "complete";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferSpecRequest {
    version: u32,
    source_domain: u32,
    destination_domain: u32,
    source_contract: B256,
    destination_contract: B256,
    source_token: B256,
    destination_token: B256,
    source_depositor: B256,
    destination_recipient: B256,
    source_signer: B256,
    destination_caller: B256,
    value: String,
    salt: B256,
    hook_data: Bytes,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BurnIntentRequest {
    max_block_height: String,
    max_fee: String,
    spec: TransferSpecRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest {
    burn_intent: BurnIntentRequest,
    signature: Bytes,
}

impl From<&SignedIntent> for TransferRequest {
    fn from(signed: &SignedIntent) -> Self {
        let intent = &signed.intent;

        Self {
            burn_intent: BurnIntentRequest {
                max_block_height: intent.max_block_height.to_string(),
                max_fee: intent.max_fee.to_string(),
                spec: TransferSpecRequest {
                    version: intent.version,
                    source_domain: intent.source_domain,
                    destination_domain: intent.destination_domain,
                    source_contract: intent.source_contract,
                    destination_contract: intent.destination_contract,
                    source_token: intent.source_token,
                    destination_token: intent.destination_token,
                    source_depositor: intent.source_depositor,
                    destination_recipient: intent.destination_recipient,
                    source_signer: intent.source_signer,
                    destination_caller: intent.destination_caller,
                    value: intent.value.to_string(),
                    salt: intent.salt,
                    hook_data: intent.hook_data.clone(),
                },
            },
            signature: signed.signature.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Text(String),
    Number(u64),
}

impl Quantity {
    fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Fees {
    total: Option<Quantity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferResponse {
    transfer_id: String,
    status: Option<String>,
    attestation: Option<Bytes>,
    signature: Option<Bytes>,
    fees: Option<Fees>,
    expiration_block: Option<Quantity>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(TransferResponse),
    Many(Vec<TransferResponse>),
}

impl TransferResponse {
    fn attestation(&self) -> Result<Option<Attestation>, AttestationError> {
        let (Some(payload), Some(signature)) = (&self.attestation, &self.signature) else {
            let completed = self
                .status
                .as_deref()
                .is_some_and(|status| status.eq_ignore_ascii_case(COMPLETE_STATUS));
            if completed || self.attestation.is_some() || self.signature.is_some() {
                return Err(AttestationError::Malformed(format!(
                    "transfer {} is missing its attestation payload or signature",
                    self.transfer_id
                )));
            }
            return Ok(None);
        };

        let fee = self
            .fees
            .as_ref()
            .and_then(|fees| fees.total.as_ref())
            .map(|total| {
                total
                    .as_text()
                    .parse::<Decimal>()
                    .map_err(|err| AttestationError::Malformed(format!("fees.total: {err}")))
            })
            .transpose()?;

        let expiration_block = self
            .expiration_block
            .as_ref()
            .map(|block| {
                block
                    .as_text()
                    .parse::<U256>()
                    .map_err(|err| AttestationError::Malformed(format!("expirationBlock: {err}")))
            })
            .transpose()?;

        Ok(Some(Attestation {
            transfer_id: self.transfer_id.clone(),
            payload: payload.clone(),
            signature: signature.clone(),
            fee,
            expiration_block,
        }))
    }

    fn status(&self) -> AttestationStatus {
        let status = self
            .status
            .clone()
            .unwrap_or_else(|| "pending".to_string());

        if REJECTED_STATUSES.contains(&status.to_ascii_lowercase().as_str()) {
            AttestationStatus::Rejected { status }
        } else {
            AttestationStatus::Pending { status }
        }
    }
}

/// HTTP client for the attestation service.
#[derive(Debug, Clone)]
pub struct AttestationClient {
    http_client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    max_attempts: usize,
}

impl AttestationClient {
    pub fn new(config: &AttestationConfig) -> Result<Self, AttestationError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
            poll_interval: config.poll_interval,
            max_attempts: config.max_attempts.max(1),
        })
    }

    /// Posts `signed` to the service exactly once.
    pub async fn submit(&self, signed: &SignedIntent) -> Result<Submission, AttestationError> {
        let url = format!("{}/v1/transfer", self.base_url);
        let body = [TransferRequest::from(signed)];

        info!(
            %url,
            source_domain = signed.intent.source_domain,
            destination_domain = signed.intent.destination_domain,
            value = %signed.intent.value,
            "Submitting burn intent"
        );

        let response = self.http_client.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "Attestation service refused burn intent");
            return Err(AttestationError::ServiceError {
                status: status.as_u16(),
                body,
            });
        }

        let transfer = match response.json::<OneOrMany>().await? {
            OneOrMany::One(transfer) => transfer,
            OneOrMany::Many(transfers) => transfers.into_iter().next().ok_or_else(|| {
                AttestationError::Malformed("empty transfer list".to_string())
            })?,
        };

        let attestation = transfer.attestation()?;

        info!(
            transfer_id = %transfer.transfer_id,
            inline_attestation = attestation.is_some(),
            "Burn intent accepted"
        );

        Ok(Submission {
            transfer_id: transfer.transfer_id,
            attestation,
        })
    }

    /// Fetches the current state of a transfer once.
    pub async fn check(&self, transfer_id: &str) -> Result<AttestationStatus, AttestationError> {
        let url = format!("{}/v1/transfer/{transfer_id}", self.base_url);
        let response = self.http_client.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(AttestationStatus::Rejected {
                status: "not_found".to_string(),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AttestationError::ServiceError {
                status: status.as_u16(),
                body,
            });
        }

        let transfer: TransferResponse = response.json().await?;

        match transfer.attestation()? {
            Some(attestation) => Ok(AttestationStatus::Complete(attestation)),
            None => Ok(transfer.status()),
        }
    }

    /// Polls until the attestation is complete, the transfer is rejected,
    /// or the attempt budget runs out.
    pub async fn poll(&self, transfer_id: &str) -> Result<Attestation, AttestationError> {
        let backoff = ConstantBuilder::default()
            .with_delay(self.poll_interval)
            .with_max_times(self.max_attempts - 1);

        let fetch_attestation = || async {
            match self.check(transfer_id).await? {
                AttestationStatus::Complete(attestation) => Ok(attestation),
                AttestationStatus::Pending { status } => Err(AttestationError::Pending { status }),
                AttestationStatus::Rejected { status } => {
                    Err(AttestationError::Rejected { status })
                }
            }
        };

        let attestation = fetch_attestation
            .retry(backoff)
            .when(AttestationError::is_transient)
            .notify(|err, dur| match err {
                AttestationError::Pending { status } => {
                    debug!(transfer_id, %status, ?dur, "Attestation pending, retrying");
                }
                err => warn!(transfer_id, ?err, ?dur, "Attestation check failed, retrying"),
            })
            .await
            .map_err(|err| {
                if err.is_transient() {
                    AttestationError::Timeout {
                        attempts: self.max_attempts,
                        last: Box::new(err),
                    }
                } else {
                    err
                }
            })?;

        info!(transfer_id, fee = ?attestation.fee, "Attestation received");

        Ok(attestation)
    }
}
