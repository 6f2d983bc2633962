//! Transfer job: the persisted unit of work for one unified-balance
//! transfer into a destination treasury.
//!
//! The status only moves forward:
//!
//! `pending -> intent_signed -> attestation_pending -> attested -> minted
//!  -> treasury_funded -> complete`
//!
//! with `failed` reachable from every non-terminal status. Every artifact
//! produced on the way (signed intent, transfer id, attestation, tx
//! hashes) is kept on the job so a restarted process can continue from the
//! last completed step and an operator can finish a stuck mint by hand.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attestation::Attestation;
use crate::signer::SignedIntent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TransferJobId(pub Uuid);

impl TransferJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TransferJobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferJobId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    IntentSigned,
    AttestationPending,
    Attested,
    Minted,
    TreasuryFunded,
    Complete,
    Failed,
}

impl TransferStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::IntentSigned => "intent_signed",
            Self::AttestationPending => "attestation_pending",
            Self::Attested => "attested",
            Self::Minted => "minted",
            Self::TreasuryFunded => "treasury_funded",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl Display for TransferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} while job is {status}")]
    InvalidTransition {
        action: &'static str,
        status: TransferStatus,
    },
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_chain: String,
    pub destination_chain: String,
    pub depositor: Address,
    pub recipient: Address,
    /// Value in USDC base units.
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub failed_in: TransferStatus,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: TransferJobId,
    pub source_chain: String,
    pub destination_chain: String,
    pub depositor: Address,
    pub recipient: Address,
    pub amount: U256,
    pub status: TransferStatus,
    pub signed_intent: Option<SignedIntent>,
    /// Set right before the signed intent is posted. A job carrying this
    /// marker but no transfer id may or may not have reached the service.
    pub submission_attempted_at: Option<DateTime<Utc>>,
    pub transfer_id: Option<String>,
    pub attestation: Option<Attestation>,
    pub mint_tx: Option<TxHash>,
    pub approval_tx: Option<TxHash>,
    pub treasury_tx: Option<TxHash>,
    pub failure: Option<JobFailure>,
    /// Most recent resumable error, cleared on the next successful step.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(request: TransferRequest) -> Self {
        let now = Utc::now();

        Self {
            id: TransferJobId::new(),
            source_chain: request.source_chain,
            destination_chain: request.destination_chain,
            depositor: request.depositor,
            recipient: request.recipient,
            amount: request.amount,
            status: TransferStatus::Pending,
            signed_intent: None,
            submission_attempted_at: None,
            transfer_id: None,
            attestation: None,
            mint_tx: None,
            approval_tx: None,
            treasury_tx: None,
            failure: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn require(
        &self,
        action: &'static str,
        expected: TransferStatus,
    ) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError::InvalidTransition {
            action,
            status: self.status,
        }
    }

    fn touch(&mut self) {
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub fn record_signed_intent(&mut self, signed: SignedIntent) -> Result<(), TransitionError> {
        self.require("record signed intent", TransferStatus::Pending)?;

        self.signed_intent = Some(signed);
        self.status = TransferStatus::IntentSigned;
        self.touch();
        Ok(())
    }

    pub fn mark_submission_attempted(&mut self) -> Result<(), TransitionError> {
        self.require("submit intent", TransferStatus::IntentSigned)?;

        if self.submission_attempted_at.is_some() {
            return Err(self.invalid("submit intent twice"));
        }

        self.submission_attempted_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    pub fn record_submission(&mut self, transfer_id: String) -> Result<(), TransitionError> {
        self.require("record submission", TransferStatus::IntentSigned)?;

        if self.submission_attempted_at.is_none() {
            return Err(self.invalid("record submission before submitting"));
        }

        self.transfer_id = Some(transfer_id);
        self.status = TransferStatus::AttestationPending;
        self.touch();
        Ok(())
    }

    pub fn record_attestation(&mut self, attestation: Attestation) -> Result<(), TransitionError> {
        self.require("record attestation", TransferStatus::AttestationPending)?;

        self.attestation = Some(attestation);
        self.status = TransferStatus::Attested;
        self.touch();
        Ok(())
    }

    pub fn record_mint_broadcast(&mut self, tx_hash: TxHash) -> Result<(), TransitionError> {
        self.require("broadcast mint", TransferStatus::Attested)?;

        if self.mint_tx.is_some() {
            return Err(self.invalid("broadcast mint twice"));
        }

        self.mint_tx = Some(tx_hash);
        self.touch();
        Ok(())
    }

    pub fn record_mint_confirmed(&mut self) -> Result<(), TransitionError> {
        self.require("confirm mint", TransferStatus::Attested)?;

        if self.mint_tx.is_none() {
            return Err(self.invalid("confirm mint before broadcast"));
        }

        self.status = TransferStatus::Minted;
        self.touch();
        Ok(())
    }

    pub fn record_approval_broadcast(&mut self, tx_hash: TxHash) -> Result<(), TransitionError> {
        self.require("approve treasury", TransferStatus::Minted)?;

        if self.approval_tx.is_some() {
            return Err(self.invalid("approve treasury twice"));
        }

        self.approval_tx = Some(tx_hash);
        self.touch();
        Ok(())
    }

    pub fn record_treasury_broadcast(&mut self, tx_hash: TxHash) -> Result<(), TransitionError> {
        self.require("deposit to treasury", TransferStatus::Minted)?;

        if self.approval_tx.is_none() || self.treasury_tx.is_some() {
            return Err(self.invalid("deposit to treasury"));
        }

        self.treasury_tx = Some(tx_hash);
        self.touch();
        Ok(())
    }

    pub fn record_treasury_confirmed(&mut self) -> Result<(), TransitionError> {
        self.require("confirm treasury deposit", TransferStatus::Minted)?;

        if self.treasury_tx.is_none() {
            return Err(self.invalid("confirm treasury deposit before broadcast"));
        }

        self.status = TransferStatus::TreasuryFunded;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.require("complete", TransferStatus::TreasuryFunded)?;

        self.status = TransferStatus::Complete;
        self.touch();
        Ok(())
    }

    /// Moves the job to `failed`, remembering where it stopped.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }

        self.failure = Some(JobFailure {
            failed_in: self.status,
            reason: reason.into(),
            failed_at: Utc::now(),
        });
        self.status = TransferStatus::Failed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a resumable error without changing status.
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }
}
