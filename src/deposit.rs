//! Deposits into a chain's GatewayWallet and their finality tracking.
//!
//! Once a deposit is final the depositor's unified balance grows by its
//! amount. That balance is owned by the Gateway contracts and service;
//! locally we only keep enough state to resume finality polling after a
//! restart.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bindings::{IERC20, IGatewayWallet};
use crate::chain::{ChainClient, ChainError, ReceiptWait, await_receipt};
use crate::store::{DepositStore, StoreError};
use crate::updates::{StatusUpdate, publish};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Submitted,
    Included,
    WaitingFinality,
    Finalized,
    Failed,
}

impl DepositStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Included => "included",
            Self::WaitingFinality => "waiting_finality",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deposit transaction on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub chain: String,
    pub depositor: Address,
    pub amount: U256,
    pub approval_tx: Option<TxHash>,
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub status: DepositStatus,
    pub failure: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DepositError {
    #[error("deposit amount must be greater than zero")]
    InvalidAmount,
    #[error("insufficient balance on {chain}: have {balance}, need {required}")]
    InsufficientBalance {
        chain: String,
        balance: U256,
        required: U256,
    },
    #[error("chain unavailable: {0}")]
    ChainUnavailable(#[source] ChainError),
    #[error("deposit transaction reverted: {reason}")]
    Reverted { reason: String },
    /// Nothing is recorded yet; the deposit itself was not sent.
    #[error("approval {tx_hash} on {chain} not yet confirmed, deposit not sent")]
    ApprovalStalled { chain: String, tx_hash: TxHash },
    #[error(transparent)]
    Chain(ChainError),
    #[error("no deposit recorded for {depositor} on {chain}")]
    NoDeposit { chain: String, depositor: Address },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ChainError> for DepositError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Unavailable { .. } => Self::ChainUnavailable(err),
            ChainError::Reverted { reason, .. } => Self::Reverted { reason },
            other => Self::Chain(other),
        }
    }
}

/// Drives deposits into one chain's GatewayWallet.
pub struct DepositMonitor {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn DepositStore>,
    receipts: ReceiptWait,
    poll_interval: Duration,
    updates: broadcast::Sender<StatusUpdate>,
}

impl DepositMonitor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn DepositStore>,
        receipts: ReceiptWait,
        poll_interval: Duration,
        updates: broadcast::Sender<StatusUpdate>,
    ) -> Self {
        Self {
            client,
            store,
            receipts,
            poll_interval,
            updates,
        }
    }

    fn chain(&self) -> &str {
        &self.client.profile().name
    }

    async fn persist(&self, record: &DepositRecord) -> Result<(), DepositError> {
        self.store.save_deposit(record).await?;
        publish(&self.updates, StatusUpdate::Deposit(record.clone()));
        Ok(())
    }

    /// Approves the GatewayWallet and deposits `amount` for `depositor`.
    ///
    /// The sending account pays. When it differs from `depositor` the
    /// deposit is credited with `depositFor`. The record is persisted as
    /// soon as the deposit hash is known so polling can resume after a
    /// crash; a stalled receipt wait returns the record still `submitted`.
    pub async fn start_deposit(
        &self,
        depositor: Address,
        amount: U256,
    ) -> Result<DepositRecord, DepositError> {
        if amount.is_zero() {
            return Err(DepositError::InvalidAmount);
        }

        let profile = self.client.profile();
        let payer = self.client.account();

        let balance = self.client.token_balance(payer).await?;
        if balance < amount {
            return Err(DepositError::InsufficientBalance {
                chain: profile.name.clone(),
                balance,
                required: amount,
            });
        }

        let approve = IERC20::approveCall {
            spender: profile.gateway_wallet,
            amount,
        };
        let approval_tx = self
            .client
            .send_call(
                profile.token,
                Bytes::from(approve.abi_encode()),
                "approve GatewayWallet",
            )
            .await?;
        match await_receipt(self.client.as_ref(), approval_tx, &self.receipts).await {
            Ok(_) => {}
            Err(ChainError::Stalled { waited, .. }) => {
                warn!(chain = %profile.name, %approval_tx, ?waited, "Approval not yet included");
                return Err(DepositError::ApprovalStalled {
                    chain: profile.name.clone(),
                    tx_hash: approval_tx,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let calldata = if depositor == payer {
            IGatewayWallet::depositCall {
                token: profile.token,
                value: amount,
            }
            .abi_encode()
        } else {
            IGatewayWallet::depositForCall {
                token: profile.token,
                depositor,
                value: amount,
            }
            .abi_encode()
        };

        let tx_hash = self
            .client
            .send_call(profile.gateway_wallet, Bytes::from(calldata), "deposit")
            .await?;

        let now = Utc::now();
        let mut record = DepositRecord {
            chain: profile.name.clone(),
            depositor,
            amount,
            approval_tx: Some(approval_tx),
            tx_hash,
            block_number: None,
            confirmations: 0,
            required_confirmations: profile.required_confirmations,
            status: DepositStatus::Submitted,
            failure: None,
            submitted_at: now,
            updated_at: now,
        };
        self.persist(&record).await?;

        info!(chain = %record.chain, %depositor, %amount, %tx_hash, "Deposit submitted");

        match await_receipt(self.client.as_ref(), tx_hash, &self.receipts).await {
            Ok(receipt) => {
                record.block_number = Some(receipt.block_number);
                record.status = DepositStatus::Included;
                record.updated_at = Utc::now();
                self.persist(&record).await?;

                info!(
                    chain = %record.chain,
                    %tx_hash,
                    block = receipt.block_number,
                    "Deposit included"
                );
                Ok(record)
            }
            Err(ChainError::Stalled { waited, .. }) => {
                warn!(chain = %record.chain, %tx_hash, ?waited, "Deposit not yet included");
                Ok(record)
            }
            Err(ChainError::Reverted { reason, .. }) => {
                record.status = DepositStatus::Failed;
                record.failure = Some(reason.clone());
                record.updated_at = Utc::now();
                self.persist(&record).await?;
                Err(DepositError::Reverted { reason })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Recomputes the status of `record` from chain state.
    ///
    /// Read-only: never sends a transaction. Calling it again with no new
    /// blocks returns an identical record.
    pub async fn poll_finality(&self, record: &DepositRecord) -> Result<DepositRecord, DepositError> {
        if record.status.is_terminal() {
            return Ok(record.clone());
        }

        let mut next = record.clone();

        let inclusion_block = match record.block_number {
            Some(block) => block,
            None => match self.client.receipt(record.tx_hash).await? {
                None => return Ok(next),
                Some(receipt) if !receipt.success => {
                    next.status = DepositStatus::Failed;
                    next.failure = Some("deposit transaction reverted".to_string());
                    next.updated_at = Utc::now();
                    return Ok(next);
                }
                Some(receipt) => {
                    next.block_number = Some(receipt.block_number);
                    receipt.block_number
                }
            },
        };

        let current = self.client.block_number().await?;
        next.confirmations = current.saturating_sub(inclusion_block);
        next.status = if next.confirmations >= next.required_confirmations {
            DepositStatus::Finalized
        } else {
            DepositStatus::WaitingFinality
        };

        if next.status != record.status
            || next.confirmations != record.confirmations
            || next.block_number != record.block_number
        {
            next.updated_at = Utc::now();
        }

        debug!(
            chain = %next.chain,
            tx_hash = %next.tx_hash,
            confirmations = next.confirmations,
            required = next.required_confirmations,
            status = %next.status,
            "Polled deposit finality"
        );

        Ok(next)
    }

    /// Polls `record` until it is finalized or failed, persisting and
    /// publishing every change. Connection problems are logged and
    /// polling continues.
    pub async fn watch(&self, mut record: DepositRecord) -> Result<DepositRecord, DepositError> {
        loop {
            match self.poll_finality(&record).await {
                Ok(next) => {
                    if next != record {
                        self.persist(&next).await?;
                        record = next;
                    }
                }
                Err(DepositError::ChainUnavailable(err)) => {
                    warn!(chain = self.chain(), ?err, "Finality poll failed, will retry");
                }
                Err(err) => return Err(err),
            }

            if record.status.is_terminal() {
                info!(
                    chain = %record.chain,
                    tx_hash = %record.tx_hash,
                    status = %record.status,
                    "Deposit settled"
                );
                return Ok(record);
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Picks up the latest deposit for `depositor` on this chain and
    /// watches it to completion.
    pub async fn resume(&self, depositor: Address) -> Result<DepositRecord, DepositError> {
        let record = self
            .store
            .latest_deposit(self.chain(), depositor)
            .await?
            .ok_or_else(|| DepositError::NoDeposit {
                chain: self.chain().to_string(),
                depositor,
            })?;

        info!(chain = self.chain(), %depositor, tx_hash = %record.tx_hash, "Resuming deposit watch");
        self.watch(record).await
    }
}
