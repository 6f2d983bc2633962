//! Moves freshly minted USDC into the destination treasury contract.
//!
//! Neither failure is retried here: a revert on a given amount reverts
//! identically on retry, and an unreachable node is left to the caller.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use tracing::info;

use crate::bindings::{IERC20, ITreasury};
use crate::chain::{ChainClient, ChainError, ReceiptWait, TxReceipt, await_receipt};

#[derive(Debug, thiserror::Error)]
pub enum TreasuryError {
    #[error("no treasury configured for {chain}")]
    MissingTreasury { chain: String },
    #[error("treasury unreachable: {0}")]
    TreasuryUnreachable(#[source] ChainError),
    #[error("treasury rejected deposit: {reason}")]
    TreasuryRejected { reason: String },
    #[error("treasury transaction {tx_hash} not yet confirmed")]
    Stalled { tx_hash: TxHash },
}

impl TreasuryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Stalled { .. } => true,
            Self::TreasuryUnreachable(err) => err.is_transient(),
            Self::MissingTreasury { .. } | Self::TreasuryRejected { .. } => false,
        }
    }
}

impl From<ChainError> for TreasuryError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Reverted { reason, .. } => Self::TreasuryRejected { reason },
            ChainError::Stalled { tx_hash, .. } => Self::Stalled { tx_hash },
            other => Self::TreasuryUnreachable(other),
        }
    }
}

pub struct TreasuryForwarder {
    client: Arc<dyn ChainClient>,
    receipts: ReceiptWait,
}

impl TreasuryForwarder {
    pub fn new(client: Arc<dyn ChainClient>, receipts: ReceiptWait) -> Self {
        Self { client, receipts }
    }

    pub fn treasury(&self) -> Result<Address, TreasuryError> {
        let profile = self.client.profile();
        profile
            .treasury
            .ok_or_else(|| TreasuryError::MissingTreasury {
                chain: profile.name.clone(),
            })
    }

    /// Approves the treasury to pull `amount`.
    pub async fn submit_approval(&self, amount: U256) -> Result<TxHash, TreasuryError> {
        let treasury = self.treasury()?;
        let call = IERC20::approveCall {
            spender: treasury,
            amount,
        };

        Ok(self
            .client
            .send_call(
                self.client.profile().token,
                Bytes::from(call.abi_encode()),
                "approve treasury",
            )
            .await?)
    }

    pub async fn submit_deposit(&self, amount: U256) -> Result<TxHash, TreasuryError> {
        let treasury = self.treasury()?;
        let call = ITreasury::depositToTreasuryCall { amount };

        let tx_hash = self
            .client
            .send_call(treasury, Bytes::from(call.abi_encode()), "depositToTreasury")
            .await?;

        info!(chain = %self.client.profile().name, %treasury, %amount, %tx_hash, "Treasury deposit sent");
        Ok(tx_hash)
    }

    pub async fn confirm(&self, tx_hash: TxHash) -> Result<TxReceipt, TreasuryError> {
        Ok(await_receipt(self.client.as_ref(), tx_hash, &self.receipts).await?)
    }

    /// Approves then deposits `amount`, waiting for each transaction.
    pub async fn deposit(&self, amount: U256) -> Result<TxHash, TreasuryError> {
        let approval = self.submit_approval(amount).await?;
        self.confirm(approval).await?;

        let tx_hash = self.submit_deposit(amount).await?;
        self.confirm(tx_hash).await?;

        Ok(tx_hash)
    }
}
