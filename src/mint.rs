//! Redeems an attestation on the destination chain's GatewayMinter.

use std::sync::Arc;

use alloy::primitives::{Bytes, TxHash};
use alloy::sol_types::SolCall;
use tracing::{info, warn};

use crate::attestation::Attestation;
use crate::bindings::IGatewayMinter;
use crate::chain::{ChainClient, ChainError, ReceiptWait, TxReceipt, await_receipt};

#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// Terminal for this attestation. Typical causes are an expired
    /// `maxBlockHeight`, an attestation that was already consumed, or a
    /// destination account without gas.
    #[error("mint reverted: {reason}")]
    MintReverted { reason: String },
    #[error("mint {tx_hash} not yet confirmed")]
    Stalled { tx_hash: TxHash },
    #[error(transparent)]
    Chain(ChainError),
}

impl MintError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::MintReverted { .. } => false,
            Self::Stalled { .. } => true,
            Self::Chain(err) => err.is_transient(),
        }
    }
}

impl From<ChainError> for MintError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Reverted { reason, .. } => Self::MintReverted { reason },
            ChainError::Stalled { tx_hash, .. } => Self::Stalled { tx_hash },
            other => Self::Chain(other),
        }
    }
}

pub struct MintExecutor {
    client: Arc<dyn ChainClient>,
    receipts: ReceiptWait,
}

impl MintExecutor {
    pub fn new(client: Arc<dyn ChainClient>, receipts: ReceiptWait) -> Self {
        Self { client, receipts }
    }

    /// Sends `gatewayMint` without waiting for inclusion.
    pub async fn broadcast(&self, attestation: &Attestation) -> Result<TxHash, MintError> {
        let profile = self.client.profile();
        let call = IGatewayMinter::gatewayMintCall {
            attestationPayload: attestation.payload.clone(),
            signature: attestation.signature.clone(),
        };

        let tx_hash = self
            .client
            .send_call(
                profile.gateway_minter,
                Bytes::from(call.abi_encode()),
                "gatewayMint",
            )
            .await
            .inspect_err(|err| {
                warn!(chain = %profile.name, transfer_id = %attestation.transfer_id, ?err, "Mint failed");
            })?;

        info!(
            chain = %profile.name,
            transfer_id = %attestation.transfer_id,
            %tx_hash,
            explorer = %profile.explorer_tx_url(tx_hash),
            "Mint broadcast"
        );

        Ok(tx_hash)
    }

    /// Waits for a previously broadcast mint. A timeout surfaces as
    /// [`MintError::Stalled`]; check the same hash again later.
    pub async fn confirm(&self, tx_hash: TxHash) -> Result<TxReceipt, MintError> {
        let receipt = await_receipt(self.client.as_ref(), tx_hash, &self.receipts).await?;

        info!(chain = %self.client.profile().name, %tx_hash, block = receipt.block_number, "Mint confirmed");
        Ok(receipt)
    }

    pub async fn mint(&self, attestation: &Attestation) -> Result<TxHash, MintError> {
        let tx_hash = self.broadcast(attestation).await?;
        self.confirm(tx_hash).await?;
        Ok(tx_hash)
    }
}
