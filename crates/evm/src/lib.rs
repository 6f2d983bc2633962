//! EVM chain access for the gateway treasury workspace.
//!
//! This crate provides two traits for interacting with EVM chains:
//!
//! - [`Evm`]: read-only chain access. Provides the underlying provider,
//!   block height and receipt lookups, and a `call` method that decodes
//!   Solidity revert data into a readable reason.
//!
//! - [`Wallet`]: extends `Evm` with a sending identity. Writes are
//!   broadcast with [`Wallet::submit`], which returns as soon as the node
//!   accepts the transaction. Waiting for inclusion is left to the caller
//!   so that a slow transaction can be re-checked by hash instead of being
//!   sent a second time.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, TxHash};
use alloy::providers::Provider;
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::transports::{RpcError, TransportErrorKind};
use async_trait::async_trait;

pub mod error_decoding;

#[cfg(feature = "local-signer")]
pub mod local;

/// Errors that can occur during EVM operations.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("transport error: {0}")]
    Transport(#[from] RpcError<TransportErrorKind>),
    #[error("execution reverted: {reason}")]
    Revert { reason: String },
    #[error("failed to decode return data: {0}")]
    Decode(#[from] alloy::sol_types::Error),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(#[from] alloy::signers::k256::ecdsa::Error),
}

impl EvmError {
    /// Whether the error came from the connection to the node rather than
    /// from the chain itself. Only these are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(err) if !err.is_error_resp())
    }
}

/// Read-only EVM chain access with error-decoded view calls.
///
/// Implementations only need to supply the provider; the query methods
/// have default implementations on top of it.
#[async_trait]
pub trait Evm: Send + Sync + 'static {
    /// The provider type used for chain access.
    type Provider: Provider + Clone + Send + Sync;

    /// Returns the underlying provider for direct chain queries.
    fn provider(&self) -> &Self::Provider;

    /// Execute a view call, decoding revert data into [`EvmError::Revert`].
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        let tx = TransactionRequest::default()
            .to(contract)
            .input(calldata.into());

        self.provider()
            .call(tx)
            .await
            .map_err(error_decoding::decode_rpc_error)
    }

    /// Latest block height seen by the node.
    async fn block_number(&self) -> Result<u64, EvmError> {
        Ok(self.provider().get_block_number().await?)
    }

    /// Receipt for `tx_hash`, or `None` while it is still pending.
    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>, EvmError> {
        Ok(self.provider().get_transaction_receipt(tx_hash).await?)
    }
}

/// Signing wallet on an EVM chain.
///
/// Extends [`Evm`] with a wallet identity (address) and transaction
/// broadcast. Implementations own key management.
#[async_trait]
pub trait Wallet: Evm {
    /// Returns the address this wallet sends from.
    fn address(&self) -> Address;

    /// Broadcast a contract call and return its hash without waiting for
    /// inclusion.
    ///
    /// - `contract`: target contract address
    /// - `calldata`: ABI-encoded function call
    /// - `note`: human-readable operation description used in logs
    ///
    /// A call that fails gas estimation surfaces as [`EvmError::Revert`]
    /// and nothing is broadcast.
    async fn submit(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, EvmError>;
}

#[async_trait]
impl<T: Evm> Evm for Arc<T> {
    type Provider = T::Provider;

    fn provider(&self) -> &Self::Provider {
        (**self).provider()
    }

    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        (**self).call(contract, calldata).await
    }

    async fn block_number(&self) -> Result<u64, EvmError> {
        (**self).block_number().await
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TransactionReceipt>, EvmError> {
        (**self).receipt(tx_hash).await
    }
}

#[async_trait]
impl<T: Wallet> Wallet for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn submit(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, EvmError> {
        (**self).submit(contract, calldata, note).await
    }
}
