//! Local private-key wallet.
//!
//! `LocalWallet` wraps an HTTP provider with an embedded `EthereumWallet`
//! filler and submits transactions directly. Suitable for testnets and
//! operator scripts where the key lives in the secrets file.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, Bytes, TxHash};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tracing::info;
use url::Url;

use crate::{Evm, EvmError, Wallet, error_decoding};

/// Wallet that signs locally and submits through its own provider.
#[derive(Clone)]
pub struct LocalWallet {
    provider: DynProvider,
    signer: PrivateKeySigner,
}

impl LocalWallet {
    /// Connects to `rpc_url` with `signer` installed as the provider's wallet.
    pub fn connect_http(rpc_url: Url, signer: PrivateKeySigner) -> Self {
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer.clone()))
            .connect_http(rpc_url)
            .erased();

        Self { provider, signer }
    }

    /// Builds a wallet from a raw 32-byte private key.
    pub fn from_private_key(rpc_url: Url, private_key: &B256) -> Result<Self, EvmError> {
        let signer = PrivateKeySigner::from_bytes(private_key)?;
        Ok(Self::connect_http(rpc_url, signer))
    }
}

#[async_trait]
impl Evm for LocalWallet {
    type Provider = DynProvider;

    fn provider(&self) -> &DynProvider {
        &self.provider
    }
}

#[async_trait]
impl Wallet for LocalWallet {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn submit(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, EvmError> {
        info!(%contract, note, "Submitting local contract call");

        let tx = TransactionRequest::default()
            .from(self.address())
            .to(contract)
            .input(calldata.into());

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(error_decoding::decode_rpc_error)?;

        let tx_hash = *pending.tx_hash();
        info!(%tx_hash, note, "Transaction submitted");

        Ok(tx_hash)
    }
}
