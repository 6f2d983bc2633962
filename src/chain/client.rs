//! Per-chain JSON-RPC adapter.
//!
//! [`ChainClient`] is the seam between the transfer flow and a network:
//! balance and block height reads, contract call broadcast, and receipt
//! lookups. [`EvmChainClient`] implements it on top of any
//! [`gateway_evm::Wallet`]; tests use an in-process mock.

use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, warn};

use gateway_evm::{Evm, EvmError, Wallet};

use super::ChainProfile;
use crate::bindings::{IERC20, IGatewayWallet};

/// The parts of a transaction receipt the transfer flow cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("{chain} RPC unavailable after {attempts} attempts")]
    Unavailable {
        chain: String,
        attempts: usize,
        #[source]
        source: EvmError,
    },
    #[error("transaction reverted: {reason}")]
    Reverted {
        tx_hash: Option<TxHash>,
        reason: String,
    },
    #[error("transaction {tx_hash} not confirmed after {waited:?}")]
    Stalled { tx_hash: TxHash, waited: Duration },
    #[error(transparent)]
    Evm(#[from] EvmError),
}

impl ChainError {
    /// Whether the operation may succeed if attempted again later without
    /// changing anything. A stalled transaction is transient because it
    /// may still confirm.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Stalled { .. } => true,
            Self::Reverted { .. } => false,
            Self::Evm(err) => err.is_transient(),
        }
    }
}

/// Access to one chain on behalf of one sending account.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn profile(&self) -> &ChainProfile;

    /// Address that signs and pays for transactions sent by this client.
    fn account(&self) -> Address;

    /// USDC balance of `owner` held in the token contract.
    async fn token_balance(&self, owner: Address) -> Result<U256, ChainError>;

    /// Balance `depositor` has available in this chain's GatewayWallet.
    async fn gateway_balance(&self, depositor: Address) -> Result<U256, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Broadcasts a contract call. Returns once the node has accepted the
    /// transaction; use [`await_receipt`] to wait for inclusion.
    async fn send_call(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, ChainError>;

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError>;
}

/// Bounds for waiting on a broadcast transaction.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptWait {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReceiptWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Waits for `tx_hash` to be included.
///
/// Returns [`ChainError::Stalled`] once `wait.timeout` elapses without a
/// receipt. The transaction may still land later, so callers keep the hash
/// and check again instead of sending a replacement. A receipt with failed
/// status becomes [`ChainError::Reverted`].
pub async fn await_receipt(
    client: &dyn ChainClient,
    tx_hash: TxHash,
    wait: &ReceiptWait,
) -> Result<TxReceipt, ChainError> {
    let started = tokio::time::Instant::now();

    loop {
        match client.receipt(tx_hash).await {
            Ok(Some(receipt)) if receipt.success => return Ok(receipt),
            Ok(Some(_)) => {
                return Err(ChainError::Reverted {
                    tx_hash: Some(tx_hash),
                    reason: "transaction reverted on-chain".to_string(),
                });
            }
            Ok(None) => debug!(%tx_hash, "Receipt not yet available"),
            Err(err) if err.is_transient() => {
                warn!(%tx_hash, ?err, "Receipt lookup failed, will check again");
            }
            Err(err) => return Err(err),
        }

        let waited = started.elapsed();
        if waited >= wait.timeout {
            return Err(ChainError::Stalled { tx_hash, waited });
        }

        tokio::time::sleep(wait.poll_interval).await;
    }
}

/// Retry budget for RPC reads.
#[derive(Debug, Clone, Copy)]
pub struct RpcRetry {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RpcRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RpcRetry {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_min_delay(self.base_delay)
            .with_max_delay(self.base_delay * 16)
            .with_jitter()
    }
}

/// [`ChainClient`] backed by a JSON-RPC wallet.
///
/// Reads are retried with exponential backoff while the failure is a
/// connection problem. Writes are sent exactly once.
pub struct EvmChainClient<W> {
    profile: ChainProfile,
    wallet: W,
    retry: RpcRetry,
}

impl<W: Wallet> EvmChainClient<W> {
    pub fn new(profile: ChainProfile, wallet: W, retry: RpcRetry) -> Self {
        Self {
            profile,
            wallet,
            retry,
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        fetch: F,
    ) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EvmError>>,
    {
        let chain = self.profile.name.as_str();

        fetch
            .retry(self.retry.backoff())
            .when(EvmError::is_transient)
            .notify(|err, dur| {
                warn!(chain, operation, ?err, ?dur, "RPC read failed, retrying");
            })
            .await
            .map_err(|err| {
                if err.is_transient() {
                    ChainError::Unavailable {
                        chain: chain.to_string(),
                        attempts: self.retry.max_attempts,
                        source: err,
                    }
                } else {
                    ChainError::Evm(err)
                }
            })
    }

    async fn view<C>(
        &self,
        contract: Address,
        call: &C,
        operation: &'static str,
    ) -> Result<C::Return, ChainError>
    where
        C: SolCall + Sync,
        C::Return: Send,
    {
        let calldata = Bytes::from(call.abi_encode());

        self.with_retry(operation, || async {
            let raw = self.wallet.call(contract, calldata.clone()).await?;
            Ok::<_, EvmError>(C::abi_decode_returns(&raw)?)
        })
        .await
    }
}

#[async_trait]
impl<W: Wallet> ChainClient for EvmChainClient<W> {
    fn profile(&self) -> &ChainProfile {
        &self.profile
    }

    fn account(&self) -> Address {
        self.wallet.address()
    }

    async fn token_balance(&self, owner: Address) -> Result<U256, ChainError> {
        let call = IERC20::balanceOfCall { account: owner };
        self.view(self.profile.token, &call, "balanceOf").await
    }

    async fn gateway_balance(&self, depositor: Address) -> Result<U256, ChainError> {
        let call = IGatewayWallet::availableBalanceCall {
            token: self.profile.token,
            depositor,
        };
        self.view(self.profile.gateway_wallet, &call, "availableBalance")
            .await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.with_retry("block_number", || self.wallet.block_number())
            .await
    }

    async fn send_call(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, ChainError> {
        self.wallet
            .submit(contract, calldata, note)
            .await
            .map_err(|err| match err {
                EvmError::Revert { reason } => ChainError::Reverted {
                    tx_hash: None,
                    reason,
                },
                other => ChainError::Evm(other),
            })
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        let receipt = self
            .with_retry("receipt", || self.wallet.receipt(tx_hash))
            .await?;

        Ok(receipt.and_then(|receipt| {
            Some(TxReceipt {
                tx_hash,
                block_number: receipt.block_number?,
                success: receipt.status(),
            })
        }))
    }
}
