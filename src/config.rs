//! Runtime configuration.
//!
//! Settings come from two TOML files: a plaintext config with the chain
//! table and service endpoints, and a secrets file with the signing key.
//! Both are combined into a validated [`Ctx`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, U256};
use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::Level;
use url::Url;

use gateway_evm::local::LocalWallet;

use crate::amount::{Usdc, UsdcConversionError};
use crate::attestation::{AttestationClient, AttestationConfig, AttestationError};
use crate::chain::{
    ChainClient, ChainProfile, ChainRegistry, EvmChainClient, ReceiptWait, RegistryError,
    RpcRetry,
};
use crate::coordinator::{CoordinatorCtx, TransferCoordinator};
use crate::deposit::DepositMonitor;
use crate::signer::LocalIntentSigner;
use crate::store::{DepositStore, JobStore};
use crate::updates::StatusUpdate;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long, env = "GATEWAY_CONFIG")]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long, env = "GATEWAY_SECRETS")]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    attestation: AttestationSection,
    #[serde(default)]
    deposit: DepositSection,
    #[serde(default)]
    receipts: ReceiptSection,
    #[serde(default)]
    rpc_retry: RpcRetrySection,
    chains: Vec<ChainProfile>,
}

#[derive(Deserialize)]
struct AttestationSection {
    base_url: Url,
    max_fee: Option<Usdc>,
    poll_interval_secs: Option<u64>,
    max_attempts: Option<usize>,
    request_timeout_secs: Option<u64>,
    max_block_height: Option<U256>,
}

#[derive(Deserialize, Default)]
struct DepositSection {
    poll_interval_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ReceiptSection {
    timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RpcRetrySection {
    max_attempts: Option<usize>,
    base_delay_ms: Option<u64>,
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    evm: EvmSecrets,
}

#[derive(Deserialize)]
struct EvmSecrets {
    private_key: PrivateKey,
}

/// Raw signing key. Never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(B256);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Default `attestation.max_fee`: 2.01 USDC.
fn default_max_fee() -> Usdc {
    Usdc::new(Decimal::new(201, 2))
}

// ===== Runtime types (assembled from Config + Secrets) =====

/// Combined runtime context for the CLI.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub database_url: String,
    pub log_level: LogLevel,
    pub attestation: AttestationConfig,
    pub max_fee: Usdc,
    pub max_block_height: U256,
    pub deposit_poll_interval: Duration,
    pub receipts: ReceiptWait,
    pub rpc_retry: RpcRetry,
    pub registry: Arc<ChainRegistry>,
    private_key: PrivateKey,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL lets a `status` invocation read while a transfer worker writes.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Concurrent workers for different jobs share one file; wait for the
    // writer lock instead of failing with "database is locked".
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("invalid chain table: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to derive address from evm.private_key")]
    PrivateKeyDerivation(#[source] alloy::signers::k256::ecdsa::Error),
    #[error("invalid attestation.max_fee: {0}")]
    InvalidMaxFee(#[from] UsdcConversionError),
    #[error("attestation.max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("failed to build attestation client: {0}")]
    Attestation(#[from] AttestationError),
}

impl Ctx {
    pub async fn load_files(config: &Path, secrets: &Path) -> Result<Self, ConfigError> {
        let config_str = tokio::fs::read_to_string(config).await?;
        let secrets_str = tokio::fs::read_to_string(secrets).await?;
        Self::from_toml(&config_str, &secrets_str)
    }

    pub fn from_toml(config_toml: &str, secrets_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;
        let secrets: Secrets = toml::from_str(secrets_toml)?;

        PrivateKeySigner::from_bytes(&secrets.evm.private_key.0)
            .map_err(ConfigError::PrivateKeyDerivation)?;

        let registry = ChainRegistry::new(config.chains)?;

        let attestation = config.attestation;
        let max_fee = attestation.max_fee.unwrap_or_else(default_max_fee);
        max_fee.to_base_units()?;

        let max_attempts = attestation.max_attempts.unwrap_or(60);
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let receipt_defaults = ReceiptWait::default();
        let retry_defaults = RpcRetry::default();

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            attestation: AttestationConfig {
                base_url: attestation.base_url,
                poll_interval: Duration::from_secs(attestation.poll_interval_secs.unwrap_or(2)),
                max_attempts,
                request_timeout: Duration::from_secs(
                    attestation.request_timeout_secs.unwrap_or(30),
                ),
            },
            max_fee,
            max_block_height: attestation.max_block_height.unwrap_or(U256::MAX),
            deposit_poll_interval: Duration::from_secs(
                config.deposit.poll_interval_secs.unwrap_or(12),
            ),
            receipts: ReceiptWait {
                timeout: config
                    .receipts
                    .timeout_secs
                    .map_or(receipt_defaults.timeout, Duration::from_secs),
                poll_interval: config
                    .receipts
                    .poll_interval_secs
                    .map_or(receipt_defaults.poll_interval, Duration::from_secs),
            },
            rpc_retry: RpcRetry {
                max_attempts: config
                    .rpc_retry
                    .max_attempts
                    .unwrap_or(retry_defaults.max_attempts),
                base_delay: config
                    .rpc_retry
                    .base_delay_ms
                    .map_or(retry_defaults.base_delay, Duration::from_millis),
            },
            registry: Arc::new(registry),
            private_key: secrets.evm.private_key,
        })
    }

    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        PrivateKeySigner::from_bytes(&self.private_key.0).map_err(ConfigError::PrivateKeyDerivation)
    }

    pub fn intent_signer(&self) -> Result<LocalIntentSigner, ConfigError> {
        Ok(LocalIntentSigner::new(self.signer()?))
    }

    /// Maximum fee in USDC base units.
    pub fn max_fee_units(&self) -> Result<U256, ConfigError> {
        Ok(self.max_fee.to_base_units()?)
    }

    pub fn chain_client(&self, chain: &str) -> Result<Arc<dyn ChainClient>, ConfigError> {
        let profile = self.registry.get(chain)?.clone();
        let rpc_url = profile
            .rpc_url()
            .cloned()
            .ok_or_else(|| RegistryError::MissingRpcUrl(profile.name.clone()))?;

        let wallet = LocalWallet::connect_http(rpc_url, self.signer()?);
        Ok(Arc::new(EvmChainClient::new(profile, wallet, self.rpc_retry)))
    }

    pub fn chain_clients(&self) -> Result<HashMap<String, Arc<dyn ChainClient>>, ConfigError> {
        self.registry
            .iter()
            .map(|profile| {
                let client = self.chain_client(&profile.name)?;
                Ok::<_, ConfigError>((profile.name.clone(), client))
            })
            .collect()
    }

    pub fn deposit_monitor(
        &self,
        chain: &str,
        store: Arc<dyn DepositStore>,
        updates: broadcast::Sender<StatusUpdate>,
    ) -> Result<DepositMonitor, ConfigError> {
        Ok(DepositMonitor::new(
            self.chain_client(chain)?,
            store,
            self.receipts,
            self.deposit_poll_interval,
            updates,
        ))
    }

    pub fn coordinator(
        &self,
        store: Arc<dyn JobStore>,
        updates: broadcast::Sender<StatusUpdate>,
    ) -> Result<TransferCoordinator, ConfigError> {
        Ok(TransferCoordinator::new(CoordinatorCtx {
            registry: self.registry.clone(),
            clients: self.chain_clients()?,
            signer: Arc::new(self.intent_signer()?),
            attestation: AttestationClient::new(&self.attestation)?,
            store,
            receipts: self.receipts,
            max_fee: self.max_fee_units()?,
            max_block_height: self.max_block_height,
            updates,
        }))
    }
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("gateway_treasury={level},gateway_evm={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
