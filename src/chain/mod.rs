//! Static per-chain network profiles and the registry that validates them.
//!
//! A [`ChainProfile`] describes everything the transfer flow needs to know
//! about one network: its Gateway domain id (the attestation service's own
//! numbering, unrelated to the EVM chain id), the USDC token, the Gateway
//! wallet and minter contracts, the optional destination treasury, and how
//! many confirmations a deposit needs before it counts as final.

use std::collections::{BTreeMap, HashSet};

use alloy::primitives::{Address, TxHash};
use serde::Deserialize;
use url::Url;

mod client;

pub use client::{
    ChainClient, ChainError, EvmChainClient, ReceiptWait, RpcRetry, TxReceipt, await_receipt,
};

/// Immutable description of one supported network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainProfile {
    pub name: String,
    pub chain_id: u64,
    pub domain: u32,
    pub token: Address,
    pub gateway_wallet: Address,
    pub gateway_minter: Address,
    #[serde(default)]
    pub treasury: Option<Address>,
    pub rpc_urls: Vec<Url>,
    pub required_confirmations: u64,
    pub explorer_url: Url,
}

impl ChainProfile {
    /// Primary RPC endpoint. Registry validation rejects profiles without one.
    pub fn rpc_url(&self) -> Option<&Url> {
        self.rpc_urls.first()
    }

    pub fn explorer_tx_url(&self, tx_hash: TxHash) -> String {
        format!(
            "{}/tx/{tx_hash}",
            self.explorer_url.as_str().trim_end_matches('/')
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("chain registry is empty")]
    Empty,
    #[error("chain name {0} is configured more than once")]
    DuplicateName(String),
    #[error("domain id {domain} is shared by {first} and {second}")]
    DuplicateDomain {
        domain: u32,
        first: String,
        second: String,
    },
    #[error("chain id {chain_id} is shared by {first} and {second}")]
    DuplicateChainId {
        chain_id: u64,
        first: String,
        second: String,
    },
    #[error("chain {0} has no RPC endpoint")]
    MissingRpcUrl(String),
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    #[error("no chain is configured for domain {0}")]
    UnknownDomain(u32),
}

/// Lookup table of validated [`ChainProfile`]s keyed by name.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    profiles: BTreeMap<String, ChainProfile>,
}

impl ChainRegistry {
    pub fn new(profiles: Vec<ChainProfile>) -> Result<Self, RegistryError> {
        if profiles.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut by_name: BTreeMap<String, ChainProfile> = BTreeMap::new();
        let mut domains: BTreeMap<u32, String> = BTreeMap::new();
        let mut chain_ids: BTreeMap<u64, String> = BTreeMap::new();

        for profile in profiles {
            if profile.rpc_urls.is_empty() {
                return Err(RegistryError::MissingRpcUrl(profile.name));
            }

            if by_name.contains_key(&profile.name) {
                return Err(RegistryError::DuplicateName(profile.name));
            }

            if let Some(first) = domains.get(&profile.domain) {
                return Err(RegistryError::DuplicateDomain {
                    domain: profile.domain,
                    first: first.clone(),
                    second: profile.name,
                });
            }

            if let Some(first) = chain_ids.get(&profile.chain_id) {
                return Err(RegistryError::DuplicateChainId {
                    chain_id: profile.chain_id,
                    first: first.clone(),
                    second: profile.name,
                });
            }

            domains.insert(profile.domain, profile.name.clone());
            chain_ids.insert(profile.chain_id, profile.name.clone());
            by_name.insert(profile.name.clone(), profile);
        }

        Ok(Self { profiles: by_name })
    }

    pub fn get(&self, name: &str) -> Result<&ChainProfile, RegistryError> {
        self.profiles
            .get(name)
            .ok_or_else(|| RegistryError::UnknownChain(name.to_string()))
    }

    pub fn by_domain(&self, domain: u32) -> Result<&ChainProfile, RegistryError> {
        self.profiles
            .values()
            .find(|profile| profile.domain == domain)
            .ok_or(RegistryError::UnknownDomain(domain))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainProfile> {
        self.profiles.values()
    }

    pub fn names(&self) -> HashSet<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}
