//! Transfer authorizations ("burn intents") and their EIP-712 form.
//!
//! The struct layout below is part of the wire contract: the attestation
//! service and the destination minter both recompute the EIP-712 hash from
//! these exact field names, types, and order.

use std::sync::Arc;

use alloy::dyn_abi::TypedData;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct, eip712_domain};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainRegistry, RegistryError};

/// Only version of the transfer spec the Gateway contracts accept.
pub const TRANSFER_SPEC_VERSION: u32 = 1;

sol! {
    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TransferSpec {
        uint32 version;
        uint32 sourceDomain;
        uint32 destinationDomain;
        bytes32 sourceContract;
        bytes32 destinationContract;
        bytes32 sourceToken;
        bytes32 destinationToken;
        bytes32 sourceDepositor;
        bytes32 destinationRecipient;
        bytes32 sourceSigner;
        bytes32 destinationCaller;
        uint256 value;
        bytes32 salt;
        bytes hookData;
    }

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct BurnIntent {
        uint256 maxBlockHeight;
        uint256 maxFee;
        TransferSpec spec;
    }
}

/// EIP-712 domain of the Gateway wallet. It carries no chain id and no
/// verifying contract, so one signature is valid across every domain.
pub fn gateway_domain() -> Eip712Domain {
    eip712_domain! {
        name: "GatewayWallet",
        version: "1",
    }
}

/// A fully populated transfer authorization, ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferIntent {
    pub max_block_height: U256,
    pub max_fee: U256,
    pub version: u32,
    pub source_domain: u32,
    pub destination_domain: u32,
    pub source_contract: B256,
    pub destination_contract: B256,
    pub source_token: B256,
    pub destination_token: B256,
    pub source_depositor: B256,
    pub destination_recipient: B256,
    pub source_signer: B256,
    pub destination_caller: B256,
    pub value: U256,
    pub salt: B256,
    pub hook_data: Bytes,
}

impl TransferIntent {
    pub fn to_burn_intent(&self) -> BurnIntent {
        BurnIntent {
            maxBlockHeight: self.max_block_height,
            maxFee: self.max_fee,
            spec: TransferSpec {
                version: self.version,
                sourceDomain: self.source_domain,
                destinationDomain: self.destination_domain,
                sourceContract: self.source_contract,
                destinationContract: self.destination_contract,
                sourceToken: self.source_token,
                destinationToken: self.destination_token,
                sourceDepositor: self.source_depositor,
                destinationRecipient: self.destination_recipient,
                sourceSigner: self.source_signer,
                destinationCaller: self.destination_caller,
                value: self.value,
                salt: self.salt,
                hookData: self.hook_data.clone(),
            },
        }
    }

    /// EIP-712 digest the depositor signs.
    pub fn signing_hash(&self) -> B256 {
        self.to_burn_intent()
            .eip712_signing_hash(&gateway_domain())
    }

    /// Domain, types and message in the JSON shape wallets expect for
    /// `eth_signTypedData_v4`.
    pub fn typed_data(&self) -> TypedData {
        TypedData::from_struct(&self.to_burn_intent(), Some(gateway_domain()))
    }

    /// Address expected to have produced the signature.
    pub fn signer(&self) -> Address {
        Address::from_word(self.source_signer)
    }

    pub fn depositor(&self) -> Address {
        Address::from_word(self.source_depositor)
    }

    pub fn recipient(&self) -> Address {
        Address::from_word(self.destination_recipient)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntentError {
    #[error(transparent)]
    UnknownChain(#[from] RegistryError),
    #[error("transfer amount must be greater than zero")]
    InvalidAmount,
    #[error("source and destination are both {0}")]
    SameChain(String),
}

/// Builds [`TransferIntent`]s from registry data.
#[derive(Debug, Clone)]
pub struct IntentBuilder {
    registry: Arc<ChainRegistry>,
    max_block_height: U256,
}

impl IntentBuilder {
    pub fn new(registry: Arc<ChainRegistry>, max_block_height: U256) -> Self {
        Self {
            registry,
            max_block_height,
        }
    }

    /// Populates an intent moving `value` base units of the depositor's
    /// unified balance to `recipient` on `destination`.
    ///
    /// Every call draws a fresh random salt, so two intents built from the
    /// same arguments never collide at the attestation service.
    pub fn build(
        &self,
        source: &str,
        destination: &str,
        depositor: Address,
        recipient: Address,
        value: U256,
        max_fee: U256,
    ) -> Result<TransferIntent, IntentError> {
        let source = self.registry.get(source)?;
        let destination = self.registry.get(destination)?;

        if value.is_zero() {
            return Err(IntentError::InvalidAmount);
        }

        if source.domain == destination.domain {
            return Err(IntentError::SameChain(source.name.clone()));
        }

        let salt = B256::from(rand::random::<[u8; 32]>());

        debug!(
            source = %source.name,
            destination = %destination.name,
            %depositor,
            %recipient,
            %value,
            %salt,
            "Built transfer intent"
        );

        Ok(TransferIntent {
            max_block_height: self.max_block_height,
            max_fee,
            version: TRANSFER_SPEC_VERSION,
            source_domain: source.domain,
            destination_domain: destination.domain,
            source_contract: source.gateway_wallet.into_word(),
            destination_contract: destination.gateway_minter.into_word(),
            source_token: source.token.into_word(),
            destination_token: destination.token.into_word(),
            source_depositor: depositor.into_word(),
            destination_recipient: recipient.into_word(),
            source_signer: depositor.into_word(),
            destination_caller: B256::ZERO,
            value,
            salt,
            hook_data: Bytes::new(),
        })
    }
}
