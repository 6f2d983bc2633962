//! Signing boundary for transfer intents.
//!
//! Key custody lives outside this crate. The coordinator only needs
//! something that turns EIP-712 typed data into a signature; the local
//! private-key signer is the implementation used by the CLI.

use alloy::dyn_abi::TypedData;
use alloy::primitives::{Address, Bytes, Signature, SignatureError};
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::intent::TransferIntent;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("failed to hash typed data: {0}")]
    TypedData(#[from] alloy::dyn_abi::Error),
    #[error("signing failed: {0}")]
    Signing(#[from] alloy::signers::Error),
    #[error("signature does not recover to an address: {0}")]
    Recovery(#[from] SignatureError),
    #[error("signature recovers to {recovered}, intent names {expected} as signer")]
    SignerMismatch {
        expected: Address,
        recovered: Address,
    },
}

/// Anything able to produce an EIP-712 signature for the depositor.
#[async_trait]
pub trait IntentSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Signature, SignerError>;
}

/// Signs with a private key held in process memory.
#[derive(Debug, Clone)]
pub struct LocalIntentSigner(PrivateKeySigner);

impl LocalIntentSigner {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self(signer)
    }
}

#[async_trait]
impl IntentSigner for LocalIntentSigner {
    fn address(&self) -> Address {
        self.0.address()
    }

    async fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Signature, SignerError> {
        let hash = typed_data.eip712_signing_hash()?;
        Ok(self.0.sign_hash(&hash).await?)
    }
}

/// A transfer intent together with the depositor's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedIntent {
    pub intent: TransferIntent,
    pub signature: Bytes,
}

/// Signs `intent` and checks the signature recovers to the intent's
/// declared signer before handing it out.
pub async fn sign_intent(
    signer: &dyn IntentSigner,
    intent: TransferIntent,
) -> Result<SignedIntent, SignerError> {
    let signature = signer.sign_typed_data(&intent.typed_data()).await?;
    let recovered = signature.recover_address_from_prehash(&intent.signing_hash())?;

    let expected = intent.signer();
    if recovered != expected {
        return Err(SignerError::SignerMismatch {
            expected,
            recovered,
        });
    }

    info!(signer = %recovered, salt = %intent.salt, "Signed transfer intent");

    Ok(SignedIntent {
        intent,
        signature: Bytes::from(signature.as_bytes()),
    })
}
