//! Contract error decoding utilities.
//!
//! Turns Solidity revert data carried in JSON-RPC error responses into
//! human-readable reasons. Standard `Error(string)` and `Panic(uint256)`
//! payloads are decoded; anything else is reported by its raw bytes.

use alloy::hex;
use alloy::transports::{RpcError, TransportErrorKind};
use tracing::debug;

use crate::EvmError;

/// Converts an RPC failure into an [`EvmError`], extracting a revert
/// reason when the node reported one.
pub fn decode_rpc_error(err: RpcError<TransportErrorKind>) -> EvmError {
    let Some(payload) = err.as_error_resp() else {
        return EvmError::Transport(err);
    };

    if let Some(revert_data) = payload.as_revert_data() {
        return EvmError::Revert {
            reason: revert_reason(&revert_data),
        };
    }

    if payload.message.contains("revert") {
        debug!(message = %payload.message, "Revert without data");
        return EvmError::Revert {
            reason: reason_from_message(&payload.message),
        };
    }

    EvmError::Transport(err)
}

/// Decodes raw revert data into a readable reason.
pub fn revert_reason(data: &[u8]) -> String {
    if data.is_empty() {
        return "execution reverted".to_string();
    }

    alloy::sol_types::decode_revert_reason(data)
        .unwrap_or_else(|| format!("custom error {}", hex::encode_prefixed(data)))
}

fn reason_from_message(message: &str) -> String {
    let reason = message
        .trim_start_matches("execution reverted")
        .trim_start_matches(':')
        .trim();

    if reason.is_empty() {
        "execution reverted".to_string()
    } else {
        reason.to_string()
    }
}
