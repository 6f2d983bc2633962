use alloy::primitives::TxHash;
use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::deposit::DepositStatus;
use crate::job::TransferStatus;
use crate::updates::StatusUpdate;

mod deposit;
mod transfer;

/// Drains every update published so far and returns the distinct
/// consecutive transfer statuses, in order.
fn transfer_statuses(receiver: &mut broadcast::Receiver<StatusUpdate>) -> Vec<TransferStatus> {
    let mut statuses = Vec::new();
    while let Ok(update) = receiver.try_recv() {
        if let StatusUpdate::Transfer(job) = update {
            if statuses.last() != Some(&job.status) {
                statuses.push(job.status);
            }
        }
    }
    statuses
}

fn deposit_statuses(
    receiver: &mut broadcast::Receiver<StatusUpdate>,
) -> Vec<(TxHash, DepositStatus, u64)> {
    let mut statuses = Vec::new();
    while let Ok(update) = receiver.try_recv() {
        if let StatusUpdate::Deposit(record) = update {
            statuses.push((record.tx_hash, record.status, record.confirmations));
        }
    }
    statuses
}

fn attested_body(transfer_id: &str) -> Value {
    json!({
        "transferId": transfer_id,
        "status": "complete",
        "attestation": "0xa77e57a710",
        "signature": "0x5169",
        "fees": { "total": "1.01" },
        "expirationBlock": "9000"
    })
}

/// Accepts the burn intent and reports it pending.
async fn mock_accepted<'a>(server: &'a MockServer, transfer_id: &str) -> Mock<'a> {
    let body = json!([{ "transferId": transfer_id, "status": "pending" }]);
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/transfer");
            then.status(201).json_body(body);
        })
        .await
}

async fn mock_attested<'a>(server: &'a MockServer, transfer_id: &str) -> Mock<'a> {
    let body = attested_body(transfer_id);
    let path = format!("/v1/transfer/{transfer_id}");
    server
        .mock_async(|when, then| {
            when.method(GET).path(path);
            then.status(200).json_body(body);
        })
        .await
}
