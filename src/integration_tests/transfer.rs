use std::time::Duration;

use alloy::primitives::U256;
use alloy::sol_types::SolCall;
use httpmock::prelude::*;
use serde_json::json;
use tracing_test::traced_test;

use super::{attested_body, mock_accepted, mock_attested, transfer_statuses};
use crate::attestation::AttestationError;
use crate::bindings::{IERC20, IGatewayMinter, ITreasury};
use crate::coordinator::CoordinatorError;
use crate::job::TransferStatus;
use crate::mint::MintError;
use crate::store::JobStore;
use crate::test_utils::{GATEWAY_MINTER, TREASURY, TransferHarness};

const AMOUNT: u64 = 5_000_000;

#[tokio::test]
#[traced_test]
async fn transfer_mints_and_funds_treasury() {
    let harness = TransferHarness::new().await;
    let submit = mock_accepted(&harness.server, "tr-b").await;
    let check = mock_attested(&harness.server, "tr-b").await;
    let mut receiver = harness.coordinator.subscribe();

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let job = harness.coordinator.run(job.id).await.unwrap();

    assert_eq!(job.status, TransferStatus::Complete);
    assert_eq!(job.transfer_id.as_deref(), Some("tr-b"));
    assert!(job.mint_tx.is_some());
    assert!(job.treasury_tx.is_some());
    submit.assert_hits_async(1).await;
    check.assert_hits_async(1).await;

    assert!(harness.source.sent_calls().is_empty());
    let calls = harness.destination.sent_calls();
    assert_eq!(
        harness.destination.sent_selectors(),
        vec![
            IGatewayMinter::gatewayMintCall::SELECTOR,
            IERC20::approveCall::SELECTOR,
            ITreasury::depositToTreasuryCall::SELECTOR,
        ]
    );

    assert_eq!(calls[0].contract, GATEWAY_MINTER);
    let mint = IGatewayMinter::gatewayMintCall::abi_decode(&calls[0].calldata).unwrap();
    assert_eq!(mint.attestationPayload.to_vec(), vec![0xa7, 0x7e, 0x57, 0xa7, 0x10]);

    let approve = IERC20::approveCall::abi_decode(&calls[1].calldata).unwrap();
    assert_eq!(approve.spender, TREASURY);
    assert_eq!(approve.amount, U256::from(AMOUNT));

    assert_eq!(calls[2].contract, TREASURY);
    let deposit = ITreasury::depositToTreasuryCall::abi_decode(&calls[2].calldata).unwrap();
    assert_eq!(deposit.amount, U256::from(AMOUNT));

    assert_eq!(
        transfer_statuses(&mut receiver),
        vec![
            TransferStatus::Pending,
            TransferStatus::IntentSigned,
            TransferStatus::AttestationPending,
            TransferStatus::Attested,
            TransferStatus::Minted,
            TransferStatus::TreasuryFunded,
            TransferStatus::Complete,
        ]
    );
    assert!(logs_contain("Transfer finished"));
}

#[tokio::test]
async fn inline_attestation_skips_polling() {
    let harness = TransferHarness::new().await;
    let attested = attested_body("tr-inline");
    let submit = harness
        .server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/transfer");
            then.status(201).json_body(json!([attested]));
        })
        .await;
    let check = harness
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/transfer/tr-inline");
            then.status(500);
        })
        .await;

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let job = harness.coordinator.run(job.id).await.unwrap();

    assert_eq!(job.status, TransferStatus::Complete);
    submit.assert_hits_async(1).await;
    check.assert_hits_async(0).await;
}

#[tokio::test]
async fn refused_intent_fails_without_polling() {
    let harness = TransferHarness::new().await;
    let submit = harness
        .server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/transfer");
            then.status(422)
                .json_body(json!({ "message": "maxFee too low" }));
        })
        .await;
    let check = harness
        .server
        .mock_async(|when, then| {
            when.method(GET);
            then.status(200);
        })
        .await;

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let err = harness.coordinator.run(job.id).await.unwrap_err();

    assert!(
        matches!(
            &err,
            CoordinatorError::Submission(AttestationError::ServiceError { status: 422, .. })
        ),
        "unexpected: {err:?}"
    );
    let job = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::Failed);
    assert!(job.failure.unwrap().reason.contains("maxFee too low"));
    submit.assert_hits_async(1).await;
    check.assert_hits_async(0).await;
    assert!(harness.destination.sent_calls().is_empty());
}

#[tokio::test]
async fn rejected_transfer_fails_job() {
    let harness = TransferHarness::new().await;
    mock_accepted(&harness.server, "tr-x").await;
    harness
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/transfer/tr-x");
            then.status(200)
                .json_body(json!({ "transferId": "tr-x", "status": "expired" }));
        })
        .await;

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let err = harness.coordinator.run(job.id).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::Attestation(AttestationError::Rejected { .. })
    ));
    let job = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::Failed);
    assert_eq!(
        job.failure.unwrap().failed_in,
        TransferStatus::AttestationPending
    );
}

#[tokio::test]
#[traced_test]
async fn reverted_mint_fails_job_after_one_attempt() {
    let harness = TransferHarness::new().await;
    mock_accepted(&harness.server, "tr-d").await;
    mock_attested(&harness.server, "tr-d").await;
    harness
        .destination
        .revert_selector(IGatewayMinter::gatewayMintCall::SELECTOR, "expired");

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let err = harness.coordinator.run(job.id).await.unwrap_err();

    assert!(
        matches!(
            &err,
            CoordinatorError::Mint(MintError::MintReverted { reason }) if reason == "expired"
        ),
        "unexpected: {err:?}"
    );
    let job = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::Failed);
    assert_eq!(job.failure.unwrap().failed_in, TransferStatus::Attested);
    assert_eq!(
        harness.destination.sent_selectors(),
        vec![IGatewayMinter::gatewayMintCall::SELECTOR]
    );
    assert!(logs_contain("Transfer failed"));
}

#[tokio::test]
async fn interrupted_submission_is_never_resent() {
    let harness = TransferHarness::new().await;
    let submit = harness
        .server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/transfer");
            then.status(201)
                .delay(Duration::from_millis(500))
                .json_body(json!([{ "transferId": "tr-crash", "status": "pending" }]));
        })
        .await;

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    harness.coordinator.advance(job.id).await.unwrap();

    // Dropping the step mid-request stands in for a process crash.
    let interrupted =
        tokio::time::timeout(Duration::from_millis(100), harness.coordinator.advance(job.id)).await;
    assert!(interrupted.is_err());
    // Lets the dropped step hand back its lease.
    tokio::task::yield_now().await;

    let stored = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(stored.status, TransferStatus::IntentSigned);
    assert!(stored.submission_attempted_at.is_some());

    let err = harness.coordinator.advance(job.id).await.unwrap_err();

    assert!(matches!(
        err,
        CoordinatorError::SubmissionOutcomeUnknown { job_id } if job_id == job.id
    ));
    let job = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::Failed);
    submit.assert_hits_async(1).await;
}

#[tokio::test]
async fn stalled_mint_is_rechecked_not_resent() {
    let harness = TransferHarness::new().await;
    mock_accepted(&harness.server, "tr-slow").await;
    mock_attested(&harness.server, "tr-slow").await;
    harness.destination.withhold_receipts();

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    let err = harness.coordinator.run(job.id).await.unwrap_err();

    assert!(err.is_resumable(), "unexpected: {err:?}");
    let stalled = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(stalled.status, TransferStatus::Attested);
    assert!(stalled.mint_tx.is_some());
    assert!(stalled.last_error.is_some());

    harness.destination.release_receipts();
    let handles = harness.coordinator.resume_all().await.unwrap();
    assert_eq!(handles.len(), 1);
    let (id, handle) = handles.into_iter().next().unwrap();
    let job = handle.await.unwrap().unwrap();

    assert_eq!(id, job.id);
    assert_eq!(job.status, TransferStatus::Complete);
    assert_eq!(job.mint_tx, stalled.mint_tx);
    assert_eq!(job.last_error, None);
    let mints = harness
        .destination
        .sent_selectors()
        .into_iter()
        .filter(|selector| *selector == IGatewayMinter::gatewayMintCall::SELECTOR)
        .count();
    assert_eq!(mints, 1);
}

#[tokio::test]
async fn concurrent_workers_mint_once() {
    let harness = TransferHarness::new().await;
    mock_accepted(&harness.server, "tr-race").await;
    let body = attested_body("tr-race");
    harness
        .server
        .mock_async(|when, then| {
            when.method(GET).path("/v1/transfer/tr-race");
            then.status(200)
                .json_body(body)
                .delay(Duration::from_millis(50));
        })
        .await;

    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    harness.coordinator.advance(job.id).await.unwrap();
    let job = harness.coordinator.advance(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::AttestationPending);

    let first = harness.coordinator.spawn(job.id);
    let second = harness.coordinator.spawn(job.id);
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    for outcome in &outcomes {
        match outcome {
            Ok(finished) => assert_eq!(finished.status, TransferStatus::Complete),
            Err(err) => assert!(
                matches!(err, CoordinatorError::JobBusy { job_id } if *job_id == job.id),
                "unexpected: {err:?}"
            ),
        }
    }
    assert!(outcomes.iter().any(Result::is_ok));

    let stored = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(stored.status, TransferStatus::Complete);
    assert_eq!(stored.failure, None);
    let mints = harness
        .destination
        .sent_selectors()
        .into_iter()
        .filter(|selector| *selector == IGatewayMinter::gatewayMintCall::SELECTOR)
        .count();
    assert_eq!(mints, 1);
}

#[tokio::test]
async fn advance_refuses_job_leased_elsewhere() {
    let harness = TransferHarness::new().await;
    let job = harness
        .coordinator
        .create_job(harness.request(U256::from(AMOUNT)))
        .await
        .unwrap();
    assert!(
        harness
            .store
            .try_acquire_lease(job.id, "other-process")
            .await
            .unwrap()
    );

    let err = harness.coordinator.advance(job.id).await.unwrap_err();

    assert!(matches!(err, CoordinatorError::JobBusy { job_id } if job_id == job.id));
    assert!(!err.is_resumable());
    let stored = harness.coordinator.job(job.id).await.unwrap();
    assert_eq!(stored, job);

    harness
        .store
        .release_lease(job.id, "other-process")
        .await
        .unwrap();
    let job = harness.coordinator.advance(job.id).await.unwrap();
    assert_eq!(job.status, TransferStatus::IntentSigned);
}
