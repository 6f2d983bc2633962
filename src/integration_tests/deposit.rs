use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;

use super::deposit_statuses;
use crate::deposit::{DepositMonitor, DepositStatus};
use crate::store::{DepositStore, SqliteStore};
use crate::test_utils::{MockChain, fast_receipts, setup_test_db, test_account, test_profile};
use crate::updates;

fn monitor(chain: &Arc<MockChain>, store: &Arc<SqliteStore>) -> DepositMonitor {
    DepositMonitor::new(
        chain.clone(),
        store.clone(),
        fast_receipts(),
        Duration::from_millis(5),
        updates::channel(),
    )
}

#[tokio::test]
async fn deposit_reaches_finality_after_required_confirmations() {
    let mut profile = test_profile("ethereum-sepolia", 11_155_111, 0);
    profile.required_confirmations = 2;
    let chain = Arc::new(MockChain::new(profile));
    chain.set_block(100);
    chain.set_token_balance(test_account(), U256::from(10_000_000u64));
    let store = Arc::new(SqliteStore::from_pool(setup_test_db().await).await.unwrap());
    let updates = updates::channel();
    let mut receiver = updates.subscribe();
    let monitor = DepositMonitor::new(
        chain.clone(),
        store.clone(),
        fast_receipts(),
        Duration::from_millis(5),
        updates,
    );

    let record = monitor
        .start_deposit(test_account(), U256::from(5_000_000u64))
        .await
        .unwrap();
    assert_eq!(record.status, DepositStatus::Included);
    assert_eq!(record.block_number, Some(100));

    chain.advance_blocks(1);
    let record = monitor.poll_finality(&record).await.unwrap();
    assert_eq!(record.status, DepositStatus::WaitingFinality);
    assert_eq!(record.confirmations, 1);

    chain.advance_blocks(1);
    let record = monitor.poll_finality(&record).await.unwrap();
    assert_eq!(record.status, DepositStatus::Finalized);
    assert_eq!(record.confirmations, 2);

    let tx_hash = record.tx_hash;
    assert_eq!(
        deposit_statuses(&mut receiver),
        vec![
            (tx_hash, DepositStatus::Submitted, 0),
            (tx_hash, DepositStatus::Included, 0),
        ]
    );
}

#[tokio::test]
async fn restarted_monitor_finishes_persisted_deposit() {
    let mut profile = test_profile("arc-testnet", 5_042_002, 26);
    profile.required_confirmations = 3;
    let chain = Arc::new(MockChain::new(profile));
    chain.set_token_balance(test_account(), U256::from(1_000_000u64));
    let store = Arc::new(SqliteStore::from_pool(setup_test_db().await).await.unwrap());

    let submitted = monitor(&chain, &store)
        .start_deposit(test_account(), U256::from(1_000_000u64))
        .await
        .unwrap();

    chain.advance_blocks(5);
    let finalized = monitor(&chain, &store).resume(test_account()).await.unwrap();

    assert_eq!(finalized.tx_hash, submitted.tx_hash);
    assert_eq!(finalized.status, DepositStatus::Finalized);
    assert_eq!(finalized.confirmations, 5);

    let stored = store
        .latest_deposit("arc-testnet", test_account())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, finalized);
}
