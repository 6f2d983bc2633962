//! Shared test fixtures: chain profiles, a signer with a fixed key, an
//! in-memory database, and an in-process chain double.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256, address, b256, keccak256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::TransportErrorKind;
use async_trait::async_trait;
use httpmock::MockServer;
use sqlx::SqlitePool;

use gateway_evm::EvmError;

use crate::attestation::{AttestationClient, AttestationConfig};
use crate::bindings::IGatewayMinter;
use crate::chain::{ChainClient, ChainError, ChainProfile, ChainRegistry, ReceiptWait, TxReceipt};
use crate::coordinator::{CoordinatorCtx, TransferCoordinator};
use crate::job::TransferRequest;
use crate::signer::LocalIntentSigner;
use crate::store::InMemoryStore;
use crate::updates;

pub(crate) const TEST_KEY: B256 =
    b256!("0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d");

pub(crate) const GATEWAY_WALLET: Address = address!("0x0077777d7EBA4688BDeF3E311b846F25870A19B9");
pub(crate) const GATEWAY_MINTER: Address = address!("0x0022222ABE238Cc2C7Bb1f21003F0a260052475B");
pub(crate) const TREASURY: Address = address!("0x7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e");

/// Profile with deterministic addresses. The token address embeds the
/// domain so profiles in one registry never share a token.
pub(crate) fn test_profile(name: &str, chain_id: u64, domain: u32) -> ChainProfile {
    let mut token = [0x1c; 20];
    token[16..].copy_from_slice(&domain.to_be_bytes());

    ChainProfile {
        name: name.to_string(),
        chain_id,
        domain,
        token: Address::from(token),
        gateway_wallet: GATEWAY_WALLET,
        gateway_minter: GATEWAY_MINTER,
        treasury: Some(TREASURY),
        rpc_urls: vec!["http://127.0.0.1:8545".parse().unwrap()],
        required_confirmations: 2,
        explorer_url: "https://explorer.test".parse().unwrap(),
    }
}

pub(crate) fn test_registry() -> ChainRegistry {
    ChainRegistry::new(vec![
        test_profile("ethereum-sepolia", 11_155_111, 0),
        test_profile("arc-testnet", 5_042_002, 26),
    ])
    .unwrap()
}

pub(crate) fn test_signer() -> LocalIntentSigner {
    LocalIntentSigner::new(PrivateKeySigner::from_bytes(&TEST_KEY).unwrap())
}

pub(crate) fn test_account() -> Address {
    PrivateKeySigner::from_bytes(&TEST_KEY).unwrap().address()
}

pub(crate) fn fast_receipts() -> ReceiptWait {
    ReceiptWait {
        timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

/// Centralized test database setup.
/// Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// A contract call as it reached the mock node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentCall {
    pub(crate) contract: Address,
    pub(crate) calldata: Bytes,
    pub(crate) note: String,
}

impl SentCall {
    pub(crate) fn selector(&self) -> [u8; 4] {
        let mut selector = [0; 4];
        if let Some(prefix) = self.calldata.get(..4) {
            selector.copy_from_slice(prefix);
        }
        selector
    }
}

#[derive(Default)]
struct MockState {
    block: u64,
    balances: HashMap<Address, U256>,
    gateway_balances: HashMap<Address, U256>,
    sent: Vec<SentCall>,
    receipts: HashMap<TxHash, TxReceipt>,
    withhold_receipts: bool,
    withheld_selectors: HashSet<[u8; 4]>,
    withheld: Vec<TxHash>,
    reverts: HashMap<[u8; 4], String>,
    consumed_attestations: HashSet<Bytes>,
    failing_block_reads: usize,
}

/// In-process [`ChainClient`] with scriptable behaviour.
///
/// Every send attempt is recorded, including ones that revert. Calls to
/// `gatewayMint` are checked against previously consumed attestations and
/// a repeat reverts with `TransferSpecHashUsed`, mirroring the minter.
pub(crate) struct MockChain {
    profile: ChainProfile,
    account: Address,
    state: Mutex<MockState>,
}

impl MockChain {
    pub(crate) fn new(profile: ChainProfile) -> Self {
        Self::with_account(profile, test_account())
    }

    pub(crate) fn with_account(profile: ChainProfile, account: Address) -> Self {
        Self {
            profile,
            account,
            state: Mutex::new(MockState {
                block: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_block(&self, block: u64) {
        self.state().block = block;
    }

    pub(crate) fn advance_blocks(&self, count: u64) {
        self.state().block += count;
    }

    pub(crate) fn set_token_balance(&self, owner: Address, balance: U256) {
        self.state().balances.insert(owner, balance);
    }

    pub(crate) fn set_gateway_balance(&self, depositor: Address, balance: U256) {
        self.state().gateway_balances.insert(depositor, balance);
    }

    pub(crate) fn revert_selector(&self, selector: [u8; 4], reason: &str) {
        self.state().reverts.insert(selector, reason.to_string());
    }

    /// Receipts for transactions sent from now on stay unavailable until
    /// [`Self::release_receipts`] is called.
    pub(crate) fn withhold_receipts(&self) {
        self.state().withhold_receipts = true;
    }

    /// Like [`Self::withhold_receipts`], for calls with `selector` only.
    pub(crate) fn withhold_receipts_for(&self, selector: [u8; 4]) {
        self.state().withheld_selectors.insert(selector);
    }

    /// Includes every withheld transaction in the current block.
    pub(crate) fn release_receipts(&self) {
        let mut state = self.state();
        state.withhold_receipts = false;
        state.withheld_selectors.clear();
        let block = state.block;

        for tx_hash in std::mem::take(&mut state.withheld) {
            state.receipts.insert(
                tx_hash,
                TxReceipt {
                    tx_hash,
                    block_number: block,
                    success: true,
                },
            );
        }
    }

    pub(crate) fn insert_receipt(&self, receipt: TxReceipt) {
        self.state().receipts.insert(receipt.tx_hash, receipt);
    }

    /// The next `count` block height reads fail as if the node were down.
    pub(crate) fn fail_block_reads(&self, count: usize) {
        self.state().failing_block_reads = count;
    }

    pub(crate) fn sent_calls(&self) -> Vec<SentCall> {
        self.state().sent.clone()
    }

    pub(crate) fn sent_selectors(&self) -> Vec<[u8; 4]> {
        self.state().sent.iter().map(SentCall::selector).collect()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn profile(&self) -> &ChainProfile {
        &self.profile
    }

    fn account(&self) -> Address {
        self.account
    }

    async fn token_balance(&self, owner: Address) -> Result<U256, ChainError> {
        Ok(self.state().balances.get(&owner).copied().unwrap_or_default())
    }

    async fn gateway_balance(&self, depositor: Address) -> Result<U256, ChainError> {
        Ok(self
            .state()
            .gateway_balances
            .get(&depositor)
            .copied()
            .unwrap_or_default())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let mut state = self.state();

        if state.failing_block_reads > 0 {
            state.failing_block_reads -= 1;
            return Err(ChainError::Unavailable {
                chain: self.profile.name.clone(),
                attempts: 1,
                source: EvmError::Transport(TransportErrorKind::custom_str("connection refused")),
            });
        }

        Ok(state.block)
    }

    async fn send_call(
        &self,
        contract: Address,
        calldata: Bytes,
        note: &str,
    ) -> Result<TxHash, ChainError> {
        let mut state = self.state();
        let call = SentCall {
            contract,
            calldata: calldata.clone(),
            note: note.to_string(),
        };
        let selector = call.selector();
        let nonce = state.sent.len();
        state.sent.push(call);

        if let Some(reason) = state.reverts.get(&selector) {
            return Err(ChainError::Reverted {
                tx_hash: None,
                reason: reason.clone(),
            });
        }

        if selector == IGatewayMinter::gatewayMintCall::SELECTOR
            && !state.consumed_attestations.insert(calldata.clone())
        {
            return Err(ChainError::Reverted {
                tx_hash: None,
                reason: "TransferSpecHashUsed".to_string(),
            });
        }

        let mut preimage = calldata.to_vec();
        preimage.extend_from_slice(self.profile.name.as_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        let tx_hash = keccak256(&preimage);

        if state.withhold_receipts || state.withheld_selectors.contains(&selector) {
            state.withheld.push(tx_hash);
        } else {
            let block = state.block;
            state.receipts.insert(
                tx_hash,
                TxReceipt {
                    tx_hash,
                    block_number: block,
                    success: true,
                },
            );
        }

        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<TxReceipt>, ChainError> {
        Ok(self.state().receipts.get(&tx_hash).copied())
    }
}

pub(crate) const SOURCE_CHAIN: &str = "ethereum-sepolia";
pub(crate) const DESTINATION_CHAIN: &str = "arc-testnet";

/// Attestation client pointed at `server` with a short poll budget.
pub(crate) fn attestation_client(server: &MockServer, max_attempts: usize) -> AttestationClient {
    AttestationClient::new(&AttestationConfig {
        base_url: server.base_url().parse().unwrap(),
        poll_interval: Duration::from_millis(5),
        max_attempts,
        request_timeout: Duration::from_secs(5),
    })
    .unwrap()
}

/// A coordinator wired to two mock chains, an in-memory store and a mock
/// attestation service.
pub(crate) struct TransferHarness {
    pub(crate) source: Arc<MockChain>,
    pub(crate) destination: Arc<MockChain>,
    pub(crate) store: Arc<InMemoryStore>,
    pub(crate) server: MockServer,
    pub(crate) coordinator: Arc<TransferCoordinator>,
}

impl TransferHarness {
    pub(crate) async fn new() -> Self {
        Self::with_destination(test_profile(DESTINATION_CHAIN, 5_042_002, 26)).await
    }

    pub(crate) async fn with_destination(destination: ChainProfile) -> Self {
        let source = Arc::new(MockChain::new(test_profile(SOURCE_CHAIN, 11_155_111, 0)));
        let destination = Arc::new(MockChain::new(destination));
        let registry = Arc::new(
            ChainRegistry::new(vec![source.profile.clone(), destination.profile.clone()])
                .unwrap(),
        );

        let mut clients: HashMap<String, Arc<dyn ChainClient>> = HashMap::new();
        clients.insert(source.profile.name.clone(), source.clone());
        clients.insert(destination.profile.name.clone(), destination.clone());

        let store = Arc::new(InMemoryStore::default());
        let server = MockServer::start_async().await;

        let coordinator = Arc::new(TransferCoordinator::new(CoordinatorCtx {
            registry,
            clients,
            signer: Arc::new(test_signer()),
            attestation: attestation_client(&server, 3),
            store: store.clone(),
            receipts: fast_receipts(),
            max_fee: U256::from(2_010_000u64),
            max_block_height: U256::MAX,
            updates: updates::channel(),
        }));

        Self {
            source,
            destination,
            store,
            server,
            coordinator,
        }
    }

    pub(crate) fn request(&self, amount: U256) -> TransferRequest {
        self.coordinator
            .request(SOURCE_CHAIN, DESTINATION_CHAIN, amount)
            .unwrap()
    }
}
