//! Drives transfer jobs through their state machine.
//!
//! Each call to [`TransferCoordinator::advance`] performs exactly one
//! transition and persists the job before returning, so a restarted process
//! continues from the last completed step. Irreversible actions are guarded
//! by artifacts recorded on the job:
//!
//! - a submission marker is written before the signed intent is posted, so
//!   an intent is never sent to the attestation service twice;
//! - mint and treasury transaction hashes are written as soon as they are
//!   broadcast, and a recorded hash is re-checked instead of resent.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attestation::{AttestationClient, AttestationError};
use crate::chain::{ChainClient, ChainRegistry, ReceiptWait, RegistryError};
use crate::intent::{IntentBuilder, IntentError};
use crate::job::{TransferJob, TransferJobId, TransferRequest, TransferStatus, TransitionError};
use crate::mint::{MintError, MintExecutor};
use crate::signer::{IntentSigner, SignerError, sign_intent};
use crate::store::{JobStore, StoreError};
use crate::treasury::{TreasuryError, TreasuryForwarder};
use crate::updates::{StatusUpdate, publish};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no chain client configured for {0}")]
    MissingClient(String),
    #[error("transfer amount must be greater than zero")]
    InvalidAmount,
    #[error("minted funds go to {recipient}, but {chain} transactions are sent from {account}")]
    RecipientMismatch {
        chain: String,
        recipient: Address,
        account: Address,
    },
    #[error(transparent)]
    Intent(#[from] IntentError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("intent submission failed: {0}")]
    Submission(#[source] AttestationError),
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    #[error(
        "job {job_id} was interrupted while submitting; the service may already hold the \
         intent, so it will not be resent"
    )]
    SubmissionOutcomeUnknown { job_id: TransferJobId },
    #[error(transparent)]
    Mint(#[from] MintError),
    #[error(transparent)]
    Treasury(#[from] TreasuryError),
    #[error("job {job_id} is {status} but has no {artifact}")]
    MissingArtifact {
        job_id: TransferJobId,
        status: TransferStatus,
        artifact: &'static str,
    },
    #[error("transfer job {0} not found")]
    JobNotFound(TransferJobId),
    #[error("transfer job {job_id} is being advanced by another worker")]
    JobBusy { job_id: TransferJobId },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Disposition {
    /// Leave the job where it is; the same step can be attempted again.
    Resume,
    /// The job cannot make progress and moves to `failed`.
    Fail,
    /// Local failure unrelated to the job's progress.
    Propagate,
}

impl CoordinatorError {
    fn disposition(&self) -> Disposition {
        match self {
            Self::Attestation(err) if err.is_transient() => Disposition::Resume,
            Self::Mint(err) if err.is_transient() => Disposition::Resume,
            Self::Treasury(err) if err.is_transient() => Disposition::Resume,
            Self::Registry(_)
            | Self::MissingClient(_)
            | Self::InvalidAmount
            | Self::RecipientMismatch { .. }
            | Self::Intent(_)
            | Self::Signer(_)
            | Self::Submission(_)
            | Self::Attestation(_)
            | Self::SubmissionOutcomeUnknown { .. }
            | Self::Mint(_)
            | Self::Treasury(_)
            | Self::MissingArtifact { .. } => Disposition::Fail,
            Self::JobNotFound(_)
            | Self::JobBusy { .. }
            | Self::Transition(_)
            | Self::Store(_) => Disposition::Propagate,
        }
    }

    /// Whether running the job again may succeed without operator action.
    pub fn is_resumable(&self) -> bool {
        matches!(self.disposition(), Disposition::Resume)
    }
}

pub type JobHandle = JoinHandle<Result<TransferJob, CoordinatorError>>;

/// Exclusive claim on a job for the duration of one step. A lease dropped
/// without [`JobLease::release`] (for example when the step's future is
/// cancelled) is released from a spawned task.
struct JobLease {
    store: Arc<dyn JobStore>,
    id: TransferJobId,
    holder: String,
    held: bool,
}

impl JobLease {
    async fn acquire(
        store: &Arc<dyn JobStore>,
        id: TransferJobId,
    ) -> Result<Option<Self>, StoreError> {
        let holder = Uuid::new_v4().to_string();
        if !store.try_acquire_lease(id, &holder).await? {
            return Ok(None);
        }

        Ok(Some(Self {
            store: Arc::clone(store),
            id,
            holder,
            held: true,
        }))
    }

    async fn release(mut self) {
        self.held = false;
        if let Err(err) = self.store.release_lease(self.id, &self.holder).await {
            warn!(job_id = %self.id, %err, "Failed to release transfer job lease");
        }
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let id = self.id;
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            if let Err(err) = store.release_lease(id, &holder).await {
                warn!(job_id = %id, %err, "Failed to release abandoned transfer job lease");
            }
        });
    }
}

/// Everything the coordinator needs, assembled by the caller.
pub struct CoordinatorCtx {
    pub registry: Arc<ChainRegistry>,
    pub clients: HashMap<String, Arc<dyn ChainClient>>,
    pub signer: Arc<dyn IntentSigner>,
    pub attestation: AttestationClient,
    pub store: Arc<dyn JobStore>,
    pub receipts: ReceiptWait,
    pub max_fee: U256,
    pub max_block_height: U256,
    pub updates: broadcast::Sender<StatusUpdate>,
}

pub struct TransferCoordinator {
    registry: Arc<ChainRegistry>,
    clients: HashMap<String, Arc<dyn ChainClient>>,
    builder: IntentBuilder,
    signer: Arc<dyn IntentSigner>,
    attestation: AttestationClient,
    store: Arc<dyn JobStore>,
    receipts: ReceiptWait,
    max_fee: U256,
    updates: broadcast::Sender<StatusUpdate>,
}

impl TransferCoordinator {
    pub fn new(ctx: CoordinatorCtx) -> Self {
        Self {
            builder: IntentBuilder::new(ctx.registry.clone(), ctx.max_block_height),
            registry: ctx.registry,
            clients: ctx.clients,
            signer: ctx.signer,
            attestation: ctx.attestation,
            store: ctx.store,
            receipts: ctx.receipts,
            max_fee: ctx.max_fee,
            updates: ctx.updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    fn client(&self, chain: &str) -> Result<&Arc<dyn ChainClient>, CoordinatorError> {
        self.clients
            .get(chain)
            .ok_or_else(|| CoordinatorError::MissingClient(chain.to_string()))
    }

    /// Request that moves `amount` from the signer's unified balance into
    /// the treasury on `destination`, minting to the destination account.
    pub fn request(
        &self,
        source: &str,
        destination: &str,
        amount: U256,
    ) -> Result<TransferRequest, CoordinatorError> {
        Ok(TransferRequest {
            source_chain: source.to_string(),
            destination_chain: destination.to_string(),
            depositor: self.signer.address(),
            recipient: self.client(destination)?.account(),
            amount,
        })
    }

    /// Validates `request` and persists a new `pending` job. Configuration
    /// problems are reported here, before any network call.
    pub async fn create_job(
        &self,
        request: TransferRequest,
    ) -> Result<TransferJob, CoordinatorError> {
        let source = self.registry.get(&request.source_chain)?;
        let destination = self.registry.get(&request.destination_chain)?;
        if source.domain == destination.domain {
            return Err(IntentError::SameChain(source.name.clone()).into());
        }
        self.client(&request.source_chain)?;
        let destination_client = self.client(&request.destination_chain)?;

        if request.amount.is_zero() {
            return Err(CoordinatorError::InvalidAmount);
        }

        if destination.treasury.is_none() {
            return Err(TreasuryError::MissingTreasury {
                chain: destination.name.clone(),
            }
            .into());
        }

        let account = destination_client.account();
        if request.recipient != account {
            return Err(CoordinatorError::RecipientMismatch {
                chain: destination.name.clone(),
                recipient: request.recipient,
                account,
            });
        }

        let job = TransferJob::new(request);
        self.persist(&job).await?;

        info!(
            job_id = %job.id,
            source = %job.source_chain,
            destination = %job.destination_chain,
            amount = %job.amount,
            "Created transfer job"
        );

        Ok(job)
    }

    pub async fn job(&self, id: TransferJobId) -> Result<TransferJob, CoordinatorError> {
        self.store
            .load_job(id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(id))
    }

    pub async fn jobs(&self) -> Result<Vec<TransferJob>, CoordinatorError> {
        Ok(self.store.list_jobs().await?)
    }

    async fn persist(&self, job: &TransferJob) -> Result<(), CoordinatorError> {
        self.store.save_job(job).await?;
        publish(&self.updates, StatusUpdate::Transfer(job.clone()));
        Ok(())
    }

    /// Performs the next transition of job `id`.
    ///
    /// The step runs under the job's lease; if another worker holds it the
    /// call returns [`CoordinatorError::JobBusy`] without touching the job.
    /// On a resumable error the job keeps its status with `last_error`
    /// recorded. On a permanent error it moves to `failed`. Either way the
    /// error is returned.
    pub async fn advance(&self, id: TransferJobId) -> Result<TransferJob, CoordinatorError> {
        let Some(lease) = JobLease::acquire(&self.store, id).await? else {
            return Err(CoordinatorError::JobBusy { job_id: id });
        };

        let result = self.advance_leased(id).await;
        lease.release().await;
        result
    }

    async fn advance_leased(&self, id: TransferJobId) -> Result<TransferJob, CoordinatorError> {
        let mut job = self.job(id).await?;

        if job.status.is_terminal() {
            return Ok(job);
        }

        let Err(err) = self.step(&mut job).await else {
            return Ok(job);
        };

        match err.disposition() {
            Disposition::Resume => {
                warn!(
                    job_id = %job.id,
                    status = %job.status,
                    %err,
                    "Transfer step stopped, job can be resumed"
                );
                job.record_error(err.to_string());
                self.persist(&job).await?;
            }
            Disposition::Fail => {
                error!(job_id = %job.id, status = %job.status, %err, "Transfer failed");
                job.fail(err.to_string())?;
                self.persist(&job).await?;
            }
            Disposition::Propagate => {}
        }

        Err(err)
    }

    /// Advances job `id` until it completes or an error stops it.
    pub async fn run(&self, id: TransferJobId) -> Result<TransferJob, CoordinatorError> {
        loop {
            let job = self.advance(id).await?;
            if job.status.is_terminal() {
                info!(job_id = %job.id, status = %job.status, "Transfer finished");
                return Ok(job);
            }
        }
    }

    /// Runs job `id` on its own task.
    pub fn spawn(self: &Arc<Self>, id: TransferJobId) -> JobHandle {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run(id).await })
    }

    /// Spawns a worker for every job that has not reached a terminal state.
    pub async fn resume_all(
        self: &Arc<Self>,
    ) -> Result<Vec<(TransferJobId, JobHandle)>, CoordinatorError> {
        let active: Vec<_> = self
            .jobs()
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.id)
            .collect();

        info!(count = active.len(), "Resuming unfinished transfer jobs");

        Ok(active.into_iter().map(|id| (id, self.spawn(id))).collect())
    }

    async fn step(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        match job.status {
            TransferStatus::Pending => self.sign(job).await,
            TransferStatus::IntentSigned => self.submit(job).await,
            TransferStatus::AttestationPending => self.await_attestation(job).await,
            TransferStatus::Attested => self.mint(job).await,
            TransferStatus::Minted => self.forward(job).await,
            TransferStatus::TreasuryFunded => {
                job.complete()?;
                self.persist(job).await
            }
            TransferStatus::Complete | TransferStatus::Failed => Ok(()),
        }
    }

    async fn sign(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        let intent = self.builder.build(
            &job.source_chain,
            &job.destination_chain,
            job.depositor,
            job.recipient,
            job.amount,
            self.max_fee,
        )?;

        let signed = sign_intent(self.signer.as_ref(), intent).await?;
        job.record_signed_intent(signed)?;
        self.persist(job).await
    }

    async fn submit(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        if job.submission_attempted_at.is_some() {
            return Err(CoordinatorError::SubmissionOutcomeUnknown { job_id: job.id });
        }

        let signed = job
            .signed_intent
            .clone()
            .ok_or(CoordinatorError::MissingArtifact {
                job_id: job.id,
                status: job.status,
                artifact: "signed intent",
            })?;

        job.mark_submission_attempted()?;
        self.persist(job).await?;

        let submission = self
            .attestation
            .submit(&signed)
            .await
            .map_err(CoordinatorError::Submission)?;

        job.record_submission(submission.transfer_id)?;
        if let Some(attestation) = submission.attestation {
            job.record_attestation(attestation)?;
        }
        self.persist(job).await
    }

    async fn await_attestation(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        let transfer_id = job
            .transfer_id
            .clone()
            .ok_or(CoordinatorError::MissingArtifact {
                job_id: job.id,
                status: job.status,
                artifact: "transfer id",
            })?;

        let attestation = self.attestation.poll(&transfer_id).await?;
        job.record_attestation(attestation)?;
        self.persist(job).await
    }

    async fn mint(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        let attestation = job
            .attestation
            .clone()
            .ok_or(CoordinatorError::MissingArtifact {
                job_id: job.id,
                status: job.status,
                artifact: "attestation",
            })?;
        let executor =
            MintExecutor::new(self.client(&job.destination_chain)?.clone(), self.receipts);

        let tx_hash = match job.mint_tx {
            Some(tx_hash) => {
                info!(job_id = %job.id, %tx_hash, "Re-checking previously broadcast mint");
                tx_hash
            }
            None => {
                let tx_hash = executor.broadcast(&attestation).await?;
                job.record_mint_broadcast(tx_hash)?;
                self.persist(job).await?;
                tx_hash
            }
        };

        executor.confirm(tx_hash).await?;
        job.record_mint_confirmed()?;
        self.persist(job).await
    }

    async fn forward(&self, job: &mut TransferJob) -> Result<(), CoordinatorError> {
        let forwarder =
            TreasuryForwarder::new(self.client(&job.destination_chain)?.clone(), self.receipts);

        let approval_tx = match job.approval_tx {
            Some(tx_hash) => tx_hash,
            None => {
                let tx_hash = forwarder.submit_approval(job.amount).await?;
                job.record_approval_broadcast(tx_hash)?;
                self.persist(job).await?;
                tx_hash
            }
        };

        let treasury_tx = match job.treasury_tx {
            Some(tx_hash) => tx_hash,
            None => {
                forwarder.confirm(approval_tx).await?;
                let tx_hash = forwarder.submit_deposit(job.amount).await?;
                job.record_treasury_broadcast(tx_hash)?;
                self.persist(job).await?;
                tx_hash
            }
        };

        forwarder.confirm(treasury_tx).await?;
        job.record_treasury_confirmed()?;
        self.persist(job).await
    }
}
