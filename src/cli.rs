//! Operator commands for deposits, transfers and job inspection.

use std::io::Write;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::amount::Usdc;
use crate::chain::{ChainClient, ChainRegistry};
use crate::config::{Ctx, Env};
use crate::coordinator::{CoordinatorError, TransferCoordinator};
use crate::deposit::DepositRecord;
use crate::job::{TransferJob, TransferJobId, TransferStatus};
use crate::store::{DepositStore, JobStore, SqliteStore};
use crate::updates::{self, StatusUpdate};

#[derive(Debug, Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Move USDC through Circle Gateway into a treasury")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show wallet and unified balances on every configured chain
    Balance,

    /// Deposit USDC into a chain's GatewayWallet and wait for finality
    Deposit {
        /// Chain name from the config's chain table
        #[arg(short = 'c', long = "chain")]
        chain: String,
        /// Amount of USDC to deposit
        #[arg(short = 'a', long = "amount")]
        amount: Usdc,
        /// Credit the deposit to another address (uses depositFor)
        #[arg(long = "depositor")]
        depositor: Option<Address>,
        /// Return once the deposit is included instead of waiting for finality
        #[arg(long = "no-wait")]
        no_wait: bool,
    },

    /// Resume finality tracking for the latest deposit on a chain
    WatchDeposit {
        #[arg(short = 'c', long = "chain")]
        chain: String,
    },

    /// Transfer USDC from the unified balance into the destination treasury
    Transfer {
        /// Source chain whose unified balance is burned
        #[arg(long = "from")]
        from: String,
        /// Destination chain where USDC is minted and forwarded
        #[arg(long = "to")]
        to: String,
        #[arg(short = 'a', long = "amount")]
        amount: Usdc,
    },

    /// Continue an interrupted transfer job, or all of them
    Resume {
        /// Job id; omit to resume every unfinished job
        job_id: Option<TransferJobId>,
    },

    /// Show transfer jobs and recorded deposits
    Status {
        /// Job id; omit to list everything
        job_id: Option<TransferJobId>,
    },
}

#[derive(Debug, Parser)]
pub struct CliEnv {
    #[clap(flatten)]
    env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments, load config from file, and return with subcommand.
    pub async fn parse_and_convert() -> anyhow::Result<(Ctx, Commands)> {
        Self::parse().load().await
    }

    pub(crate) async fn load(self) -> anyhow::Result<(Ctx, Commands)> {
        let ctx = Ctx::load_files(&self.env.config, &self.env.secrets).await?;
        Ok((ctx, self.command))
    }
}

pub async fn run_command(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::connect(&ctx.database_url).await?);
    run_command_with_writers(ctx, command, store, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    ctx: Ctx,
    command: Commands,
    store: Arc<SqliteStore>,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Balance => balance_command(&ctx, stdout).await?,
        Commands::Deposit {
            chain,
            amount,
            depositor,
            no_wait,
        } => deposit_command(&ctx, store, &chain, amount, depositor, no_wait, stdout).await?,
        Commands::WatchDeposit { chain } => {
            watch_deposit_command(&ctx, store, &chain, stdout).await?;
        }
        Commands::Transfer { from, to, amount } => {
            transfer_command(&ctx, store, &from, &to, amount, stdout).await?;
        }
        Commands::Resume { job_id } => resume_command(&ctx, store, job_id, stdout).await?,
        Commands::Status { job_id } => status_command(&ctx, store, job_id, stdout).await?,
    }

    info!("CLI operation completed successfully");
    Ok(())
}

async fn balance_command<W: Write>(ctx: &Ctx, stdout: &mut W) -> anyhow::Result<()> {
    let account = ctx.signer()?.address();
    let clients = ctx
        .registry
        .iter()
        .map(|profile| ctx.chain_client(&profile.name))
        .collect::<Result<Vec<_>, _>>()?;

    write_balances(stdout, account, &clients).await
}

async fn write_balances<W: Write>(
    stdout: &mut W,
    account: Address,
    clients: &[Arc<dyn ChainClient>],
) -> anyhow::Result<()> {
    writeln!(stdout, "Balances for {account}")?;

    for client in clients {
        let profile = client.profile();
        let wallet = client.token_balance(account).await?;
        let unified = client.gateway_balance(account).await?;

        writeln!(stdout, "   {} (domain {})", profile.name, profile.domain)?;
        writeln!(stdout, "      Wallet USDC: {}", Usdc::from_base_units(wallet)?)?;
        writeln!(stdout, "      Gateway available: {}", Usdc::from_base_units(unified)?)?;
    }

    Ok(())
}

async fn deposit_command<W: Write>(
    ctx: &Ctx,
    store: Arc<SqliteStore>,
    chain: &str,
    amount: Usdc,
    depositor: Option<Address>,
    no_wait: bool,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let monitor = ctx.deposit_monitor(chain, store, updates::channel())?;
    let depositor = match depositor {
        Some(depositor) => depositor,
        None => ctx.signer()?.address(),
    };

    writeln!(stdout, "Depositing {amount} USDC on {chain} for {depositor}")?;
    let record = monitor.start_deposit(depositor, amount.to_base_units()?).await?;
    write_deposit(stdout, &ctx.registry, &record)?;

    if no_wait {
        return Ok(());
    }

    writeln!(stdout, "Waiting for {} confirmations...", record.required_confirmations)?;
    let record = monitor.watch(record).await?;
    write_deposit(stdout, &ctx.registry, &record)?;

    Ok(())
}

async fn watch_deposit_command<W: Write>(
    ctx: &Ctx,
    store: Arc<SqliteStore>,
    chain: &str,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let monitor = ctx.deposit_monitor(chain, store, updates::channel())?;
    let record = monitor.resume(ctx.signer()?.address()).await?;
    write_deposit(stdout, &ctx.registry, &record)?;
    Ok(())
}

async fn transfer_command<W: Write>(
    ctx: &Ctx,
    store: Arc<SqliteStore>,
    from: &str,
    to: &str,
    amount: Usdc,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let coordinator = ctx.coordinator(store, updates::channel())?;
    let mut progress = coordinator.subscribe();

    let request = coordinator.request(from, to, amount.to_base_units()?)?;
    let job = coordinator.create_job(request).await?;
    writeln!(stdout, "Transferring {amount} USDC from {from} to {to}")?;
    writeln!(stdout, "   Job: {}", job.id)?;

    let outcome = run_with_progress(&coordinator, job.id, &mut progress, stdout).await?;

    let job = coordinator.job(job.id).await?;
    write_job(stdout, &ctx.registry, &job)?;
    outcome?;
    Ok(())
}

async fn resume_command<W: Write>(
    ctx: &Ctx,
    store: Arc<SqliteStore>,
    job_id: Option<TransferJobId>,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let coordinator = Arc::new(ctx.coordinator(store, updates::channel())?);

    let Some(id) = job_id else {
        return resume_all(&coordinator, &ctx.registry, stdout).await;
    };

    let mut progress = coordinator.subscribe();
    let outcome = run_with_progress(&coordinator, id, &mut progress, stdout).await?;

    let job = coordinator.job(id).await?;
    write_job(stdout, &ctx.registry, &job)?;
    outcome?;
    Ok(())
}

async fn resume_all<W: Write>(
    coordinator: &Arc<TransferCoordinator>,
    registry: &ChainRegistry,
    stdout: &mut W,
) -> anyhow::Result<()> {
    let handles = coordinator.resume_all().await?;
    if handles.is_empty() {
        writeln!(stdout, "No unfinished transfer jobs")?;
        return Ok(());
    }

    let mut failures = 0usize;
    for (id, handle) in handles {
        if let Err(err) = handle.await? {
            failures += 1;
            writeln!(stdout, "Job {id} stopped: {err}")?;
        }
        write_job(stdout, registry, &coordinator.job(id).await?)?;
    }

    if failures > 0 {
        anyhow::bail!("{failures} transfer job(s) did not complete");
    }

    Ok(())
}

async fn status_command<W: Write>(
    ctx: &Ctx,
    store: Arc<SqliteStore>,
    job_id: Option<TransferJobId>,
    stdout: &mut W,
) -> anyhow::Result<()> {
    if let Some(id) = job_id {
        let job = store
            .load_job(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("transfer job {id} not found"))?;
        write_job(stdout, &ctx.registry, &job)?;
        return Ok(());
    }

    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        writeln!(stdout, "No transfer jobs")?;
    }
    for job in &jobs {
        write_job(stdout, &ctx.registry, job)?;
    }

    let deposits = store.deposits(ctx.signer()?.address()).await?;
    for record in &deposits {
        write_deposit(stdout, &ctx.registry, record)?;
    }

    Ok(())
}

/// Runs job `id`, printing each status change as it is published.
async fn run_with_progress<W: Write>(
    coordinator: &TransferCoordinator,
    id: TransferJobId,
    progress: &mut broadcast::Receiver<StatusUpdate>,
    stdout: &mut W,
) -> std::io::Result<Result<TransferJob, CoordinatorError>> {
    let run = coordinator.run(id);
    tokio::pin!(run);
    let mut last = None;

    loop {
        tokio::select! {
            outcome = &mut run => {
                while let Ok(update) = progress.try_recv() {
                    write_progress(stdout, &update, id, &mut last)?;
                }
                return Ok(outcome);
            }
            received = progress.recv() => match received {
                Ok(update) => write_progress(stdout, &update, id, &mut last)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transfer progress output fell behind");
                }
                Err(RecvError::Closed) => return Ok((&mut run).await),
            },
        }
    }
}

fn write_progress<W: Write>(
    stdout: &mut W,
    update: &StatusUpdate,
    id: TransferJobId,
    last: &mut Option<TransferStatus>,
) -> std::io::Result<()> {
    let StatusUpdate::Transfer(job) = update else {
        return Ok(());
    };
    if job.id != id || *last == Some(job.status) {
        return Ok(());
    }

    writeln!(stdout, "   -> {}", job.status)?;
    *last = Some(job.status);
    Ok(())
}

fn format_amount(units: U256) -> String {
    Usdc::from_base_units(units).map_or_else(|_| format!("{units} units"), |usdc| usdc.to_string())
}

fn write_job<W: Write>(
    stdout: &mut W,
    registry: &ChainRegistry,
    job: &TransferJob,
) -> std::io::Result<()> {
    writeln!(
        stdout,
        "Job {} [{}]: {} USDC {} -> {}",
        job.id,
        job.status,
        format_amount(job.amount),
        job.source_chain,
        job.destination_chain
    )?;

    if let Some(transfer_id) = &job.transfer_id {
        writeln!(stdout, "   Transfer id: {transfer_id}")?;
    }

    // Kept visible so a stuck mint can be completed by hand.
    if let Some(attestation) = &job.attestation {
        writeln!(stdout, "   Attestation: {}", attestation.payload)?;
        writeln!(stdout, "   Attestation signature: {}", attestation.signature)?;
        if let Some(fee) = attestation.fee {
            writeln!(stdout, "   Fee: {fee} USDC")?;
        }
    }

    let destination = registry.get(&job.destination_chain).ok();
    let labelled = [
        ("Mint tx", job.mint_tx),
        ("Approval tx", job.approval_tx),
        ("Treasury tx", job.treasury_tx),
    ];
    for (label, tx_hash) in labelled {
        let Some(tx_hash) = tx_hash else { continue };
        match destination {
            Some(profile) => writeln!(stdout, "   {label}: {}", profile.explorer_tx_url(tx_hash))?,
            None => writeln!(stdout, "   {label}: {tx_hash}")?,
        }
    }

    if let Some(failure) = &job.failure {
        writeln!(stdout, "   Failed in {}: {}", failure.failed_in, failure.reason)?;
    }
    if let Some(last_error) = &job.last_error {
        writeln!(stdout, "   Last error: {last_error}")?;
    }

    Ok(())
}

fn write_deposit<W: Write>(
    stdout: &mut W,
    registry: &ChainRegistry,
    record: &DepositRecord,
) -> std::io::Result<()> {
    let tx = registry.get(&record.chain).map_or_else(
        |_| record.tx_hash.to_string(),
        |profile| profile.explorer_tx_url(record.tx_hash),
    );

    writeln!(
        stdout,
        "Deposit on {} [{}]: {} USDC, {}/{} confirmations",
        record.chain,
        record.status,
        format_amount(record.amount),
        record.confirmations,
        record.required_confirmations
    )?;
    writeln!(stdout, "   Tx: {tx}")?;

    if let Some(failure) = &record.failure {
        writeln!(stdout, "   Failure: {failure}")?;
    }

    Ok(())
}
