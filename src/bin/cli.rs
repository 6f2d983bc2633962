//! Command-line interface for deposits and Gateway transfers.

use gateway_treasury::cli;
use gateway_treasury::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (ctx, command) = cli::CliEnv::parse_and_convert().await?;
    setup_tracing(&ctx.log_level);

    cli::run_command(ctx, command).await?;
    Ok(())
}
