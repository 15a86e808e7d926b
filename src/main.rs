use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dashminer::accounts::{AccountRepository, FileStore};
use dashminer::mining::milestones::table_rows;
use dashminer::mining::stats::lamports_to_sol;
use dashminer::{api, dashboard, sim, spawn_engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dash Miner - session reward engine (headless)", long_about = None)]
struct Cli {
    /// Payout service base URL
    #[arg(long, env = "PAYOUT_API", default_value = "http://localhost:3001")]
    api: String,

    /// Directory holding the per-account records (JSON)
    #[arg(long, env = "DATA_DIR", default_value = "minerdata")]
    data_dir: String,

    /// Storage key namespace
    #[arg(long, env = "STORE_NAMESPACE", default_value = "solminer")]
    namespace: String,

    /// Payout address; without one, nothing is persisted and withdrawals are refused
    #[arg(long, env = "PAYOUT_ADDRESS")]
    account: Option<String>,

    /// Give up on the payout service after this many seconds
    #[arg(long, env = "PAYOUT_TIMEOUT_SECS", default_value_t = 30)]
    payout_timeout_secs: u64,

    /// Log level (error|warn|info|debug|trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated session with passive income and the live dashboard
    Run {
        /// How long to run, in seconds
        #[arg(long, default_value_t = 60)]
        seconds: u64,

        /// Skip the simulated runner; only the passive ticker earns
        #[arg(long, default_value_t = false)]
        passive_only: bool,
    },
    /// Withdraw the whole pending balance of --account
    Withdraw,
    /// Print the stored stats and withdrawal history of --account
    Stats,
    /// Print the distance milestone reward table
    Milestones,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = cli.log.clone(); // avoid moving cli
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log))
        .init();

    match &cli.command {
        Commands::Run { seconds, passive_only } => cmd_run(&cli, *seconds, *passive_only).await?,
        Commands::Withdraw => cmd_withdraw(&cli).await?,
        Commands::Stats => cmd_stats(&cli)?,
        Commands::Milestones => cmd_milestones(),
    }

    Ok(())
}

fn open_repo(cli: &Cli) -> anyhow::Result<Arc<AccountRepository<FileStore>>> {
    let store = FileStore::new(&cli.data_dir)?;
    Ok(Arc::new(AccountRepository::new(store, cli.namespace.clone())))
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig { payout_timeout: Duration::from_secs(cli.payout_timeout_secs), ..Default::default() }
}

async fn cmd_run(cli: &Cli, seconds: u64, passive_only: bool) -> anyhow::Result<()> {
    let repo = open_repo(cli)?;
    let client = api::PayoutClient::new(cli.api.clone())?;
    let (engine, task) = spawn_engine(repo, Arc::new(client), engine_config(cli));

    if cli.account.is_none() {
        tracing::warn!("no payout address given; progress will not be saved");
    }
    engine.select_account(cli.account.clone()).await?;
    tokio::spawn(dashboard::launch_dashboard(engine.subscribe()));

    engine.toggle_passive().await?;
    let duration = Duration::from_secs(seconds);
    if passive_only {
        tokio::time::sleep(duration).await;
    } else {
        engine.toggle_active().await?;
        sim::run_simulation(engine.clone(), sim::SimConfig::default(), duration).await?;
    }

    let snap = engine.refresh().await?;
    println!("{}", dashboard::render(&snap));
    snap.history.log_totals();

    engine.shutdown().await;
    task.await.context("engine task panicked")?;
    Ok(())
}

async fn cmd_withdraw(cli: &Cli) -> anyhow::Result<()> {
    let repo = open_repo(cli)?;
    let client = api::PayoutClient::new(cli.api.clone())?;
    let (engine, task) = spawn_engine(repo, Arc::new(client), engine_config(cli));
    engine.select_account(cli.account.clone()).await?;

    let result = engine.request_withdrawal().await;
    engine.shutdown().await;
    task.await.context("engine task panicked")?;

    match result {
        Ok(rec) => {
            println!("withdrawn {:.6} SOL to {} (tx {})", rec.amount_sol(), rec.recipient, rec.tx_hash);
            Ok(())
        }
        Err(e) => {
            tracing::error!(kind = ?e.kind(), "{e}");
            Err(e.into())
        }
    }
}

fn cmd_stats(cli: &Cli) -> anyhow::Result<()> {
    let repo = open_repo(cli)?;
    let loaded = repo.load(cli.account.as_deref())?;
    let (completed, withdrawn, in_flight) = loaded.history.totals();
    let out = serde_json::json!({
        "account": cli.account,
        "stats": loaded.stats,
        "pendingSol": loaded.stats.pending_primary(),
        "pendingSecondary": loaded.stats.pending_secondary(),
        "history": loaded.history,
        "totals": {
            "completed": completed,
            "withdrawnSol": lamports_to_sol(withdrawn),
            "inFlight": in_flight,
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_milestones() {
    let rows = table_rows();
    let last = rows.len() - 1;
    for (i, (distance, reward)) in rows.into_iter().enumerate() {
        let suffix = if i == last { " (and every further 100m)" } else { "" };
        println!("{:>5}m  {:.5} SOL{}", distance, lamports_to_sol(reward), suffix);
    }
}
