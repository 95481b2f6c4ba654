//! CLI comparing the sequential and grouped executors.

use clap::{Parser, ValueEnum};
use pall_test::{Executor, GroupedExecutor, SequentialExecutor, Workload, WorkloadConfig};
use pall_tx_executor::GroupingStrategy;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Grouping {
    Greedy,
    UnionFind,
}

impl From<Grouping> for GroupingStrategy {
    fn from(grouping: Grouping) -> Self {
        match grouping {
            Grouping::Greedy => GroupingStrategy::Greedy,
            Grouping::UnionFind => GroupingStrategy::UnionFind,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "pall-test", about = "Benchmark grouped speculative block execution")]
struct Args {
    /// Number of accounts in the workload.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Number of transactions per block.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Conflict factors to run, comma separated.
    #[arg(long, value_delimiter = ',', default_values_t = [0.0, 0.25, 0.5, 0.75, 1.0])]
    conflicts: Vec<f64>,

    /// Worker threads for the grouped executor.
    #[arg(long, default_value_t = 8)]
    workers: usize,

    #[arg(long, value_enum, default_value_t = Grouping::UnionFind)]
    grouping: Grouping,

    /// Block gas limit.
    #[arg(long, default_value_t = 30_000_000)]
    gas_limit: u64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Skip signature verification.
    #[arg(long)]
    no_verify: bool,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let verify = !args.no_verify;
    info!(?args, "starting");

    println!("=== Grouped Execution Benchmark ===\n");
    println!(
        "Configuration: {} accounts, {} transactions per block, {} workers, verification {}\n",
        args.accounts,
        args.transactions,
        args.workers,
        if verify { "on" } else { "off" }
    );

    let sequential = SequentialExecutor::new(verify);
    let grouped = GroupedExecutor::new(args.workers, verify).with_grouping(args.grouping.into());

    for &conflict_factor in &args.conflicts {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            block_gas_limit: args.gas_limit,
            ..Default::default()
        })?;

        let label = format!("{:.0}% conflicts", conflict_factor * 100.0);
        run(&label, &sequential, &workload)?;
        run(&label, &grouped, &workload)?;
    }

    Ok(())
}

fn run<E>(label: &str, executor: &E, workload: &Workload) -> eyre::Result<()>
where
    E: Executor<Database = revm::database::CacheDB<revm::database::EmptyDB>>,
{
    let db = workload.create_db();

    let start = Instant::now();
    let (_, result) = executor.execute(db, workload)?;
    let elapsed = start.elapsed();

    let tps = result.total() as f64 / elapsed.as_secs_f64();
    println!(
        "{:16} | {:10} | {:5} successful | {:5} failed | {:8.2} ms | {:8.0} tx/s",
        label,
        executor.name(),
        result.successful,
        result.failed,
        elapsed.as_secs_f64() * 1000.0,
        tps
    );
    Ok(())
}
