//! CLI comparing the sequential and the Block-STM executor on transfer workloads.

use block_stm_executor::BlockStmError;
use clap::Parser;
use std::time::{Duration, Instant};
use stm_bench::{BlockStmExecutor, Executor, SequentialExecutor, Workload, WorkloadConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Benchmark Block-STM against sequential execution")]
struct Args {
    /// Number of funded accounts.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,

    /// Transactions per block.
    #[arg(long, default_value_t = 1000)]
    transactions: usize,

    /// Conflict factors to run, between 0.0 and 1.0.
    #[arg(long, value_delimiter = ',', default_values_t = [0.0, 0.25, 0.5, 0.75, 1.0])]
    conflict: Vec<f64>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Block-STM worker threads, 0 for one per CPU.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Skip signature verification.
    #[arg(long)]
    no_verify: bool,

    /// Seed the multi-version memory with estimated write-sets.
    #[arg(long)]
    pre_estimate: bool,
}

#[derive(Debug, thiserror::Error)]
enum BenchError {
    #[error(transparent)]
    Execution(#[from] BlockStmError),

    #[error("final states differ at conflict factor {0}")]
    StateMismatch(f64),
}

fn main() -> Result<(), BenchError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let verify = !args.no_verify;
    let sequential = SequentialExecutor::new(verify);
    let block_stm =
        BlockStmExecutor::new(args.threads, verify).with_pre_estimate(args.pre_estimate);

    println!(
        "Configuration: {} accounts, {} transactions per block, signature verification {}\n",
        args.accounts,
        args.transactions,
        if verify { "on" } else { "off" }
    );
    println!(
        "{:10} | {:>10} | {:>10} | {:>12} | {:>12} | {:>7}",
        "conflict", "successful", "failed", "seq tx/s", "stm tx/s", "speedup"
    );

    for &conflict_factor in &args.conflict {
        let config = WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            conflict_factor,
            seed: args.seed,
            chain_id: 1,
        };

        // Generate workload (includes signing).
        let workload = Workload::generate(config);

        let (expected, seq_elapsed, _) = timed(&sequential, &workload)?;
        let (state, stm_elapsed, result) = timed(&block_stm, &workload)?;
        if state != expected {
            return Err(BenchError::StateMismatch(conflict_factor));
        }

        let tps = |elapsed: Duration| args.transactions as f64 / elapsed.as_secs_f64();
        println!(
            "{:10.2} | {:>10} | {:>10} | {:>12.0} | {:>12.0} | {:>6.2}x",
            conflict_factor,
            result.successful,
            result.failed,
            tps(seq_elapsed),
            tps(stm_elapsed),
            seq_elapsed.as_secs_f64() / stm_elapsed.as_secs_f64()
        );
    }

    info!("final states of both executors match");
    Ok(())
}

fn timed(
    executor: &dyn Executor,
    workload: &Workload,
) -> Result<(stm_bench::transfer::BankState, Duration, stm_bench::ExecutionResult), BenchError> {
    let state = workload.genesis();
    let start = Instant::now();
    let (state, result) = executor.execute(state, workload)?;
    let elapsed = start.elapsed();
    info!(
        executor = executor.name(),
        ?elapsed,
        successful = result.successful,
        "workload executed"
    );
    Ok((state, elapsed, result))
}
