//! Benchmark harness for the Block-STM executor.
//!
//! Generates blocks of signed balance transfers and runs them through a sequential
//! reference executor and through Block-STM, so that throughput and final state can
//! be compared.
//!
//! - [`workload`]: deterministic accounts and pre-signed transfers, encoded as
//!   opaque payloads
//! - [`transfer`]: the transaction logic, written once against any
//!   [`MultiView`](block_stm_executor::MultiView)
//! - [`executor`]: strategies for running a block
//!
//! ```
//! use stm_bench::{Executor, SequentialExecutor, Workload, WorkloadConfig};
//!
//! let workload = Workload::generate(WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     ..WorkloadConfig::default()
//! });
//!
//! let executor = SequentialExecutor::new(true);
//! let (_state, result) = executor.execute(workload.genesis(), &workload).unwrap();
//! assert_eq!(result.successful, 50);
//! ```

pub mod executor;
pub mod transfer;
pub mod workload;

pub use executor::{BlockStmExecutor, ExecutionResult, Executor, SequentialExecutor};
pub use workload::{
    Account, SignedTransaction, Workload, WorkloadConfig, INITIAL_BALANCE, PAYLOAD_LEN,
    TRANSFER_VALUE,
};
