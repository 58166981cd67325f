//! Infrastructure layer: locking, execution ledgers, configuration and the
//! orchestrator that ties them to the engine.

pub mod config;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod samples;


pub use config::{BatchConfig, ConfigError, LockConfig};
pub use ledger::{ExecutionLedger, InMemoryLedger, LedgerError, PostgresLedger};
pub use lock::{BatchLock, InMemoryLockManager, LockError, LockLease, LockManager, ManualClock, OwnerToken};
pub use orchestrator::{ExecutionHandle, Orchestrator, OrchestratorBuilder, RunRequest};
