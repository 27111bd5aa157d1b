//! # pfsmon-remote
//!
//! Remote execution layer for pfsmon.
//!
//! This crate provides:
//! - The `RemoteExecutor` abstraction (run a command, push a file)
//! - An ssh/scp implementation with checksum-verified transfers
//! - A guard that caps in-flight operations and fences unreachable hosts
//! - A scripted mock for tests

mod checksum;
mod circuit_breaker;
mod command;
mod guarded;
mod mock;

pub use checksum::{parse_sha256sum, sha256_file};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use command::{shell_quote, CommandOutput, RemoteExecutor, SshExecutor};
pub use guarded::GuardedExecutor;
pub use mock::{MockCall, MockOutcome, MockRemoteExecutor, MockRule};
