//! Moves USDC through Circle Gateway into an on-chain treasury.
//!
//! Deposits fund a unified balance on any configured source chain. A
//! transfer burns from that balance with a signed intent, mints on the
//! destination chain against the service's attestation, and forwards the
//! minted USDC to the destination treasury. Every transfer is a persisted
//! job that can be resumed after a crash.

pub mod amount;
pub mod attestation;
mod bindings;
pub mod chain;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod deposit;
pub mod intent;
pub mod job;
pub mod mint;
pub mod signer;
pub mod store;
pub mod treasury;
pub mod updates;

pub use config::setup_tracing;

#[cfg(test)]
mod integration_tests;

#[cfg(test)]
pub(crate) mod test_utils;
