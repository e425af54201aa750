//! USDT-based block relay race exporter for bitcoind.
//!
//! Attaches to the FIBRE and validation USDT probes of a running bitcoind,
//! correlates the resulting events per block height to decide whether the
//! fast path (FIBRE over UDP) or the slow path (BIP152 compact blocks) won
//! each block race, and exposes the outcome as Prometheus metrics.

pub mod agent;
pub mod config;
pub mod export;
pub mod metrics;
pub mod pid;
pub mod probe;
pub mod race;
pub mod version;
