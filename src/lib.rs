//! Continuously priced market with best-effort stock replication between
//! independent nodes.

pub mod commodity;
pub mod config;
pub mod logging;
pub mod market;
pub mod node;
pub mod pricing;
pub mod replication;
pub mod retry;
pub mod stock;
pub mod storage;
