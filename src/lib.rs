//! pgbroker - provision and converge multi-node PostgreSQL clusters
//!
//! The broker keeps every cluster's state in a shared key-value store,
//! places nodes across availability zones, hands out public ports and
//! reports scheduling progress back to the platform.

pub mod api;
pub mod backend;
pub mod backup;
pub mod broker;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod context;
pub mod kv;
pub mod placement;
pub mod router;
pub mod scheduler;
pub mod status;
pub mod store;
