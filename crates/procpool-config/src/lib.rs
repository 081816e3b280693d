//! TOML configuration loading for a [`procpool_core::ProcessPool`].
//!
//! Thin on purpose: everything here maps onto a [`procpool_core::PoolSettings`]
//! once loaded. There is no merging, tiering, or profile system -- one file,
//! one pool.

mod config;

pub use config::{CharsetSetting, PoolConfig, PoolConfigSection};
