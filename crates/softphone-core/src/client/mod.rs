//! Engine commands and the pieces that configure and drive them
//!
//! [`SoftphoneEngine`] is split across several files, each adding an
//! `impl` block for one concern. [`EngineBuilder`] creates it,
//! [`EngineConfig`] configures it and [`ReconnectPolicy`] drives the
//! reconnection backoff.

pub mod builder;
pub mod calls;
pub mod config;
pub mod connection;
pub mod controls;
pub mod manager;
pub mod presence;
pub mod recovery;
pub mod transfer;
pub mod types;

pub use builder::EngineBuilder;
pub use config::{CallConfig, EngineConfig};
pub use manager::SoftphoneEngine;
pub use recovery::{with_timeout, ReconnectBackoff, ReconnectPolicy};
pub use types::{BlfBatchReport, EngineStats};
