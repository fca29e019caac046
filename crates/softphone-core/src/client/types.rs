//! Value types returned by engine commands

use serde::{Deserialize, Serialize};

use crate::lines::LineNumber;
use crate::registration::{RegistrationState, TransportState};

/// Statistics about the engine, recomputed on every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub transport: TransportState,
    pub registration: RegistrationState,
    /// Sessions created since the engine was built
    pub total_calls: u64,
    pub answered_calls: u64,
    pub inbound_calls: u64,
    pub outbound_calls: u64,
    /// Sessions currently tracked (any non-terminal state)
    pub active_calls: usize,
    /// Sessions waiting for a free line
    pub waiting_calls: usize,
    pub occupied_lines: usize,
    pub selected_line: LineNumber,
    pub transfers_in_flight: usize,
    pub monitored_extensions: usize,
    pub active_subscriptions: usize,
}

/// Outcome of a batched BLF subscribe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlfBatchReport {
    pub subscribed: Vec<String>,
    pub failed: Vec<String>,
    /// Stored in the desired set; subscribed once registered
    pub deferred: Vec<String>,
}

impl BlfBatchReport {
    /// Nothing failed and nothing is waiting for registration
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }
}
