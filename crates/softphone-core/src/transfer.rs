//! Transfer operation records
//!
//! A blind transfer touches one session; an attended transfer couples the
//! original (held) session with a consultation session until it is completed
//! or cancelled.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Blind,
    Attended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPhase {
    Initiated,
    Ringing,
    Answered,
    Completed,
    Cancelled,
    Failed,
}

impl TransferPhase {
    /// Completed, cancelled or failed
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Cancelled | TransferPhase::Failed
        )
    }
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Initiated => "initiated",
            TransferPhase::Ringing => "ringing",
            TransferPhase::Answered => "answered",
            TransferPhase::Completed => "completed",
            TransferPhase::Cancelled => "cancelled",
            TransferPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOperation {
    pub id: TransferId,
    pub source: SessionId,
    pub consultation: Option<SessionId>,
    pub target: String,
    pub mode: TransferMode,
    pub phase: TransferPhase,
    /// The source was already on hold when the transfer started; cancelling
    /// must leave it held.
    pub source_was_held: bool,
    pub created_at: DateTime<Utc>,
}

impl TransferOperation {
    pub fn new(source: SessionId, target: impl Into<String>, mode: TransferMode, source_was_held: bool) -> Self {
        Self {
            id: TransferId::new(),
            source,
            consultation: None,
            target: target.into(),
            mode,
            phase: TransferPhase::Initiated,
            source_was_held,
            created_at: Utc::now(),
        }
    }

    pub fn involves(&self, session: SessionId) -> bool {
        self.source == session || self.consultation == Some(session)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.phase.is_final()
    }
}
