//! Call session records and the call state machine
//!
//! A [`CallSession`] is owned by the session registry and referenced
//! everywhere else by its [`SessionId`]. The transport capability addresses
//! the same call by an opaque [`CallHandle`].
//!
//! ```text
//!   Initiating ──► Ringing ──► Established ◄──► Held
//!       │  │          │  │          │             │
//!       │  └──────────┼──┴──► Terminated ◄────────┘
//!       └──────────►  └────► Failed
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lines::LineNumber;

/// Registry-generated identifier of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Transport-level handle of the dialog backing a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallHandle(pub String);

impl CallHandle {
    /// Generate a handle for an outbound call before the invite is sent
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Current state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Outbound invite is being sent
    Initiating,
    /// Provisional response received (outbound) or invite received (inbound)
    Ringing,
    /// Call answered, media flowing
    Established,
    /// Media direction renegotiated to hold
    Held,
    /// Call ended normally, by cancel, decline or transfer
    Terminated,
    /// Call never got established
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }

    /// Established or held; the call has been answered and not yet ended
    pub fn is_answered(&self) -> bool {
        matches!(self, CallState::Established | CallState::Held)
    }

    /// Check whether `next` is an edge of the call state machine
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (*self, next),
            (Initiating, Ringing)
                | (Initiating, Established)
                | (Initiating, Failed)
                | (Initiating, Terminated)
                | (Ringing, Established)
                | (Ringing, Failed)
                | (Ringing, Terminated)
                | (Established, Held)
                | (Held, Established)
                | (Established, Terminated)
                | (Held, Terminated)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Initiating => "Initiating",
            CallState::Ringing => "Ringing",
            CallState::Established => "Established",
            CallState::Held => "Held",
            CallState::Terminated => "Terminated",
            CallState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// How a call ended, as reported to history consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Transferred,
    Rejected,
    Cancelled,
    Missed,
    Busy,
    Failed,
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallOutcome::Completed => "completed",
            CallOutcome::Transferred => "transferred",
            CallOutcome::Rejected => "rejected",
            CallOutcome::Cancelled => "cancelled",
            CallOutcome::Missed => "missed",
            CallOutcome::Busy => "busy",
            CallOutcome::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A call tracked by the session registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: SessionId,
    pub handle: CallHandle,
    pub direction: CallDirection,
    pub state: CallState,
    /// `None` while the session waits for a free line
    pub line: Option<LineNumber>,
    /// Dialled or calling number (user part of the remote URI)
    pub remote_number: String,
    /// Full remote identity, e.g. `sip:1001@pbx.example.com`
    pub remote_identity: Option<String>,
    pub remote_display_name: Option<String>,
    pub muted: bool,
    pub recording: bool,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Last provisional or final response code seen for this dialog
    pub last_response_code: Option<u16>,
}

impl CallSession {
    pub fn new(
        id: SessionId,
        handle: CallHandle,
        direction: CallDirection,
        state: CallState,
        remote_number: String,
    ) -> Self {
        Self {
            id,
            handle,
            direction,
            state,
            line: None,
            remote_number,
            remote_identity: None,
            remote_display_name: None,
            muted: false,
            recording: false,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            last_response_code: None,
        }
    }

    pub fn is_on_hold(&self) -> bool {
        self.state == CallState::Held
    }

    /// Talk time: from answer until end (or now while the call is up)
    pub fn duration(&self) -> Duration {
        let Some(answered) = self.answered_at else {
            return Duration::ZERO;
        };
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - answered).to_std().unwrap_or_default()
    }

    pub fn to_record(&self, outcome: CallOutcome) -> CallRecord {
        CallRecord {
            session_id: self.id,
            number: self.remote_number.clone(),
            display_name: self.remote_display_name.clone(),
            direction: self.direction,
            outcome,
            started_at: self.created_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
            duration: self.duration(),
        }
    }
}

/// Call-history entry emitted when an answered call ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub session_id: SessionId,
    pub number: String,
    pub display_name: Option<String>,
    pub direction: CallDirection,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

impl CallRecord {
    /// JSON form for call-history storage
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Extract the dialable number from a SIP URI or plain target.
///
/// `"Alice" <sip:1001@pbx.example.com;transport=ws>` yields `1001`.
pub fn number_from_uri(uri: &str) -> String {
    let inner = match (uri.find('<'), uri.rfind('>')) {
        (Some(start), Some(end)) if start < end => &uri[start + 1..end],
        _ => uri,
    };
    let without_scheme = inner
        .strip_prefix("sips:")
        .or_else(|| inner.strip_prefix("sip:"))
        .or_else(|| inner.strip_prefix("tel:"))
        .unwrap_or(inner);
    let user = without_scheme
        .split(|c| c == '@' || c == ';' || c == '?')
        .next()
        .unwrap_or(without_scheme);
    user.trim().to_string()
}
