//! Seam to the SIP/WebRTC transport capability
//!
//! The engine never encodes signaling or negotiates media itself. It calls
//! into a [`SignalingTransport`] for every network action and reacts to the
//! [`TransportEvent`]s the transport reports back.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::{number_from_uri, CallHandle};
use crate::registration::{RegistrationConfig, ServerConfig};

/// Failure reported by the transport capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("request timed out")]
    Timeout,

    #[error("rejected with {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("unknown dialog {0}")]
    UnknownDialog(String),

    #[error("{0}")]
    Other(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

/// Handle of a dialog-event subscription (BLF)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub String);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dialog state carried by a dialog-info NOTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogState {
    Trying,
    Proceeding,
    Early,
    Confirmed,
    Terminated,
}

impl FromStr for DialogState {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trying" => Ok(DialogState::Trying),
            "proceeding" => Ok(DialogState::Proceeding),
            "early" => Ok(DialogState::Early),
            "confirmed" => Ok(DialogState::Confirmed),
            "terminated" => Ok(DialogState::Terminated),
            other => Err(SignalingError::Other(format!("unknown dialog state '{}'", other))),
        }
    }
}

/// An invite received from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvite {
    pub handle: CallHandle,
    /// Remote identity as received, e.g. `"Bob" <sip:1001@pbx>`
    pub from: String,
    pub to: String,
    pub headers: HashMap<String, String>,
}

impl IncomingInvite {
    pub fn new(handle: CallHandle, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            handle,
            from: from.into(),
            to: to.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn caller_number(&self) -> String {
        number_from_uri(&self.from)
    }

    /// Display name from the quoted or bare prefix of the From value,
    /// falling back to a `P-Asserted-Identity` header.
    pub fn caller_display_name(&self) -> Option<String> {
        display_name_from_header(&self.from).or_else(|| {
            self.headers
                .get("P-Asserted-Identity")
                .and_then(|pai| display_name_from_header(pai))
        })
    }
}

fn display_name_from_header(header: &str) -> Option<String> {
    if let Some(start) = header.find('"') {
        if let Some(end) = header[start + 1..].find('"') {
            let display_name = &header[start + 1..start + 1 + end];
            if !display_name.is_empty() {
                return Some(display_name.to_string());
            }
        }
    }

    if let Some(angle_pos) = header.find('<') {
        let potential_name = header[..angle_pos].trim();
        if !potential_name.is_empty() && !potential_name.starts_with("sip:") {
            return Some(potential_name.to_string());
        }
    }

    None
}

/// Events reported by the transport capability
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    TransportConnected,
    TransportDisconnected { reason: Option<String> },
    Registered,
    RegistrationFailed { reason: String },
    IncomingInvite(IncomingInvite),
    /// Provisional response (1xx) on an outbound dialog
    SessionProgress { handle: CallHandle, code: u16 },
    SessionEstablished { handle: CallHandle },
    SessionTerminated {
        handle: CallHandle,
        code: Option<u16>,
        reason: Option<String>,
    },
    Notify {
        subscription: SubscriptionHandle,
        state: DialogState,
        /// The monitored party put its peer on hold
        remote_held: bool,
    },
    /// The server ended a subscription (Subscription-State: terminated)
    SubscriptionTerminated {
        subscription: SubscriptionHandle,
        reason: Option<String>,
    },
}

/// Network-facing capability the engine drives
///
/// Every async method resolves when the transport has a definitive answer
/// for that request. Call progress after an invite is reported through
/// [`TransportEvent`]s.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> SignalingResult<()>;

    async fn disconnect(&self) -> SignalingResult<()>;

    async fn register(&self, registration: &RegistrationConfig) -> SignalingResult<()>;

    /// `graceful = false` skips waiting for the registrar's answer
    async fn unregister(&self, graceful: bool) -> SignalingResult<()>;

    /// Send an INVITE for a dialog identified by `call`
    async fn invite(&self, call: &CallHandle, target: &str) -> SignalingResult<()>;

    async fn answer(&self, call: &CallHandle) -> SignalingResult<()>;

    async fn reject(&self, call: &CallHandle, status_code: u16) -> SignalingResult<()>;

    /// CANCEL before answer, BYE after
    async fn hangup(&self, call: &CallHandle) -> SignalingResult<()>;

    /// Re-negotiate media direction (sendonly/sendrecv)
    async fn set_hold(&self, call: &CallHandle, on_hold: bool) -> SignalingResult<()>;

    /// Local microphone track control, no signaling
    fn set_microphone_muted(&self, call: &CallHandle, muted: bool) -> SignalingResult<()>;

    async fn send_dtmf(&self, call: &CallHandle, tone: char, duration: Duration) -> SignalingResult<()>;

    /// REFER to `target`; resolves once the transferee accepted (202)
    async fn refer(&self, call: &CallHandle, target: &str) -> SignalingResult<()>;

    /// REFER with Replaces pointing at the consultation dialog
    async fn refer_with_replaces(&self, call: &CallHandle, consultation: &CallHandle) -> SignalingResult<()>;

    async fn subscribe_dialog(&self, extension: &str, expires: Duration) -> SignalingResult<SubscriptionHandle>;

    async fn unsubscribe_dialog(&self, subscription: &SubscriptionHandle) -> SignalingResult<()>;
}
