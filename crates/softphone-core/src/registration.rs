//! Transport and registration state
//!
//! Connectivity is tracked as two variables: the transport (websocket/socket
//! to the PBX) and the registration on top of it. Registration can only be
//! `Registered` while the transport is `Connected`; [`Connectivity`] enforces
//! that whenever the transport changes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where and how to reach the PBX
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Signaling endpoint, e.g. `wss://pbx.example.com:8089/ws`
    pub uri: String,
    /// SIP domain used to build request URIs
    pub domain: String,
    pub connect_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(uri: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            domain: String::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Account registered with the PBX
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Address of record, e.g. `sip:2000@pbx.example.com`
    pub aor: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub display_name: Option<String>,
    /// Registration expiry requested from the registrar (seconds)
    pub expires: u32,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl RegistrationConfig {
    pub fn new(aor: impl Into<String>) -> Self {
        Self {
            aor: aor.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            aor: String::new(),
            username: None,
            password: None,
            realm: None,
            display_name: None,
            expires: 600,
            timeout_ms: 15_000,
            user_agent: concat!("softphone-core/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Disconnected => write!(f, "Disconnected"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    /// Registration was rejected or reconnection gave up
    Failed,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "Unregistered"),
            RegistrationState::Registering => write!(f, "Registering"),
            RegistrationState::Registered => write!(f, "Registered"),
            RegistrationState::Failed => write!(f, "Failed"),
        }
    }
}

/// A change produced by [`Connectivity`]; `None` fields did not change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectivityChange {
    pub transport: Option<(TransportState, TransportState)>,
    pub registration: Option<(RegistrationState, RegistrationState)>,
}

impl ConnectivityChange {
    pub fn is_empty(&self) -> bool {
        self.transport.is_none() && self.registration.is_none()
    }
}

/// Transport + registration state with the coupling invariant applied
#[derive(Debug, Clone)]
pub struct Connectivity {
    transport: TransportState,
    registration: RegistrationState,
    /// Transport was torn down on purpose; do not reconnect
    pub user_disconnected: bool,
    /// Last connectivity signal from the host environment
    pub network_online: bool,
}

impl Connectivity {
    pub fn new() -> Self {
        Self {
            transport: TransportState::Disconnected,
            registration: RegistrationState::Unregistered,
            user_disconnected: false,
            network_online: true,
        }
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn registration(&self) -> RegistrationState {
        self.registration
    }

    pub fn can_register(&self) -> bool {
        self.transport == TransportState::Connected
    }

    /// Update the transport; leaving `Connected` forces registration to
    /// `Unregistered` unless it already `Failed`.
    pub fn set_transport(&mut self, next: TransportState) -> ConnectivityChange {
        let mut change = ConnectivityChange::default();
        if self.transport != next {
            change.transport = Some((self.transport, next));
            self.transport = next;
        }
        if next != TransportState::Connected
            && matches!(
                self.registration,
                RegistrationState::Registered | RegistrationState::Registering
            )
        {
            change.registration = Some((self.registration, RegistrationState::Unregistered));
            self.registration = RegistrationState::Unregistered;
        }
        change
    }

    /// Update the registration; `Registering`/`Registered` are refused while
    /// the transport is down and leave the state untouched.
    pub fn set_registration(&mut self, next: RegistrationState) -> ConnectivityChange {
        let mut change = ConnectivityChange::default();
        let needs_transport = matches!(
            next,
            RegistrationState::Registering | RegistrationState::Registered
        );
        if needs_transport && !self.can_register() {
            return change;
        }
        if self.registration != next {
            change.registration = Some((self.registration, next));
            self.registration = next;
        }
        change
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_requires_transport() {
        let mut state = Connectivity::new();
        let change = state.set_registration(RegistrationState::Registered);
        assert!(change.is_empty());
        assert_eq!(state.registration(), RegistrationState::Unregistered);

        state.set_transport(TransportState::Connected);
        state.set_registration(RegistrationState::Registered);
        assert!(state.registration().is_registered());
    }

    #[test]
    fn test_transport_loss_forces_unregistered() {
        let mut state = Connectivity::new();
        state.set_transport(TransportState::Connected);
        state.set_registration(RegistrationState::Registered);

        let change = state.set_transport(TransportState::Disconnected);
        assert_eq!(
            change.registration,
            Some((RegistrationState::Registered, RegistrationState::Unregistered))
        );
        assert_eq!(state.registration(), RegistrationState::Unregistered);
    }

    #[test]
    fn test_failed_registration_survives_transport_loss() {
        let mut state = Connectivity::new();
        state.set_transport(TransportState::Connected);
        state.set_registration(RegistrationState::Failed);
        let change = state.set_transport(TransportState::Disconnected);
        assert!(change.registration.is_none());
        assert_eq!(state.registration(), RegistrationState::Failed);
    }

    #[test]
    fn test_config_defaults() {
        let reg = RegistrationConfig::new("sip:2000@pbx.example.com")
            .with_credentials("2000", "secret")
            .with_expires(300);
        assert_eq!(reg.expires, 300);
        assert_eq!(reg.timeout(), Duration::from_secs(15));
        assert_eq!(ServerConfig::default().connect_timeout(), Duration::from_secs(10));
    }
}
