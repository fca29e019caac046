//! Engine builder
//!
//! [`EngineBuilder`] assembles a [`SoftphoneEngine`] from an injected
//! [`SignalingTransport`] and an [`EngineConfig`], either given whole or
//! overridden piece by piece.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use softphone_core::{EngineBuilder, SignalingTransport, SoftphoneResult};
//! # use softphone_core::registration::{RegistrationConfig, ServerConfig};
//! # fn demo(transport: Arc<dyn SignalingTransport>) -> SoftphoneResult<()> {
//! let engine = EngineBuilder::new(transport)
//!     .server(ServerConfig::new("sip:pbx.example.com:5060", "example.com"))
//!     .registration(RegistrationConfig::new("sip:1000@example.com").with_credentials("1000", "secret"))
//!     .monitored_extensions(["2001", "2002"])
//!     .build()?;
//! # drop(engine);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::client::config::EngineConfig;
use crate::client::manager::SoftphoneEngine;
use crate::client::recovery::ReconnectPolicy;
use crate::dtmf::DtmfConfig;
use crate::error::SoftphoneResult;
use crate::presence::PresenceConfig;
use crate::registration::{RegistrationConfig, ServerConfig};
use crate::transport::SignalingTransport;

/// Fluent builder for [`SoftphoneEngine`]
pub struct EngineBuilder {
    transport: Arc<dyn SignalingTransport>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Start from the default configuration
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            config: EngineConfig::default(),
        }
    }

    /// Start from a complete configuration, e.g. one loaded from TOML
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server(mut self, server: ServerConfig) -> Self {
        self.config.server = server;
        self
    }

    pub fn registration(mut self, registration: RegistrationConfig) -> Self {
        self.config.registration = registration;
        self
    }

    /// Backoff used after the transport drops
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// How long an outbound INVITE may take to be accepted
    pub fn invite_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.calls.invite_timeout_ms = timeout_ms;
        self
    }

    /// Hold other established calls when answering (on by default)
    pub fn auto_hold_on_answer(mut self, enabled: bool) -> Self {
        self.config.calls.auto_hold_on_answer = enabled;
        self
    }

    pub fn dtmf(mut self, dtmf: DtmfConfig) -> Self {
        self.config.dtmf = dtmf;
        self
    }

    pub fn presence(mut self, presence: PresenceConfig) -> Self {
        self.config.presence = presence;
        self
    }

    /// Extensions to monitor once registered
    pub fn monitored_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.presence.monitored_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration and create the engine
    pub fn build(self) -> SoftphoneResult<SoftphoneEngine> {
        self.config.validate()?;
        Ok(SoftphoneEngine::new(self.config, self.transport))
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder").field("config", &self.config).finish()
    }
}
