use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::recovery::ReconnectPolicy;
use crate::dtmf::DtmfConfig;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::logging::LoggingConfig;
use crate::presence::PresenceConfig;
use crate::registration::{RegistrationConfig, ServerConfig};

/// Call handling preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Upper bound for the transport to accept an outbound invite
    pub invite_timeout_ms: u64,
    /// Put other established calls on hold before answering
    pub auto_hold_on_answer: bool,
    /// Status code sent when the agent rejects a ringing call
    pub reject_code: u16,
}

impl CallConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_millis(self.invite_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            invite_timeout_ms: 32_000,
            auto_hold_on_answer: true,
            reject_code: 486,
        }
    }
}

/// Configuration for the softphone engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub registration: RegistrationConfig,
    pub reconnect: ReconnectPolicy,
    pub calls: CallConfig,
    pub dtmf: DtmfConfig,
    pub presence: PresenceConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Defaults for everything except the server and the account
    pub fn new(server: ServerConfig, registration: RegistrationConfig) -> Self {
        Self {
            server,
            registration,
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml_str(document: &str) -> SoftphoneResult<Self> {
        let config: EngineConfig = toml::from_str(document).map_err(|e| SoftphoneError::InvalidConfiguration {
            field: "toml".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialise back to TOML, e.g. to save edited settings
    pub fn to_toml_string(&self) -> SoftphoneResult<String> {
        toml::to_string_pretty(self).map_err(|e| SoftphoneError::InvalidConfiguration {
            field: "toml".to_string(),
            reason: e.to_string(),
        })
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> SoftphoneResult<()> {
        fn invalid(field: &str, reason: &str) -> SoftphoneError {
            SoftphoneError::InvalidConfiguration {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.server.uri.trim().is_empty() {
            return Err(invalid("server.uri", "must not be empty"));
        }
        if self.server.connect_timeout_ms == 0 {
            return Err(invalid("server.connect_timeout_ms", "must be positive"));
        }
        if self.registration.aor.trim().is_empty() {
            return Err(invalid("registration.aor", "must not be empty"));
        }
        if self.registration.timeout_ms == 0 {
            return Err(invalid("registration.timeout_ms", "must be positive"));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(invalid("reconnect.backoff_multiplier", "must be at least 1.0"));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(invalid("reconnect.initial_delay_ms", "exceeds max_delay_ms"));
        }
        if self.calls.invite_timeout_ms == 0 {
            return Err(invalid("calls.invite_timeout_ms", "must be positive"));
        }
        if !(400..=699).contains(&self.calls.reject_code) {
            return Err(invalid("calls.reject_code", "must be a 4xx-6xx status code"));
        }
        if self.dtmf.tone_duration_ms == 0 {
            return Err(invalid("dtmf.tone_duration_ms", "must be positive"));
        }
        if self.presence.batch_size == 0 {
            return Err(invalid("presence.batch_size", "must be positive"));
        }
        if self.presence.refresh_margin_secs >= self.presence.subscription_expires_secs {
            return Err(invalid("presence.refresh_margin_secs", "must be shorter than the subscription expiry"));
        }
        if self.presence.stale_multiplier == 0 {
            return Err(invalid("presence.stale_multiplier", "must be positive"));
        }
        if self.presence.health_check_interval_secs == 0 {
            return Err(invalid("presence.health_check_interval_secs", "must be positive"));
        }
        Ok(())
    }
}
