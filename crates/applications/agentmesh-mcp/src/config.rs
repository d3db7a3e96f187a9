//! Process-wide configuration

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::client::ClientConfig;
use crate::error::{McpError, Result};
use crate::hub::HubConfig;
use crate::protocol::ProtocolConfig;
use crate::registry::RegistryConfig;
use crate::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Aggregated configuration for one mesh process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Circuit breaker settings shared by every client
    pub circuit_breaker: CircuitBreakerConfig,
    /// Tool registry settings
    pub registry: RegistryConfig,
    /// Signing settings for agent protocols
    pub protocol: ProtocolConfig,
    /// Template for spawned clients; `agent_id` is set per agent
    pub client: ClientConfig,
    /// Router settings
    pub router: RouterConfig,
    /// UI hub settings
    pub hub: HubConfig,
}

impl MeshConfig {
    /// Parse a TOML document; absent sections keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| McpError::Configuration(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults overridden by `AGENTMESH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("AGENTMESH_SIGNING_KEY") {
            if !key.is_empty() {
                config.protocol.signing_key = Some(key.clone());
                config.router.signing_key = Some(key);
            }
        }

        if let Ok(val) = std::env::var("AGENTMESH_REQUIRE_SIGNATURES") {
            config.protocol.require_signatures = val.parse().map_err(|e| {
                McpError::Configuration(format!("Invalid require_signatures: {}", e))
            })?;
        }

        if let Ok(val) = std::env::var("AGENTMESH_FAILURE_THRESHOLD") {
            config.circuit_breaker.failure_threshold = val.parse().map_err(|e| {
                McpError::Configuration(format!("Invalid failure_threshold: {}", e))
            })?;
        }

        if let Ok(val) = std::env::var("AGENTMESH_RECOVERY_TIMEOUT_SECS") {
            let secs: u64 = val.parse().map_err(|e| {
                McpError::Configuration(format!("Invalid recovery_timeout: {}", e))
            })?;
            config.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTMESH_RATE_LIMIT_WINDOW_SECS") {
            let secs: u64 = val.parse().map_err(|e| {
                McpError::Configuration(format!("Invalid rate_limit_window: {}", e))
            })?;
            config.registry.rate_limit_window = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTMESH_MAX_ACTIVITIES") {
            config.hub.max_activities = val.parse().map_err(|e| {
                McpError::Configuration(format!("Invalid max_activities: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a component outright
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(McpError::Configuration(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(McpError::Configuration(
                "half_open_max_calls must be greater than zero".to_string(),
            ));
        }
        if self.registry.rate_limit_window.is_zero() {
            return Err(McpError::Configuration(
                "rate_limit_window must be greater than zero".to_string(),
            ));
        }
        if self.client.call_timeout.is_zero() {
            return Err(McpError::Configuration(
                "call_timeout must be greater than zero".to_string(),
            ));
        }
        if self.router.step_timeout.is_zero() {
            return Err(McpError::Configuration(
                "step_timeout must be greater than zero".to_string(),
            ));
        }
        if self.hub.max_activities == 0 {
            return Err(McpError::Configuration(
                "max_activities must be greater than zero".to_string(),
            ));
        }
        if self.protocol.require_signatures && self.protocol.signing_key.is_none() {
            return Err(McpError::Configuration(
                "require_signatures needs a signing_key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a `Duration` as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Serde adapter storing a `Duration` as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.registry.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.hub.max_activities, 1000);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MeshConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 2
            recovery_timeout_secs = 5

            [registry]
            rate_limit_window_secs = 10

            [client]
            call_timeout_ms = 1500

            [router]
            step_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
        assert_eq!(config.registry.rate_limit_window, Duration::from_secs(10));
        assert_eq!(config.client.call_timeout, Duration::from_millis(1500));
        assert_eq!(config.router.step_timeout, Duration::from_millis(2500));
        assert_eq!(config.hub.recent_activity_limit, 50);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = MeshConfig::from_toml_str("[circuit_breaker]\nfailure_threshold = 0\n")
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));

        let err = MeshConfig::from_toml_str("[registry]\nrate_limit_window_secs = 0\n")
            .unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));

        let err = MeshConfig::from_toml_str("[router]\nstep_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, McpError::Configuration(_)));
    }

    #[test]
    fn test_required_signatures_need_key() {
        let mut config = MeshConfig::default();
        config.protocol.require_signatures = true;
        assert!(config.validate().is_err());
        config.protocol.signing_key = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }
}
