//! Proxy configuration types.
//!
//! Parsing of the on-disk project configuration belongs to the caller; these
//! types only describe what the proxy and the environment sanitizer consume.

use crate::env::DEFAULT_BLOCKED_PATTERNS;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default listening port for the proxy.
pub const DEFAULT_PROXY_PORT: u16 = 3128;

/// Configuration for the proxy server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Bind port (default: 3128, 0 = OS-assigned ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-host credential injection rules, in configuration order.
    #[serde(default = "default_inject_auth")]
    pub inject_auth: Vec<AuthRuleConfig>,

    /// Regular expressions for secrets that must never reach the audit log.
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            inject_auth: default_inject_auth(),
            redact_patterns: default_redact_patterns(),
        }
    }
}

impl ProxyConfig {
    /// Socket address the listener binds to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_inject_auth() -> Vec<AuthRuleConfig> {
    vec![AuthRuleConfig {
        host: "api.anthropic.com".to_string(),
        header: "x-api-key".to_string(),
        env: "ANTHROPIC_API_KEY".to_string(),
    }]
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        r"sk-ant-[a-zA-Z0-9-]+".to_string(),
        r"sk-[a-zA-Z0-9]{48}".to_string(),
    ]
}

/// One credential injection rule as written in configuration.
///
/// The secret itself never appears here: `env` names the operator's
/// environment variable that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRuleConfig {
    /// Target host (e.g. `api.anthropic.com`)
    pub host: String,
    /// Header name to set (e.g. `x-api-key`)
    pub header: String,
    /// Operator environment variable holding the secret
    pub env: String,
}

/// Environment handling for processes spawned into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Variables passed through to the child even when a block pattern matches.
    #[serde(default)]
    pub allowed_env_vars: Vec<String>,

    /// Prefix patterns, or suffix patterns when they start with `_`.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_env_patterns: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            allowed_env_vars: Vec::new(),
            blocked_env_patterns: default_blocked_patterns(),
        }
    }
}

fn default_blocked_patterns() -> Vec<String> {
    DEFAULT_BLOCKED_PATTERNS
        .iter()
        .map(|p| (*p).to_string())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.port, 3128);
        assert_eq!(config.inject_auth.len(), 1);
        assert_eq!(config.inject_auth[0].env, "ANTHROPIC_API_KEY");
        assert_eq!(config.redact_patterns.len(), 2);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: ProxyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ProxyConfig::default());

        let env: EnvConfig = serde_json::from_str("{}").unwrap();
        assert!(env.allowed_env_vars.is_empty());
        assert!(env.blocked_env_patterns.contains(&"AWS_".to_string()));
    }

    #[test]
    fn test_config_serialization() {
        let config = ProxyConfig {
            port: 0,
            inject_auth: vec![AuthRuleConfig {
                host: "api.openai.com".to_string(),
                header: "Authorization".to_string(),
                env: "OPENAI_API_KEY".to_string(),
            }],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.port, 0);
        assert_eq!(deserialized.inject_auth[0].host, "api.openai.com");
    }

    #[test]
    fn test_listen_addr() {
        let config = ProxyConfig {
            port: 9999,
            ..Default::default()
        };
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9999");
    }
}
