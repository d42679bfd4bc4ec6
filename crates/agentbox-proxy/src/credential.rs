//! Per-host credential injection for plaintext HTTP requests.
//!
//! Secrets are resolved from the operator's environment once, when the
//! injector is built, and held in `Zeroizing<String>`. The sandboxed client
//! never sees them: the proxy sets the configured header on the outbound
//! request only.
//!
//! The rule map is never mutated after construction, so it is shared by
//! reference (`Arc<ProxyState>`) across connection tasks without a lock.

use crate::config::AuthRuleConfig;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use zeroize::Zeroizing;

/// A resolved credential ready for injection.
#[derive(Debug)]
struct InjectionRule {
    header_name: HeaderName,
    secret: Zeroizing<String>,
}

/// Credential rules keyed by lowercase, port-stripped host.
#[derive(Debug, Default)]
pub struct AuthInjector {
    rules: HashMap<String, InjectionRule>,
}

impl AuthInjector {
    /// Build rules, resolving each secret from the process environment.
    #[must_use]
    pub fn from_env(rules: &[AuthRuleConfig]) -> Self {
        Self::with_resolver(rules, |name| std::env::var(name).ok())
    }

    /// Build rules, resolving each secret with `resolve`.
    ///
    /// A rule is dropped when its secret resolves to nothing or to an empty
    /// string, or when the header name or secret is not a legal header.
    /// When several rules name the same host the last one wins.
    #[must_use]
    pub fn with_resolver<F>(rules: &[AuthRuleConfig], resolve: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut map = HashMap::new();

        for rule in rules {
            let secret = match resolve(&rule.env) {
                Some(value) if !value.is_empty() => Zeroizing::new(value),
                _ => {
                    debug!(
                        "No value for {}, not injecting credentials for {}",
                        rule.env, rule.host
                    );
                    continue;
                }
            };

            let header_name = match HeaderName::from_bytes(rule.header.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    debug!("Invalid header name {:?} for {}", rule.header, rule.host);
                    continue;
                }
            };

            if HeaderValue::from_str(&secret).is_err() {
                debug!("Value of {} is not a valid header value", rule.env);
                continue;
            }

            map.insert(
                normalize_host(&rule.host),
                InjectionRule {
                    header_name,
                    secret,
                },
            );
        }

        Self { rules: map }
    }

    /// Whether a rule exists for `hostname` (port and case ignored).
    #[must_use]
    pub fn needs_injection(&self, hostname: &str) -> bool {
        self.rules.contains_key(&normalize_host(hostname))
    }

    /// Set the configured header on `headers` if a rule matches `hostname`.
    ///
    /// Any client-supplied value for that header is replaced, not merged.
    /// Returns whether a header was injected.
    pub fn inject(&self, hostname: &str, headers: &mut HeaderMap) -> bool {
        let Some(rule) = self.rules.get(&normalize_host(hostname)) else {
            return false;
        };

        match HeaderValue::from_str(&rule.secret) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(rule.header_name.clone(), value);
                true
            }
            Err(_) => false,
        }
    }

    /// Hosts with a registered rule, for diagnostics.
    #[must_use]
    pub fn hosts(&self) -> BTreeSet<String> {
        self.rules.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

/// Lowercase host with any `:port` suffix removed.
///
/// Bracketed IPv6 literals lose their brackets. Strings with several colons
/// and no brackets are taken as a bare IPv6 address and kept whole.
#[must_use]
pub fn normalize_host(authority: &str) -> String {
    split_host(authority).to_ascii_lowercase()
}

fn split_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, _)) => host,
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => authority,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rule(host: &str, header: &str, env: &str) -> AuthRuleConfig {
        AuthRuleConfig {
            host: host.to_string(),
            header: header.to_string(),
            env: env.to_string(),
        }
    }

    fn injector(rules: &[AuthRuleConfig]) -> AuthInjector {
        AuthInjector::with_resolver(rules, |name| match name {
            "ANTHROPIC_API_KEY" => Some("sk-ant-secret".to_string()),
            "OPENAI_API_KEY" => Some("Bearer sk-openai".to_string()),
            "EMPTY_VAR" => Some(String::new()),
            "NEWLINE_VAR" => Some("bad\nvalue".to_string()),
            _ => None,
        })
    }

    #[test]
    fn test_unconfigured_host_untouched() {
        let injector = injector(&[rule("api.anthropic.com", "x-api-key", "ANTHROPIC_API_KEY")]);
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));

        assert!(!injector.needs_injection("example.com"));
        assert!(!injector.inject("example.com", &mut headers));
        assert_eq!(headers.len(), 1);
        assert!(headers.get("x-api-key").is_none());
    }

    #[test]
    fn test_inject_case_and_port_insensitive() {
        let injector = injector(&[rule("API.Anthropic.com", "x-api-key", "ANTHROPIC_API_KEY")]);

        for host in ["api.anthropic.com", "API.ANTHROPIC.COM", "api.anthropic.com:80"] {
            let mut headers = HeaderMap::new();
            assert!(injector.needs_injection(host));
            assert!(injector.inject(host, &mut headers));
            assert_eq!(headers.len(), 1);
            assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-secret");
        }
    }

    #[test]
    fn test_inject_overwrites_client_header() {
        let injector = injector(&[rule("api.openai.com", "Authorization", "OPENAI_API_KEY")]);
        let mut headers = HeaderMap::new();
        headers.append("authorization", HeaderValue::from_static("Bearer fake-1"));
        headers.append("authorization", HeaderValue::from_static("Bearer fake-2"));

        assert!(injector.inject("api.openai.com", &mut headers));
        let values: Vec<_> = headers.get_all("authorization").iter().collect();
        assert_eq!(values, vec!["Bearer sk-openai"]);
    }

    #[test]
    fn test_injected_value_is_sensitive() {
        let injector = injector(&[rule("api.anthropic.com", "x-api-key", "ANTHROPIC_API_KEY")]);
        let mut headers = HeaderMap::new();
        injector.inject("api.anthropic.com", &mut headers);
        assert!(headers.get("x-api-key").unwrap().is_sensitive());
        assert!(!format!("{:?}", headers).contains("sk-ant-secret"));
    }

    #[test]
    fn test_unresolved_and_empty_rules_dropped() {
        let injector = injector(&[
            rule("a.example", "x-key", "MISSING_VAR"),
            rule("b.example", "x-key", "EMPTY_VAR"),
            rule("c.example", "x-key", "NEWLINE_VAR"),
            rule("d.example", "bad header", "ANTHROPIC_API_KEY"),
        ]);
        assert!(injector.is_empty());
        assert!(!injector.needs_injection("a.example"));
        assert!(!injector.needs_injection("b.example"));
    }

    #[test]
    fn test_last_rule_for_host_wins() {
        let injector = injector(&[
            rule("api.example.com", "x-first", "ANTHROPIC_API_KEY"),
            rule("api.example.com", "x-second", "ANTHROPIC_API_KEY"),
        ]);
        let mut headers = HeaderMap::new();
        injector.inject("api.example.com", &mut headers);
        assert!(headers.get("x-first").is_none());
        assert!(headers.get("x-second").is_some());
        assert_eq!(injector.len(), 1);
    }

    #[test]
    fn test_hosts_are_normalized() {
        let injector = injector(&[
            rule("API.Anthropic.com", "x-api-key", "ANTHROPIC_API_KEY"),
            rule("api.openai.com:8080", "Authorization", "OPENAI_API_KEY"),
        ]);
        let hosts: Vec<String> = injector.hosts().into_iter().collect();
        assert_eq!(hosts, vec!["api.anthropic.com", "api.openai.com"]);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("example.com:"), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("[::1]"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host("127.0.0.1:3128"), "127.0.0.1");
    }
}
