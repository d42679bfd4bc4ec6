//! Network mediation for the agentbox sandbox.
//!
//! `agentbox-proxy` sits between a sandboxed agent and the network:
//!
//! 1. **CONNECT tunnel** (`connect`) - Opaque HTTPS tunnelling. Hosts with a
//!    credential rule get a `SKIP` audit entry, since injecting into TLS
//!    would require terminating it.
//!
//! 2. **Plain HTTP forwarding** (`forward`) - The proxy injects the real API
//!    credential for the target host and forwards to the upstream.
//!
//! 3. **Environment sanitization** (`env`) - Secret-shaped variables are
//!    stripped before any child process is spawned, so the credentials
//!    reach the network only through the proxy.
//!
//! Every decision is appended to an audit log (`audit`) whose free text is
//! masked by the `redact` module.

pub mod audit;
pub mod config;
mod connect;
pub mod credential;
pub mod env;
pub mod error;
mod forward;
pub mod redact;
pub mod server;

pub use audit::{AuditAction, AuditLogger};
pub use config::{AuthRuleConfig, EnvConfig, ProxyConfig};
pub use credential::AuthInjector;
pub use env::EnvSanitizer;
pub use error::{ProxyError, Result};
pub use redact::Redactor;
pub use server::{start, ProxyHandle, ProxyServer};
