//! Append-only audit log of proxy decisions.
//!
//! One line per entry:
//!
//! ```text
//! 2026-01-07T14:32:01Z [AUTH] host=api.anthropic.com client=127.0.0.1:50412 detail="credentials injected"
//! ```
//!
//! Free-text detail passes through the [`Redactor`] before it is written;
//! host and client address are written as given. Write failures are
//! reported through `tracing` and never reach the request path.

use crate::error::{ProxyError, Result};
use crate::redact::Redactor;
use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Decision recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// Connection or request passed through
    Pass,
    /// Credential header injected
    Auth,
    /// Injection wanted but not possible
    Skip,
    /// Dial, transport or upgrade failure
    Error,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Pass => write!(f, "PASS"),
            AuditAction::Auth => write!(f, "AUTH"),
            AuditAction::Skip => write!(f, "SKIP"),
            AuditAction::Error => write!(f, "ERROR"),
        }
    }
}

/// Writes redacted audit entries to a file owned by this logger.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    /// `None` once closed.
    file: Mutex<Option<File>>,
    redactor: Redactor,
}

impl AuditLogger {
    /// Open (or create) `path` for appending with owner-only permissions.
    pub fn open(path: impl AsRef<Path>, redactor: Redactor) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);

        let file = options.open(&path).map_err(|e| ProxyError::AuditLog {
            path: path.clone(),
            source: e,
        })?;

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            redactor,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A tunnel or request passed through.
    pub fn log_pass(&self, host: &str, client: &str) {
        self.log(AuditAction::Pass, host, Some(client), None);
    }

    /// A credential header was injected.
    pub fn log_auth_injected(&self, host: &str, client: &str) {
        self.log(
            AuditAction::Auth,
            host,
            Some(client),
            Some("credentials injected"),
        );
    }

    /// Injection was configured for `host` but could not be performed.
    pub fn log_skipped(&self, host: &str, reason: &str) {
        self.log(AuditAction::Skip, host, None, Some(reason));
    }

    /// A network operation for `host` failed.
    pub fn log_error(&self, host: &str, err: &dyn fmt::Display) {
        self.log(AuditAction::Error, host, None, Some(&err.to_string()));
    }

    /// Flush and release the file. Later calls, and later entries, are no-ops.
    pub fn close(&self) {
        let mut guard = self.lock();
        if let Some(mut file) = guard.take() {
            if let Err(e) = file.flush().and_then(|()| file.sync_all()) {
                warn!("Failed to flush audit log {}: {}", self.path.display(), e);
            }
        }
    }

    fn log(&self, action: AuditAction, host: &str, client: Option<&str>, detail: Option<&str>) {
        let mut guard = self.lock();

        let detail = detail
            .filter(|d| !d.is_empty())
            .map(|d| self.redactor.redact(d));
        let line = format_entry(action, host, client, detail.as_deref());

        debug!(
            target: "agentbox_proxy::audit",
            action = %action,
            host = host,
            client = client.unwrap_or(""),
            detail = detail.as_deref().unwrap_or(""),
            "audit entry"
        );

        match guard.as_mut() {
            Some(file) => {
                if let Err(e) = file.write_all(line.as_bytes()) {
                    warn!(
                        "Failed to write audit entry to {}: {}",
                        self.path.display(),
                        e
                    );
                }
            }
            None => warn!("Audit log {} is closed; entry dropped", self.path.display()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        // A panic while holding the lock cannot leave a partial line behind
        // (each entry is one write), so a poisoned lock is still usable.
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render one entry, newline included.
fn format_entry(action: AuditAction, host: &str, client: Option<&str>, detail: Option<&str>) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut line = format!("{} [{}] host={}", timestamp, action, host);
    if let Some(client) = client.filter(|c| !c.is_empty()) {
        line.push_str(" client=");
        line.push_str(client);
    }
    if let Some(detail) = detail {
        line.push_str(&format!(" detail={:?}", detail));
    }
    line.push('\n');
    line
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry_format() -> Regex {
        Regex::new(
            r#"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z \[(PASS|AUTH|SKIP|ERROR)\] host=\S+( client=\S+)?( detail=".*")?$"#,
        )
        .unwrap()
    }

    #[test]
    fn test_entry_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let logger = AuditLogger::open(&path, Redactor::default()).unwrap();

        logger.log_pass("example.com:443", "127.0.0.1:5000");
        logger.log_auth_injected("api.anthropic.com", "127.0.0.1:5001");
        logger.log_skipped("api.anthropic.com", "no TLS interception");
        logger.log_error("nowhere:1", &"connection refused");
        logger.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            assert!(entry_format().is_match(line), "bad line: {}", line);
        }
        assert!(lines[0].ends_with("[PASS] host=example.com:443 client=127.0.0.1:5000"));
        assert!(lines[1].ends_with(
            "[AUTH] host=api.anthropic.com client=127.0.0.1:5001 detail=\"credentials injected\""
        ));
        assert!(lines[2].ends_with("[SKIP] host=api.anthropic.com detail=\"no TLS interception\""));
        assert!(lines[3].ends_with("[ERROR] host=nowhere:1 detail=\"connection refused\""));
    }

    #[test]
    fn test_detail_is_redacted_host_is_not() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let redactor = Redactor::new(&[r"sk-ant-[a-zA-Z0-9-]+"]);
        let logger = AuditLogger::open(&path, redactor).unwrap();

        logger.log_error("sk-ant-host", &"upstream echoed sk-ant-api03-abcdefghijkl");
        logger.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("host=sk-ant-host "));
        assert!(!content.contains("abcdefghijkl"));
        assert!(content.contains("sk-a...ijkl[REDACTED]"));
    }

    #[test]
    fn test_detail_quoting_escapes_newlines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let logger = AuditLogger::open(&path, Redactor::default()).unwrap();

        logger.log_error("h", &"line one\nline \"two\"");
        logger.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains(r#"detail="line one\nline \"two\"""#));
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        std::fs::write(&path, "earlier line\n").unwrap();

        let logger = AuditLogger::open(&path, Redactor::default()).unwrap();
        logger.log_pass("h", "c");
        logger.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("earlier line\n"));
        assert_eq!(content.lines().count(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let _logger = AuditLogger::open(&path, Redactor::default()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let logger = AuditLogger::open(&path, Redactor::default()).unwrap();

        logger.close();
        logger.close();
        logger.log_pass("after-close", "c");
        drop(logger);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("network.log");
        let err = AuditLogger::open(&path, Redactor::default()).unwrap_err();
        assert!(matches!(err, ProxyError::AuditLog { .. }));
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        const WRITERS: usize = 8;
        const ENTRIES: usize = 200;

        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        let logger = Arc::new(AuditLogger::open(&path, Redactor::default()).unwrap());

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let logger = Arc::clone(&logger);
                std::thread::spawn(move || {
                    for i in 0..ENTRIES {
                        logger.log_error(&format!("writer{}.example", w), &format!("entry {}", i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        logger.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let re = entry_format();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), WRITERS * ENTRIES);
        assert!(lines.iter().all(|l| re.is_match(l)));
    }
}
