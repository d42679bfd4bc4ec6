//! agentbox CLI - network mediation for sandboxed agents
//!
//! Wires the agentbox-proxy library into two commands: `proxy` runs the
//! proxy in the foreground, `exec` runs a child process behind it with a
//! sanitized environment.

mod cli;
mod config;

use agentbox_proxy::{
    AuditLogger, AuthInjector, EnvSanitizer, ProxyError, ProxyServer, Redactor, Result,
};
use clap::Parser;
use cli::{Cli, Commands, CommonArgs, ExecArgs};
use config::Config;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("agentbox: {}", e);
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` decides the filter unless `-v` was given.
fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Proxy(args) => runtime.block_on(run_proxy(args)).map(|()| 0),
        Commands::Exec(args) => runtime.block_on(run_exec(args)),
    }
}

/// Resolve configuration and open the audit log it names.
fn prepare(args: &CommonArgs) -> Result<(Config, Arc<AuditLogger>)> {
    let config = Config::resolve(args.config.as_deref())?;
    let log_path = config.log_path(args.log.as_deref());

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ProxyError::AuditLog {
            path: log_path.clone(),
            source: e,
        })?;
    }

    let redactor = Redactor::new(&config.proxy.redact_patterns);
    let audit = AuditLogger::open(&log_path, redactor)?;
    info!("Audit log: {}", log_path.display());
    Ok((config, Arc::new(audit)))
}

fn injector_for(config: &Config) -> AuthInjector {
    let injector = AuthInjector::from_env(&config.proxy.inject_auth);
    if injector.is_empty() {
        eprintln!("agentbox: no credentials configured for injection");
    } else {
        let hosts: Vec<String> = injector.hosts().into_iter().collect();
        eprintln!("agentbox: injecting credentials for {}", hosts.join(", "));
    }
    injector
}

async fn run_proxy(args: CommonArgs) -> Result<()> {
    let (config, audit) = prepare(&args)?;
    let injector = injector_for(&config);

    let server = ProxyServer::new(&config.proxy, injector, Arc::clone(&audit));
    eprintln!("agentbox: proxy listening on {}", server.listen_addr());

    let shutdown_rx = shutdown_on(tokio::signal::ctrl_c());
    let result = server.run(shutdown_rx).await;
    audit.close();
    result
}

/// A shutdown receiver that turns `true` once `signal` completes.
///
/// If the signal cannot be listened for, the receiver never changes and
/// the server runs until the process is killed.
fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal.await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

async fn run_exec(args: ExecArgs) -> Result<i32> {
    let (program, program_args) = args
        .command
        .split_first()
        .ok_or_else(|| ProxyError::Config("no command given".to_string()))?;

    let (config, audit) = prepare(&args.common)?;
    let injector = injector_for(&config);
    let handle = agentbox_proxy::start(&config.proxy, injector, Arc::clone(&audit)).await?;
    info!("Proxy listening on {}", handle.addr);

    let mut cmd = std::process::Command::new(program);
    cmd.args(program_args);
    EnvSanitizer::from_config(&config.env).apply(&mut cmd);
    for (key, value) in handle.env_vars() {
        cmd.env(key, value);
    }

    let status = tokio::process::Command::from(cmd)
        .status()
        .await
        .map_err(|e| ProxyError::Spawn {
            program: program.clone(),
            source: e,
        });

    handle.shutdown();
    handle.wait().await?;
    audit.close();

    Ok(exit_code(status?))
}

/// Exit code to propagate: the child's own, or 128 + signal on unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
