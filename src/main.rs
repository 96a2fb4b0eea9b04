mod config;
mod logging;
mod process;
mod protocol;
mod router;
mod session;
mod transport;
mod watcher;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::ProxyConfig;
use logging::{LogConfig, init_logging};
use process::{RestartHook, ShellHook, Supervisor};
use router::{ClientWriter, MessageRouter, PendingQueue};
use session::SessionTracker;
use watcher::FileWatcher;

/// CLI arguments for the proxy. The wrapped server's launch command follows
/// a `--` separator; everything before it configures the proxy itself.
#[derive(Parser, Debug)]
#[command(
    name = "mcp-hotswap",
    version,
    about = "Transparent MCP stdio proxy that hot-restarts the wrapped server on file changes"
)]
struct Args {
    /// Working directory for the proxy, the server, and the file watcher
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Additional path to watch for changes (repeatable)
    #[arg(long, value_name = "PATH")]
    watch: Vec<PathBuf>,

    /// Additional file extension to watch (repeatable)
    #[arg(long = "watch-ext", value_name = "EXT")]
    watch_ext: Vec<String>,

    /// Debounce window in seconds applied to bursts of file changes
    #[arg(long, value_name = "SECS")]
    debounce: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Disable file watching entirely
    #[arg(long)]
    no_watch: bool,

    /// Run the dependent-daemon restart hook before each watcher restart
    #[arg(long)]
    restart_daemons: bool,

    /// Log level (overrides RUST_LOG)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides MCP_LOG_FILE)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Launch command for the wrapped server, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    server_command: Vec<String>,
}

/// Parse CLI arguments, ignoring unknown flags with a warning instead of
/// failing. Returns the parsed arguments plus the flags that were ignored
/// (logged once the logging system is up).
fn parse_args_lenient(mut argv: Vec<String>) -> (Args, Vec<String>) {
    let mut ignored = Vec::new();

    // Each round either succeeds or removes one offending token
    for _ in 0..64 {
        match Args::try_parse_from(&argv) {
            Ok(args) => return (args, ignored),
            Err(err) => {
                if err.kind() == clap::error::ErrorKind::UnknownArgument
                    && let Some(flag) = unknown_flag(&err)
                    && let Some(index) = argv
                        .iter()
                        .position(|arg| *arg == flag || arg.starts_with(&format!("{flag}=")))
                {
                    ignored.push(argv.remove(index));
                    continue;
                }
                // Help, version, and genuinely malformed input exit here
                err.exit();
            }
        }
    }

    // Unreachable in practice; bail out with the canonical error
    let args = Args::try_parse_from(&argv).unwrap_or_else(|err| err.exit());
    (args, ignored)
}

fn unknown_flag(err: &clap::Error) -> Option<String> {
    match err.get(clap::error::ContextKind::InvalidArg) {
        Some(clap::error::ContextValue::String(value)) => Some(value.clone()),
        _ => None,
    }
}

/// Apply CLI overrides on top of the environment-derived configuration
fn build_config(args: &Args) -> ProxyConfig {
    let mut config = ProxyConfig::from_env(args.server_command.clone());
    config.watch_paths.extend(args.watch.iter().cloned());
    config
        .watch_extensions
        .extend(args.watch_ext.iter().cloned());
    if let Some(secs) = args.debounce {
        config.debounce = Duration::from_secs(secs);
    }
    if args.debug {
        config.debug = true;
    }
    if args.no_watch {
        config.watch_enabled = false;
    }
    if args.restart_daemons {
        config.daemon_hook_enabled = true;
    }
    config
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let (args, ignored_flags) = parse_args_lenient(std::env::args().collect());

    if let Some(dir) = &args.cwd
        && let Err(e) = std::env::set_current_dir(dir)
    {
        eprintln!("failed to change directory to {}: {e}", dir.display());
        std::process::exit(1);
    }

    let config = build_config(&args);

    let level_override = args
        .log_level
        .clone()
        .or_else(|| config.debug.then(|| "debug".to_string()));
    let log_config = LogConfig::from_env().with_overrides(level_override, args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    for flag in &ignored_flags {
        warn!(flag = %flag, "ignoring unknown argument");
    }

    if config.server_command.is_empty() {
        eprintln!("error: no server command supplied");
        eprintln!("usage: mcp-hotswap [OPTIONS] -- <COMMAND> [ARGS]...");
        std::process::exit(1);
    }

    info!(command = ?config.server_command, "starting proxy");
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let writer = Arc::new(ClientWriter::stdout());
    let session = Arc::new(SessionTracker::new());
    let pending = Arc::new(PendingQueue::new());
    let (server_tx, server_rx) = mpsc::unbounded_channel();

    let hook: Option<Arc<dyn RestartHook>> = if config.daemon_hook_enabled {
        config
            .restart_hook_command
            .clone()
            .map(|command| Arc::new(ShellHook::new(command)) as Arc<dyn RestartHook>)
    } else {
        None
    };

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&session),
        Arc::clone(&pending),
        server_tx,
        hook,
    ));

    if !supervisor.start(false).await {
        eprintln!("error: failed to start server command");
        std::process::exit(1);
    }

    let router = Arc::new(MessageRouter::new(
        Arc::clone(&session),
        Arc::clone(&supervisor),
        Arc::clone(&writer),
        Arc::clone(&pending),
    ));

    let output_relay = tokio::spawn(transport::relay_server_output(
        Arc::clone(&router),
        server_rx,
        shutdown.clone(),
    ));

    let watcher_task = config.watch_enabled.then(|| {
        let watcher = FileWatcher::new(
            Arc::clone(&config),
            Arc::clone(&supervisor),
            Arc::clone(&writer),
        );
        tokio::spawn(watcher.run(shutdown.clone()))
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!("shutdown signal handler failed: {e}"),
        }
        signal_shutdown.cancel();
    });

    // The client relay runs on the main task; its return means the client
    // disconnected or a shutdown signal arrived
    transport::relay_client_input(tokio::io::stdin(), Arc::clone(&router), shutdown.clone()).await;

    shutdown.cancel();
    supervisor.shutdown().await;
    let _ = output_relay.await;
    if let Some(task) = watcher_task {
        let _ = task.await;
    }

    let status = supervisor.status().await;
    info!(restarts = status.restart_count, "proxy stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn test_parse_full_command_line() {
        let (args, ignored) = parse_args_lenient(argv(&[
            "mcp-hotswap",
            "--watch",
            "lib",
            "--watch",
            "priv",
            "--debounce",
            "3",
            "--debug",
            "--",
            "my-server",
            "--port",
            "9000",
        ]));

        assert!(ignored.is_empty());
        assert_eq!(args.watch, vec![PathBuf::from("lib"), PathBuf::from("priv")]);
        assert_eq!(args.debounce, Some(3));
        assert!(args.debug);
        assert_eq!(args.server_command, vec!["my-server", "--port", "9000"]);
    }

    #[test]
    fn test_unknown_flag_is_ignored_not_fatal() {
        let (args, ignored) = parse_args_lenient(argv(&[
            "mcp-hotswap",
            "--bogus",
            "--debounce",
            "2",
            "--",
            "my-server",
        ]));

        assert_eq!(ignored, vec!["--bogus"]);
        assert_eq!(args.debounce, Some(2));
        assert_eq!(args.server_command, vec!["my-server"]);
    }

    #[test]
    fn test_unknown_flag_with_value_is_ignored() {
        let (args, ignored) =
            parse_args_lenient(argv(&["mcp-hotswap", "--bogus=3", "--", "my-server"]));

        assert_eq!(ignored, vec!["--bogus=3"]);
        assert_eq!(args.server_command, vec!["my-server"]);
    }

    #[test]
    fn test_missing_server_command_parses_empty() {
        let (args, _) = parse_args_lenient(argv(&["mcp-hotswap"]));
        assert!(args.server_command.is_empty());
    }

    #[test]
    fn test_build_config_applies_overrides() {
        let (args, _) = parse_args_lenient(argv(&[
            "mcp-hotswap",
            "--no-watch",
            "--restart-daemons",
            "--watch-ext",
            "zig",
            "--debounce",
            "7",
            "--",
            "my-server",
        ]));
        let config = build_config(&args);

        assert!(!config.watch_enabled);
        assert!(config.daemon_hook_enabled);
        assert!(config.watch_extensions.iter().any(|ext| ext == "zig"));
        assert_eq!(config.debounce, Duration::from_secs(7));
        assert_eq!(config.server_command, vec!["my-server"]);
    }
}
