//! Proxy configuration
//!
//! All runtime knobs are assembled once at startup from CLI arguments and
//! environment variables, then frozen behind an `Arc` and passed explicitly
//! into each component. Nothing reads the environment after startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default debounce window applied to bursts of file changes
pub const DEFAULT_DEBOUNCE_SECS: u64 = 2;

/// Interval between watcher poll cycles
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// How long a terminated server process may take to exit before SIGKILL
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// File extensions watched by default.
///
/// Chosen to cover common server implementation languages; extendable via
/// `--watch-ext`.
pub const DEFAULT_WATCH_EXTENSIONS: &[&str] = &[
    "rs", "toml", "ex", "exs", "go", "py", "js", "ts", "json", "yaml", "yml",
];

/// Directories never descended into during watch traversal
pub const SKIP_DIRECTORIES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "_build",
    "deps",
    "dist",
    "build",
    "__pycache__",
    ".venv",
];

// ============================================================================
// Environment Variables
// ============================================================================

/// Enables debug logging (equivalent to `--debug`)
pub const ENV_DEBUG: &str = "MCP_HOTSWAP_DEBUG";

/// Disables file watching (equivalent to `--no-watch`)
pub const ENV_NO_WATCH: &str = "MCP_HOTSWAP_NO_WATCH";

/// Debounce window in seconds (equivalent to `--debounce`)
pub const ENV_DEBOUNCE: &str = "MCP_HOTSWAP_DEBOUNCE";

/// Enables the dependent-daemon restart hook (equivalent to `--restart-daemons`)
pub const ENV_RESTART_DAEMONS: &str = "MCP_HOTSWAP_RESTART_DAEMONS";

/// Shell command the restart hook runs before each watcher-triggered restart
pub const ENV_RESTART_CMD: &str = "MCP_HOTSWAP_RESTART_CMD";

/// Parse a boolean-ish environment flag ("1" / "true", case-insensitive)
fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            let value = value.trim().to_ascii_lowercase();
            value == "1" || value == "true"
        })
        .unwrap_or(false)
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

// ============================================================================
// Proxy Configuration
// ============================================================================

/// Complete proxy configuration, immutable after startup
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Launch command for the wrapped server (program plus arguments)
    pub server_command: Vec<String>,

    /// Paths polled for changes (the working directory plus any extras)
    pub watch_paths: Vec<PathBuf>,

    /// File extensions considered during watch traversal
    pub watch_extensions: Vec<String>,

    /// Debounce window applied to bursts of file changes
    pub debounce: Duration,

    /// Interval between watcher poll cycles
    pub poll_interval: Duration,

    /// Grace period between SIGTERM and SIGKILL during a restart
    pub grace_period: Duration,

    /// Whether the file watcher runs at all
    pub watch_enabled: bool,

    /// Whether watcher-triggered restarts invoke the restart hook
    pub daemon_hook_enabled: bool,

    /// Shell command the restart hook runs (unset means the hook is a no-op)
    pub restart_hook_command: Option<String>,

    /// Debug logging requested
    pub debug: bool,
}

impl ProxyConfig {
    /// Build a configuration from environment variables and defaults.
    ///
    /// CLI overrides are applied by the caller before the value is frozen.
    pub fn from_env(server_command: Vec<String>) -> Self {
        let debounce_secs = env_u64(ENV_DEBOUNCE).unwrap_or(DEFAULT_DEBOUNCE_SECS);

        Self {
            server_command,
            watch_paths: vec![PathBuf::from(".")],
            watch_extensions: DEFAULT_WATCH_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            debounce: Duration::from_secs(debounce_secs),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            watch_enabled: !env_flag(ENV_NO_WATCH),
            daemon_hook_enabled: env_flag(ENV_RESTART_DAEMONS),
            restart_hook_command: env::var(ENV_RESTART_CMD).ok().filter(|cmd| !cmd.is_empty()),
            debug: env_flag(ENV_DEBUG),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
