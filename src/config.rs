use crate::utils::path_utils::{expand_tilde_path_buf, home_dir};
use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub default_shell: String,
    pub shell_args: Vec<String>,
    pub terminal_root: PathBuf,
    pub term_type: String,
    pub log_level: String,
    pub history_capacity: usize,
    pub event_channel_capacity: usize,
    pub prompt_delay_ms: u64,
    pub teardown_grace_ms: u64,
    pub teardown_kill_ms: u64,
    pub blocked_commands: Vec<Regex>,
    pub command_audit_log: Option<PathBuf>,
    pub audit_log_max_size_bytes: u64,
}

/// Shell used when `DEFAULT_SHELL` is not set: a login bash if one is on
/// `PATH`, plain `/bin/sh` otherwise.
fn platform_shell() -> (String, Vec<String>) {
    if cfg!(windows) {
        return ("cmd.exe".to_string(), Vec::new());
    }
    match which::which("bash") {
        Ok(bash) => (bash.to_string_lossy().into_owned(), vec!["-l".to_string()]),
        Err(_) => {
            warn!("bash not found in PATH, falling back to /bin/sh");
            ("/bin/sh".to_string(), Vec::new())
        }
    }
}

fn home_or_current_dir() -> PathBuf {
    home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: '{}' ({})", key, raw, e)),
        _ => Ok(default),
    }
}

/// Compiles a comma separated list of program names into patterns matching
/// the first word of a command line.
pub fn compile_blocked_commands(list: &str) -> Result<Vec<Regex>> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            Regex::new(&format!(r"^{}$", regex::escape(s)))
                .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let (default_shell, shell_args) = platform_shell();
        Config {
            default_shell,
            shell_args,
            terminal_root: home_or_current_dir(),
            term_type: "xterm-256color".to_string(),
            log_level: "info".to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            prompt_delay_ms: 100,
            teardown_grace_ms: 1000,
            teardown_kill_ms: 5000,
            blocked_commands: Vec::new(),
            command_audit_log: None,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        let defaults = Config::default();

        let (default_shell, shell_args) = match std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty()) {
            Some(shell) => {
                let args = std::env::var("SHELL_ARGS")
                    .map(|raw| raw.split_whitespace().map(String::from).collect())
                    .unwrap_or_default();
                (shell, args)
            }
            None => (defaults.default_shell, defaults.shell_args),
        };

        let terminal_root = match std::env::var("TERMINAL_ROOT").ok().filter(|s| !s.is_empty()) {
            Some(root_str) => {
                let root = dunce::canonicalize(expand_tilde_path_buf(&root_str))
                    .context(format!("Failed to canonicalize TERMINAL_ROOT: {}", root_str))?;
                if !root.is_dir() {
                    anyhow::bail!("TERMINAL_ROOT is not a valid directory: {:?}", root);
                }
                root
            }
            None => defaults.terminal_root,
        };

        let term_type = std::env::var("TERM_TYPE").unwrap_or(defaults.term_type);
        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        let history_capacity = env_or("HISTORY_CAPACITY", defaults.history_capacity)?;
        if history_capacity == 0 {
            anyhow::bail!("HISTORY_CAPACITY must be greater than zero");
        }
        let event_channel_capacity = env_or("EVENT_CHANNEL_CAPACITY", defaults.event_channel_capacity)?;
        if event_channel_capacity == 0 {
            anyhow::bail!("EVENT_CHANNEL_CAPACITY must be greater than zero");
        }

        let prompt_delay_ms = env_or("PROMPT_DELAY_MS", defaults.prompt_delay_ms)?;
        let teardown_grace_ms = env_or("TEARDOWN_GRACE_MS", defaults.teardown_grace_ms)?;
        let teardown_kill_ms = env_or("TEARDOWN_KILL_MS", defaults.teardown_kill_ms)?;
        if teardown_kill_ms < teardown_grace_ms {
            anyhow::bail!(
                "TEARDOWN_KILL_MS ({}) must not be shorter than TEARDOWN_GRACE_MS ({})",
                teardown_kill_ms,
                teardown_grace_ms
            );
        }

        let blocked_commands = compile_blocked_commands(&std::env::var("BLOCKED_COMMANDS").unwrap_or_default())?;

        let command_audit_log = std::env::var("COMMAND_AUDIT_LOG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde_path_buf(&s));
        let audit_log_max_size_bytes = env_or("AUDIT_LOG_MAX_SIZE_MB", 10u64)? * 1024 * 1024;

        Ok(Config {
            default_shell,
            shell_args,
            terminal_root,
            term_type,
            log_level,
            history_capacity,
            event_channel_capacity,
            prompt_delay_ms,
            teardown_grace_ms,
            teardown_kill_ms,
            blocked_commands,
            command_audit_log,
            audit_log_max_size_bytes,
        })
    }

    pub fn prompt_delay(&self) -> Duration {
        Duration::from_millis(self.prompt_delay_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn teardown_kill_after(&self) -> Duration {
        Duration::from_millis(self.teardown_kill_ms)
    }

    /// Returns true when the program word of `command_str` (after any leading
    /// `VAR=value` assignments) is on the blocklist.
    pub fn is_command_blocked(&self, command_str: &str) -> bool {
        let effective_command = command_str
            .split_whitespace()
            .find(|s| !s.contains('='))
            .unwrap_or("");
        if effective_command.is_empty() {
            return false;
        }
        self.blocked_commands.iter().any(|regex| regex.is_match(effective_command))
    }
}
