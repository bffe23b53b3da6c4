//! Configuration management

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH: &str = "/etc/appwall/config.json";
const PORT_RANGE_PATH: &str = "/proc/sys/net/ipv4/ip_local_port_range";
const DEFAULT_EPHEMERAL: RangeInclusive<u16> = 32768..=60999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Permanent rules, editable by hand and appended to by prompts.
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,

    /// Additional permanent rule files, e.g. blocklists. Reconciled with
    /// `rules_file` but never written to.
    #[serde(default)]
    pub extra_rules_files: Vec<PathBuf>,

    /// Drop file for timed rules, consumed and deleted when it appears.
    #[serde(default)]
    pub temp_rules_file: Option<PathBuf>,

    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    #[serde(default = "default_dump_dir")]
    pub dns_dump_dir: PathBuf,

    #[serde(default)]
    pub queue_num: u16,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_grace")]
    pub grace_period_secs: u64,

    #[serde(default = "default_conn_ttl")]
    pub conn_ttl_secs: u64,

    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,

    #[serde(default)]
    pub log_sizes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Desktop user the prompt is shown as. Defaults to the only user under /home.
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_prompt_program")]
    pub program: String,

    #[serde(default = "default_display")]
    pub display: String,

    /// Seconds to wait for an answer before denying.
    #[serde(default = "default_prompt_timeout")]
    pub timeout_secs: u64,
}

/// Command lines of the trace helpers, one per event class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_trace_tcp")]
    pub tcp: Vec<String>,
    #[serde(default = "default_trace_udp")]
    pub udp: Vec<String>,
    #[serde(default = "default_trace_fork")]
    pub fork: Vec<String>,
    #[serde(default = "default_trace_exit")]
    pub exit: Vec<String>,
    #[serde(default = "default_trace_exec")]
    pub exec: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_rules_file() -> PathBuf { PathBuf::from("/etc/appwall.rules") }
fn default_hosts_file() -> PathBuf { PathBuf::from("/etc/appwall.hosts") }
fn default_dump_dir() -> PathBuf { std::env::temp_dir() }
fn default_grace() -> u64 { 10 }
fn default_conn_ttl() -> u64 { 600 }
fn default_pending_ttl() -> u64 { 300 }
fn default_prompt_program() -> String { "appwall-prompt".to_string() }
fn default_display() -> String { ":0".to_string() }
fn default_prompt_timeout() -> u64 { 120 }
fn default_max_attempts() -> u32 { 100 }
fn default_delay_ms() -> u64 { 10 }

fn helper(program: &str) -> Vec<String> {
    vec!["stdbuf".to_string(), "-oL".to_string(), program.to_string()]
}

fn default_trace_tcp() -> Vec<String> { helper("appwall-bpftrace-tcp") }
fn default_trace_udp() -> Vec<String> { helper("appwall-bpftrace-udp") }
fn default_trace_fork() -> Vec<String> { helper("appwall-bpftrace-fork") }
fn default_trace_exit() -> Vec<String> { helper("appwall-bpftrace-exit") }
fn default_trace_exec() -> Vec<String> { helper("appwall-bcc-execve") }

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
            extra_rules_files: Vec::new(),
            temp_rules_file: None,
            hosts_file: default_hosts_file(),
            dns_dump_dir: default_dump_dir(),
            queue_num: 0,
            prompt: PromptConfig::default(),
            trace: TraceConfig::default(),
            retry: RetryConfig::default(),
            grace_period_secs: default_grace(),
            conn_ttl_secs: default_conn_ttl(),
            pending_ttl_secs: default_pending_ttl(),
            log_sizes: false,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            user: None,
            program: default_prompt_program(),
            display: default_display(),
            timeout_secs: default_prompt_timeout(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            tcp: default_trace_tcp(),
            udp: default_trace_udp(),
            fork: default_trace_fork(),
            exit: default_trace_exit(),
            exec: default_trace_exec(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl Config {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn conn_ttl(&self) -> Duration {
        Duration::from_secs(self.conn_ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}

pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<Config>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let manager = Self {
            path: path.into(),
            config: RwLock::new(Config::default()),
        };
        manager.load();
        manager
    }

    pub fn load(&self) {
        let path = self.path.as_path();
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return;
        }

        // Reject symlinked config files to prevent symlink-based configuration attacks
        if let Ok(metadata) = fs::symlink_metadata(path) {
            if metadata.file_type().is_symlink() {
                warn!("Config file at {} is a symlink, rejecting", path.display());
                return;
            }
        }

        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => {
                    *self.config.write() = config;
                    info!("Loaded config from {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to parse config: {}, using defaults", e);
                }
            },
            Err(e) => {
                warn!("Failed to read config: {}, using defaults", e);
            }
        }
    }

    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    pub fn set_rules_file(&self, path: PathBuf) {
        self.config.write().rules_file = path;
    }
}

/// Ports the kernel hands out to outbound sockets.
pub fn ephemeral_port_range() -> RangeInclusive<u16> {
    match fs::read_to_string(PORT_RANGE_PATH) {
        Ok(content) => parse_port_range(&content).unwrap_or_else(|| {
            warn!("Unexpected {} contents {:?}, using defaults", PORT_RANGE_PATH, content);
            DEFAULT_EPHEMERAL
        }),
        Err(e) => {
            warn!("Failed to read {}: {}, using defaults", PORT_RANGE_PATH, e);
            DEFAULT_EPHEMERAL
        }
    }
}

fn parse_port_range(content: &str) -> Option<RangeInclusive<u16>> {
    let mut parts = content.split_whitespace().map(|p| p.parse::<u16>());
    match (parts.next(), parts.next()) {
        (Some(Ok(low)), Some(Ok(high))) if low <= high => Some(low..=high),
        _ => None,
    }
}

/// Whether `path` is a plain file path we may create or append to.
pub fn is_regular_or_missing(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_file(),
        Err(_) => true,
    }
}
