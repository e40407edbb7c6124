use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::coordination::validate_path;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:2379";
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_NAMESPACE: &str = "/workers";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub xline_config: XlineConfig,
    // parent node of the worker membership entries
    #[serde(default = "default_namespace")]
    pub namespace: String,
    // number of workers to keep alive
    pub workers: u32,
    // worker executable, launched from its own directory
    pub program: PathBuf,
    // e.g. ["java", "-jar"]; empty runs the program itself
    #[serde(default)]
    pub launch_prefix: Vec<String>,
    #[serde(default)]
    pub exit_on_disconnect: bool,
    #[serde(default = "default_reconcile_retries")]
    pub reconcile_retries: u32,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

impl Default for XlineConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
        }
    }
}

impl XlineConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl Config {
    /// Config with defaults for everything but the worker count and program.
    pub fn new(workers: u32, program: impl Into<PathBuf>) -> Self {
        Self {
            xline_config: XlineConfig::default(),
            namespace: default_namespace(),
            workers,
            program: program.into(),
            launch_prefix: Vec::new(),
            exit_on_disconnect: false,
            reconcile_retries: default_reconcile_retries(),
            reconnect_attempts: default_reconnect_attempts(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.xline_config.endpoints.is_empty() {
            bail!("xline_config.endpoints must not be empty");
        }
        if self.xline_config.session_timeout_ms == 0 {
            bail!("xline_config.session_timeout_ms must be greater than 0");
        }
        validate_path(&self.namespace).context("invalid namespace")?;
        if self.namespace == "/" {
            bail!("namespace must not be the root node");
        }
        if self.program.as_os_str().is_empty() {
            bail!("program must not be empty");
        }
        if self.reconnect_attempts == 0 {
            bail!("reconnect_attempts must be at least 1");
        }
        Ok(())
    }
}

fn default_endpoints() -> Vec<String> {
    vec![DEFAULT_ENDPOINT.to_string()]
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_reconcile_retries() -> u32 {
    3
}

fn default_reconnect_attempts() -> u32 {
    10
}

pub fn parse_config(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    parse_config(&content)
}
