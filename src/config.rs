use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the proxy log level
pub const ENV_DEBUG: &str = "SIDECAR_PROXY_DEBUG";
/// Environment variable naming an explicit proxy binary
pub const ENV_BINARY: &str = "SIDECAR_PROXY_BINARY";
/// Environment variable selecting the proxy version (and thus the default binary path)
pub const ENV_VERSION: &str = "SIDECAR_PROXY_VERSION";
/// Environment variable with extra proxy flags, split like a shell would
pub const ENV_EXTRA_ARGS: &str = "SIDECAR_PROXY_EXTRA_ARGS";

/// Global configuration for the harness
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HarnessConfig {
    /// How proxy processes are invoked
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Timeouts, intervals and poll budgets
    #[serde(default)]
    pub timing: TimingConfig,

    /// Port block layout
    #[serde(default)]
    pub ports: PortConfig,

    /// Backend target servers started around each scenario
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Explicit path to the proxy executable (overrides version lookup)
    pub binary: Option<PathBuf>,

    /// Version string selecting the default binary path
    #[serde(default = "default_version")]
    pub version: String,

    /// Directory holding versioned proxy binaries
    #[serde(default = "default_binary_dir")]
    pub binary_dir: PathBuf,

    /// Proxy log verbosity passed with `-l`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Worker threads in normal mode
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Stress mode: higher concurrency and no `-l` flag
    #[serde(default)]
    pub stress: bool,

    /// Worker threads in stress mode
    #[serde(default = "default_stress_concurrency")]
    pub stress_concurrency: u32,

    /// Drain time bound passed with `--drain-time-s`
    #[serde(default = "default_drain_time")]
    pub drain_time_secs: u64,

    /// Pass `--disable-hot-restart` instead of the base-id triple
    #[serde(default)]
    pub disable_hot_restart: bool,

    /// Passed with `--parent-shutdown-time-s` when hot restart is enabled
    #[serde(default = "default_parent_shutdown_time")]
    pub parent_shutdown_time_secs: u64,

    /// Passed with `--restart-epoch` when hot restart is enabled
    #[serde(default)]
    pub restart_epoch: u32,

    /// Pass `--allow-unknown-fields`
    #[serde(default = "default_true")]
    pub allow_unknown_fields: bool,

    /// Extra opaque flags appended after the fixed flag set
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Administrative path probed while waiting for a launched proxy
    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,

    /// Directory holding per-instance shared-memory artifacts
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,

    /// File name prefix of the shared-memory artifact
    #[serde(default = "default_shm_prefix")]
    pub shm_prefix: String,

    /// Also copy each rendered bootstrap into this directory
    pub copy_bootstrap_dir: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binary: None,
            version: default_version(),
            binary_dir: default_binary_dir(),
            log_level: default_log_level(),
            concurrency: default_concurrency(),
            stress: false,
            stress_concurrency: default_stress_concurrency(),
            drain_time_secs: default_drain_time(),
            disable_hot_restart: false,
            parent_shutdown_time_secs: default_parent_shutdown_time(),
            restart_epoch: 0,
            allow_unknown_fields: true,
            extra_args: Vec::new(),
            liveness_path: default_liveness_path(),
            shm_dir: default_shm_dir(),
            shm_prefix: default_shm_prefix(),
            copy_bootstrap_dir: None,
        }
    }
}

impl ProxySettings {
    /// Path of the proxy executable: the explicit binary if set, otherwise
    /// `<binary_dir>/proxy-<version>`
    pub fn binary_path(&self) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| self.binary_dir.join(format!("proxy-{}", self.version)))
    }

    /// Path of the shared-memory artifact a proxy with this base id leaves behind
    pub fn shm_path(&self, base_id: u32) -> PathBuf {
        self.shm_dir
            .join(format!("{}{}0", self.shm_prefix, base_id))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Wall-clock budget for a launched proxy to answer its liveness probe
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_ms: u64,

    /// Interval between liveness probes during launch
    #[serde(default = "default_launch_poll_interval")]
    pub launch_poll_interval_ms: u64,

    /// Settle delay before the first readiness probe
    #[serde(default = "default_ready_settle")]
    pub ready_settle_ms: u64,

    /// Interval between readiness and stats polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Wall-clock budget of one readiness or stats wait
    #[serde(default = "default_poll_budget")]
    pub poll_budget_ms: u64,

    /// Grace window between the shutdown request and a forced kill
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,

    /// Per-request timeout for administrative HTTP calls
    #[serde(default = "default_admin_request_timeout")]
    pub admin_request_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: default_launch_timeout(),
            launch_poll_interval_ms: default_launch_poll_interval(),
            ready_settle_ms: default_ready_settle(),
            poll_interval_ms: default_poll_interval(),
            poll_budget_ms: default_poll_budget(),
            stop_grace_ms: default_stop_grace(),
            admin_request_timeout_ms: default_admin_request_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn launch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.launch_poll_interval_ms)
    }

    pub fn ready_settle(&self) -> Duration {
        Duration::from_millis(self.ready_settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_budget(&self) -> Duration {
        Duration::from_millis(self.poll_budget_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn admin_request_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// First port of block 0
    #[serde(default = "default_port_base")]
    pub base: u16,

    /// Ports per block
    #[serde(default = "default_block_size")]
    pub block_size: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            block_size: default_block_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScenarioConfig {
    /// Start an HTTP backend on the backend port
    #[serde(default = "default_true")]
    pub start_http_backend: bool,

    /// Start a TCP backend on the backend port
    #[serde(default)]
    pub start_tcp_backend: bool,

    /// Prefix the TCP backend writes before echoing received bytes
    #[serde(default = "default_tcp_prefix")]
    pub tcp_prefix: String,

    /// Serve backends over TLS with a self-signed certificate
    #[serde(default)]
    pub tls: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            start_http_backend: true,
            start_tcp_backend: false,
            tcp_prefix: default_tcp_prefix(),
            tls: false,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "release-1.5".to_string()
}

fn default_binary_dir() -> PathBuf {
    PathBuf::from("proxy-bin")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> u32 {
    1
}

fn default_stress_concurrency() -> u32 {
    10
}

fn default_drain_time() -> u64 {
    1
}

fn default_parent_shutdown_time() -> u64 {
    1
}

fn default_liveness_path() -> String {
    "/server_info".to_string()
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

fn default_shm_prefix() -> String {
    "envoy_shared_memory_".to_string()
}

fn default_launch_timeout() -> u64 {
    10_000
}

fn default_launch_poll_interval() -> u64 {
    100
}

fn default_ready_settle() -> u64 {
    1_000 // slow CI hosts refuse connections right after warming reports zero
}

fn default_poll_interval() -> u64 {
    200
}

fn default_poll_budget() -> u64 {
    3_000
}

fn default_stop_grace() -> u64 {
    3_000
}

fn default_admin_request_timeout() -> u64 {
    2_000
}

fn default_port_base() -> u16 {
    20000
}

fn default_block_size() -> u16 {
    20
}

fn default_tcp_prefix() -> String {
    "hello".to_string()
}

impl HarnessConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: HarnessConfig = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the `SIDECAR_PROXY_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_DEBUG).filter(|v| !v.is_empty()) {
            self.proxy.log_level = level;
        }
        if let Some(binary) = lookup(ENV_BINARY).filter(|v| !v.is_empty()) {
            self.proxy.binary = Some(PathBuf::from(binary));
        }
        if let Some(version) = lookup(ENV_VERSION).filter(|v| !v.is_empty()) {
            self.proxy.version = version;
        }
        if let Some(extra) = lookup(ENV_EXTRA_ARGS).filter(|v| !v.is_empty()) {
            let args = shell_words::split(&extra).unwrap_or_else(|_| vec![extra.clone()]);
            self.proxy.extra_args.extend(args);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.block_size < 7 {
            errors.push(format!(
                "ports.block_size must be at least 7 (one port per role), got {}",
                self.ports.block_size
            ));
        }
        if u32::from(self.ports.base) + u32::from(self.ports.block_size) > 65535 {
            errors.push(format!(
                "ports.base {} leaves no room for a block of {}",
                self.ports.base, self.ports.block_size
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            errors.push("timing.poll_interval_ms must be greater than 0".to_string());
        }
        if self.timing.launch_poll_interval_ms == 0 {
            errors.push("timing.launch_poll_interval_ms must be greater than 0".to_string());
        }
        if self.proxy.concurrency == 0 || self.proxy.stress_concurrency == 0 {
            errors.push("proxy concurrency must be greater than 0".to_string());
        }
        if !self.proxy.liveness_path.starts_with('/') {
            errors.push(format!(
                "proxy.liveness_path must start with '/', got {:?}",
                self.proxy.liveness_path
            ));
        }
        if self.scenario.start_http_backend && self.scenario.start_tcp_backend {
            errors.push(
                "scenario.start_http_backend and scenario.start_tcp_backend share the backend port"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
binary = "/usr/local/bin/envoy"
log_level = "debug"
disable_hot_restart = true
extra_args = ["--component-log-level", "wasm:debug"]

[timing]
poll_interval_ms = 100
poll_budget_ms = 1000

[ports]
base = 30000
block_size = 10

[scenario]
start_http_backend = false
start_tcp_backend = true
tls = true
"#;

        let config: HarnessConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.proxy.binary_path(),
            PathBuf::from("/usr/local/bin/envoy")
        );
        assert_eq!(config.proxy.log_level, "debug");
        assert!(config.proxy.disable_hot_restart);
        assert_eq!(config.proxy.extra_args.len(), 2);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.timing.poll_budget(), Duration::from_secs(1));
        assert_eq!(config.ports.base, 30000);
        assert_eq!(config.ports.block_size, 10);
        assert!(config.scenario.start_tcp_backend);
        assert!(config.scenario.tls);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: HarnessConfig = toml::from_str("").unwrap();

        assert_eq!(config.ports.base, 20000);
        assert_eq!(config.ports.block_size, 20);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.timing.poll_budget(), Duration::from_secs(3));
        assert_eq!(config.timing.stop_grace(), Duration::from_secs(3));
        assert_eq!(config.timing.ready_settle(), Duration::from_secs(1));
        assert_eq!(config.proxy.log_level, "info");
        assert_eq!(config.proxy.concurrency, 1);
        assert_eq!(config.proxy.drain_time_secs, 1);
        assert_eq!(config.proxy.liveness_path, "/server_info");
        assert!(config.proxy.allow_unknown_fields);
        assert!(config.scenario.start_http_backend);
        assert!(!config.scenario.start_tcp_backend);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_binary_path_uses_version() {
        let settings = ProxySettings::default();
        assert_eq!(
            settings.binary_path(),
            PathBuf::from("proxy-bin/proxy-release-1.5")
        );
    }

    #[test]
    fn test_shm_path() {
        let settings = ProxySettings::default();
        assert_eq!(
            settings.shm_path(3),
            PathBuf::from("/dev/shm/envoy_shared_memory_30")
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut env = HashMap::new();
        env.insert(ENV_DEBUG, "trace".to_string());
        env.insert(ENV_VERSION, "release-1.6".to_string());
        env.insert(ENV_EXTRA_ARGS, "--foo 'bar baz'".to_string());

        let mut config = HarnessConfig::default();
        config.apply_overrides(|key| env.get(key).cloned());

        assert_eq!(config.proxy.log_level, "trace");
        assert_eq!(
            config.proxy.binary_path(),
            PathBuf::from("proxy-bin/proxy-release-1.6")
        );
        assert_eq!(
            config.proxy.extra_args,
            vec!["--foo".to_string(), "bar baz".to_string()]
        );
    }

    #[test]
    fn test_binary_override_wins_over_version() {
        let mut config = HarnessConfig::default();
        config.apply_overrides(|key| match key {
            ENV_BINARY => Some("/opt/proxy".to_string()),
            ENV_VERSION => Some("release-9".to_string()),
            _ => None,
        });
        assert_eq!(config.proxy.binary_path(), PathBuf::from("/opt/proxy"));
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = HarnessConfig::default();
        config.apply_overrides(|_| Some(String::new()));
        assert_eq!(config.proxy.log_level, "info");
        assert!(config.proxy.binary.is_none());
        assert!(config.proxy.extra_args.is_empty());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = HarnessConfig::default();
        config.ports.block_size = 3;
        config.timing.poll_interval_ms = 0;
        config.scenario.start_tcp_backend = true;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("block_size"));
        assert!(err.contains("poll_interval_ms"));
        assert!(err.contains("share the backend port"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[ports]\nbase = 40000\n").unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.ports.base, 40000);
    }
}
