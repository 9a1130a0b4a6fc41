//! Configuration Management
//!
//! Provides functionality for:
//! - Loading/saving configuration
//! - Configuration validation
//! - Default configuration
//! - Service descriptor versioning

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::discovery::MIN_SCAN_PREFIX;
use crate::error::ClusterError;
use crate::retry::RetryPolicy;
use crate::types::{JoinRole, ServiceSpec};

/// Well-known port of the join-token service; active discovery probes it.
pub const DEFAULT_SERVICE_PORT: u16 = 9440;
pub const DEFAULT_MDNS_SERVICE_TYPE: &str = "_swarmkeeper._tcp.local.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding persisted membership and deployment state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Port of the join-token service
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Role requested when joining through a peer
    #[serde(default)]
    pub join_role: JoinRole,
    /// Overrides interface detection when set
    #[serde(default)]
    pub advertise_address: Option<IpAddr>,
    /// Serve manager-role join tokens to peers
    #[serde(default)]
    pub allow_manager_join: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub active_enabled: bool,
    /// Budget for the ICMP reachability check per address
    #[serde(default = "default_reach_timeout_ms")]
    pub reach_timeout_ms: u64,
    /// Budget for the service-port check per reachable address
    #[serde(default = "default_port_timeout_ms")]
    pub port_timeout_ms: u64,
    /// Maximum probes in flight
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,
    /// Subnets wider than this prefix are narrowed before enumeration
    #[serde(default = "default_min_prefix")]
    pub min_prefix: u8,
    #[serde(default = "default_true")]
    pub mdns_enabled: bool,
    #[serde(default = "default_mdns_service_type")]
    pub mdns_service_type: String,
    #[serde(default = "default_mdns_browse_ms")]
    pub mdns_browse_ms: u64,
    /// Optional seed addresses folded into every discovery pass
    #[serde(default)]
    pub static_peers: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProvisionConfig {
    pub volume: String,
    #[serde(default = "default_brick_path")]
    pub brick_path: String,
    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Overlay networks provisioned when founding a cluster
    #[serde(default = "default_overlay_networks")]
    pub overlay_networks: Vec<String>,
    #[serde(default)]
    pub storage: Option<StorageProvisionConfig>,
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
    /// Delay policy between whole-coordinator re-invocations in agent mode
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Wall-clock limit for one cycle, rollouts included
    #[serde(default = "default_reconcile_budget")]
    pub cycle_budget_secs: u64,
    /// Control-plane agent restarts attempted per cycle
    #[serde(default = "default_remediation")]
    pub remediation: RetryConfig,
    #[serde(default = "default_high_water")]
    pub high_water_percent: f64,
    #[serde(default = "default_cleanup_commands")]
    pub cleanup_commands: Vec<String>,
    /// Non-critical service whose memory ceiling is lowered under pressure
    #[serde(default)]
    pub shed_service: Option<String>,
    #[serde(default = "default_shed_memory_limit")]
    pub shed_memory_limit: String,
    /// Label marking containers owned by the platform
    #[serde(default = "default_managed_label")]
    pub managed_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_monitor_budget")]
    pub cycle_budget_secs: u64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
    #[serde(default = "default_critical_threshold")]
    pub memory_critical: f64,
    #[serde(default = "default_critical_threshold")]
    pub disk_critical: f64,
    /// Storage namespace whose status is checked each cycle
    #[serde(default)]
    pub storage_volume: Option<String>,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    /// Nodes without a heartbeat for this long are dropped
    #[serde(default = "default_departure_timeout")]
    pub node_departure_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub console: bool,
    /// Number of rotated log files to keep
    #[serde(default = "default_log_files")]
    pub max_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_docker")]
    pub docker: String,
    #[serde(default = "default_gluster")]
    pub gluster: String,
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default = "default_ping")]
    pub ping: String,
    /// Unit restarted when the local control-plane agent is unresponsive
    #[serde(default = "default_agent_unit")]
    pub agent_unit: String,
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    /// Deployment descriptor: services under management
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            service_port: default_service_port(),
            join_role: JoinRole::default(),
            advertise_address: None,
            allow_manager_join: false,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            active_enabled: true,
            reach_timeout_ms: default_reach_timeout_ms(),
            port_timeout_ms: default_port_timeout_ms(),
            concurrency: default_probe_concurrency(),
            min_prefix: default_min_prefix(),
            mdns_enabled: true,
            mdns_service_type: default_mdns_service_type(),
            mdns_browse_ms: default_mdns_browse_ms(),
            static_peers: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            overlay_networks: default_overlay_networks(),
            storage: None,
            token_timeout_secs: default_token_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            cycle_budget_secs: default_reconcile_budget(),
            remediation: default_remediation(),
            high_water_percent: default_high_water(),
            cleanup_commands: default_cleanup_commands(),
            shed_service: None,
            shed_memory_limit: default_shed_memory_limit(),
            managed_label: default_managed_label(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            cycle_budget_secs: default_monitor_budget(),
            memory_threshold: default_memory_threshold(),
            disk_threshold: default_disk_threshold(),
            memory_critical: default_critical_threshold(),
            disk_critical: default_critical_threshold(),
            storage_volume: None,
            report_path: default_report_path(),
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout_secs(),
            node_departure_timeout_secs: default_departure_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            console: true,
            max_files: default_log_files(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            docker: default_docker(),
            gluster: default_gluster(),
            systemctl: default_systemctl(),
            mount: default_mount(),
            ping: default_ping(),
            agent_unit: default_agent_unit(),
            timeout_secs: default_command_timeout(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/swarmkeeper") }
fn default_service_port() -> u16 { DEFAULT_SERVICE_PORT }
fn default_reach_timeout_ms() -> u64 { 1500 }
fn default_port_timeout_ms() -> u64 { 1500 }
fn default_probe_concurrency() -> usize { 64 }
fn default_min_prefix() -> u8 { 22 }
fn default_mdns_service_type() -> String { DEFAULT_MDNS_SERVICE_TYPE.to_string() }
fn default_mdns_browse_ms() -> u64 { 3000 }
fn default_max_attempts() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_ms() -> u64 { 120_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_attempt_timeout_secs() -> u64 { 60 }
fn default_brick_path() -> String { "/data/glusterfs/brick1".to_string() }
fn default_mount_path() -> PathBuf { PathBuf::from("/mnt/swarm-storage") }
fn default_overlay_networks() -> Vec<String> {
    vec!["swarmkeeper-public".to_string(), "swarmkeeper-internal".to_string()]
}
fn default_token_timeout_secs() -> u64 { 5 }
fn default_reconcile_interval() -> u64 { 300 }
fn default_reconcile_budget() -> u64 { 1_800 }
fn default_remediation() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 5_000,
        max_backoff_ms: 20_000,
        multiplier: 2.0,
        attempt_timeout_secs: 30,
    }
}
fn default_high_water() -> f64 { 90.0 }
fn default_cleanup_commands() -> Vec<String> {
    vec![
        "docker system prune -f".to_string(),
        "docker builder prune -f".to_string(),
        "journalctl --vacuum-size=200M".to_string(),
    ]
}
fn default_shed_memory_limit() -> String { "256M".to_string() }
fn default_managed_label() -> String { "swarmkeeper.managed=true".to_string() }
fn default_monitor_interval() -> u64 { 600 }
fn default_monitor_budget() -> u64 { 300 }
fn default_memory_threshold() -> f64 { 90.0 }
fn default_disk_threshold() -> f64 { 90.0 }
fn default_critical_threshold() -> f64 { 95.0 }
fn default_report_path() -> PathBuf { PathBuf::from("/var/lib/swarmkeeper/health-report.json") }
fn default_webhook_timeout_secs() -> u64 { 10 }
fn default_departure_timeout() -> u64 { 86_400 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> PathBuf { PathBuf::from("/var/log/swarmkeeper") }
fn default_log_files() -> usize { 7 }
fn default_docker() -> String { "docker".to_string() }
fn default_gluster() -> String { "gluster".to_string() }
fn default_systemctl() -> String { "systemctl".to_string() }
fn default_mount() -> String { "mount".to_string() }
fn default_ping() -> String { "ping".to_string() }
fn default_agent_unit() -> String { "docker".to_string() }
fn default_command_timeout() -> u64 { 30 }

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
        .with_attempt_timeout(Duration::from_secs(self.attempt_timeout_secs))
    }
}

impl Config {
    /// Candidate configuration locations, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("swarmkeeper.yml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("swarmkeeper").join("config.yml"));
        }
        paths.push(PathBuf::from("/etc/swarmkeeper/config.yml"));
        paths
    }

    /// Load configuration from an explicit path, or the first search path
    /// that exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ClusterError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        for candidate in Self::search_paths() {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ClusterError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ClusterError::Config(format!("Failed to read config file {:?}: {}", path, e)))?;

        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ClusterError::Config(format!("Failed to parse config file {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration, writing atomically through a temporary file
    pub fn save(&self, path: &Path) -> Result<(), ClusterError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ClusterError::Config(format!("Failed to create config directory: {}", e)))?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| ClusterError::Config(format!("Failed to serialize config: {}", e)))?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| ClusterError::Config(format!("Failed to write config: {}", e)))?;
        fs::rename(&temp_path, path)
            .map_err(|e| ClusterError::Config(format!("Failed to save config: {}", e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.reconcile.interval_secs == 0 || self.monitor.interval_secs == 0 {
            return Err(ClusterError::Config("Cycle intervals must be greater than zero".into()));
        }
        if self.reconcile.cycle_budget_secs == 0 || self.monitor.cycle_budget_secs == 0 {
            return Err(ClusterError::Config("Cycle budgets must be greater than zero".into()));
        }
        let thresholds = [
            ("reconcile.high_water_percent", self.reconcile.high_water_percent),
            ("monitor.memory_threshold", self.monitor.memory_threshold),
            ("monitor.disk_threshold", self.monitor.disk_threshold),
            ("monitor.memory_critical", self.monitor.memory_critical),
            ("monitor.disk_critical", self.monitor.disk_critical),
        ];
        for (name, value) in thresholds {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ClusterError::Config(format!("{} must be within (0, 100], got {}", name, value)));
            }
        }
        if self.discovery.concurrency == 0 {
            return Err(ClusterError::Config("discovery.concurrency must be at least 1".into()));
        }
        if !(MIN_SCAN_PREFIX..=32).contains(&self.discovery.min_prefix) {
            return Err(ClusterError::Config(format!(
                "discovery.min_prefix must be within [{}, 32], got {}",
                MIN_SCAN_PREFIX, self.discovery.min_prefix
            )));
        }
        if let Some(service) = self.services.iter().find(|s| s.name.trim().is_empty()) {
            return Err(ClusterError::Config(format!(
                "Service names must not be empty (desired_replicas {})",
                service.desired_replicas
            )));
        }
        Ok(())
    }

    /// Digest of the service descriptor, used as the last-applied version.
    pub fn descriptor_version(&self) -> String {
        let mut hasher = Sha256::new();
        for service in &self.services {
            hasher.update(service.name.as_bytes());
            hasher.update(service.desired_replicas.to_le_bytes());
            for constraint in &service.constraints {
                hasher.update(constraint.to_string().as_bytes());
            }
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn membership_path(&self) -> PathBuf {
        self.node.state_dir.join("membership.json")
    }

    pub fn deployment_path(&self) -> PathBuf {
        self.node.state_dir.join("deployment.json")
    }

    pub fn reconcile_budget(&self) -> Duration {
        Duration::from_secs(self.reconcile.cycle_budget_secs)
    }

    pub fn monitor_budget(&self) -> Duration {
        Duration::from_secs(self.monitor.cycle_budget_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs)
    }
}
