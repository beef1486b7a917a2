use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub state: StateConfig,
}

impl Config {
    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.monitor.servers.is_empty() {
            return Err(
                "no servers configured: [monitor].servers must list at least one host:port".into(),
            );
        }
        if self.monitor.maxfail == 0 {
            return Err("[monitor].maxfail must be at least 1".into());
        }
        Ok(())
    }
}

/// Liveness check flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Driver-level ping on the database port
    Tcp,
    /// HTTP GET against the monitoring agent on port 10001
    Agent,
}

impl Default for CheckType {
    fn default() -> Self {
        Self::Tcp
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Monitored servers as host:port URLs
    pub servers: Vec<String>,
    /// Monitoring tick interval
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-operation connection timeout, seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Consecutive probe failures before a server is declared failed
    #[serde(default = "default_maxfail")]
    pub maxfail: u32,
    /// Maximum replication delay (seconds) for election eligibility
    #[serde(default = "default_max_delay")]
    pub max_delay: i64,
    #[serde(default)]
    pub checktype: CheckType,
    /// Enforce read_only on slaves as they join
    #[serde(default = "default_true")]
    pub readonly: bool,
    /// Automatically rewire recovered servers behind the current master
    #[serde(default)]
    pub autorejoin: bool,
    #[serde(default)]
    pub multi_master: bool,
    /// Require candidates to be in sync with the old master's binlog position
    #[serde(default)]
    pub gtid_check: bool,
    /// URL that wins election whenever it is eligible
    #[serde(default)]
    pub pref_master: String,
    /// URLs never considered for promotion
    #[serde(default)]
    pub ignore_list: Vec<String>,
    /// How long (milliseconds) to wait for long-running writes to drain
    /// during a freeze
    #[serde(default = "default_wait_kill_ms")]
    pub wait_kill_ms: u64,
    #[serde(default)]
    pub verbose: bool,
    /// loglevel > 1 enables debug logging
    #[serde(default = "default_loglevel")]
    pub loglevel: u8,
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_timeout() -> u64 {
    3
}

fn default_maxfail() -> u32 {
    5
}

fn default_max_delay() -> i64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_wait_kill_ms() -> u64 {
    5000
}

fn default_loglevel() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Unix socket path, used when a server URL has an empty host
    #[serde(default)]
    pub socket: String,
    /// Named multi-source replication channel
    #[serde(default)]
    pub master_conn: String,
}

fn default_db_user() -> String {
    "root".to_string()
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            user: default_db_user(),
            password: String::new(),
            socket: String::new(),
            master_conn: String::new(),
        }
    }
}

/// Credentials written into CHANGE MASTER statements
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    /// Empty disables alerting
    #[serde(default)]
    pub mail_to: String,
    #[serde(default = "default_smtp_addr")]
    pub smtp_addr: String,
}

fn default_mail_from() -> String {
    "argus@localhost".to_string()
}

fn default_smtp_addr() -> String {
    "localhost:25".to_string()
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            mail_from: default_mail_from(),
            mail_to: String::new(),
            smtp_addr: default_smtp_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9105".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Where the failing master's binlog position is persisted
    #[serde(default = "default_state_file")]
    pub file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/tmp/repmgr.state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            file: default_state_file(),
        }
    }
}
