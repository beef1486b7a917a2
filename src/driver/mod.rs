//! MySQL client driver
//!
//! Exposes the query primitives the monitoring core consumes behind the
//! [`DbConn`] and [`Connector`] traits. The production implementation speaks
//! the MySQL client protocol directly; tests substitute scripted fakes.

pub mod conn;
pub mod handshake;
pub mod packet;

pub use conn::{Endpoint, MysqlConn};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Driver errors
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("query failed ({code}): {message}")]
    Query { code: u16, message: String },

    #[error("connection disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,
}

impl DriverError {
    /// True when the connection itself is unusable and should be dropped
    /// so the next tick reconnects.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DriverError::Query { .. })
    }
}

/// One row of SHOW SLAVE STATUS, reduced to the fields the monitor reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlaveStatus {
    pub using_gtid: String,
    pub io_running: String,
    pub sql_running: String,
    pub seconds_behind_master: Option<i64>,
    pub master_server_id: u32,
    pub master_host: String,
    pub last_io_errno: u16,
    pub last_io_error: String,
    pub last_sql_errno: u16,
    pub last_sql_error: String,
}

/// Replication filter variables, compared between the old master and an
/// election candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationFilters {
    pub do_db: String,
    pub ignore_db: String,
    pub do_table: String,
    pub ignore_table: String,
    pub wild_do_table: String,
    pub wild_ignore_table: String,
}

impl ReplicationFilters {
    /// Extract from an (uppercased) global-variables map.
    pub fn from_variables(vars: &HashMap<String, String>) -> Self {
        let get = |name: &str| vars.get(name).cloned().unwrap_or_default();
        Self {
            do_db: get("REPLICATE_DO_DB"),
            ignore_db: get("REPLICATE_IGNORE_DB"),
            do_table: get("REPLICATE_DO_TABLE"),
            ignore_table: get("REPLICATE_IGNORE_TABLE"),
            wild_do_table: get("REPLICATE_WILD_DO_TABLE"),
            wild_ignore_table: get("REPLICATE_WILD_IGNORE_TABLE"),
        }
    }
}

/// The query primitives the monitoring core consumes.
///
/// Variable and status maps use uppercased keys (`GTID_BINLOG_POS`,
/// `RPL_SEMI_SYNC_MASTER_STATUS`, ...) regardless of backend casing.
#[async_trait]
pub trait DbConn: Send {
    async fn ping(&mut self) -> Result<(), DriverError>;

    async fn get_variables(&mut self) -> Result<HashMap<String, String>, DriverError>;

    async fn get_status(&mut self) -> Result<HashMap<String, String>, DriverError>;

    /// None when the server reports no slave status (it is not a replica).
    async fn get_slave_status(&mut self) -> Result<Option<SlaveStatus>, DriverError>;

    async fn set_read_only(&mut self, on: bool) -> Result<(), DriverError>;

    /// `SET default_master_connection` so multi-source queries target the
    /// named channel.
    async fn set_default_master_conn(&mut self, name: &str) -> Result<(), DriverError>;

    /// Count of write statements running for at least `min_secs` seconds.
    async fn long_running_writes(&mut self, min_secs: u64) -> Result<u64, DriverError>;

    /// Kill every client session except our own and any binlog dump threads.
    async fn kill_threads(&mut self) -> Result<(), DriverError>;

    /// (Binlog_Do_DB, Binlog_Ignore_DB); empty strings when binary logging
    /// is off.
    async fn binlog_filters(&mut self) -> Result<(String, String), DriverError>;

    /// Sanity checks for a promotion candidate: binary logging enabled and a
    /// non-zero server id.
    async fn slave_prerequisites(&mut self) -> Result<bool, DriverError>;

    async fn start_slave(&mut self) -> Result<(), DriverError>;

    async fn exec(&mut self, sql: &str) -> Result<(), DriverError>;
}

/// Opens monitoring connections for the probe and refresh paths.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DbConn>, DriverError>;
}

/// Production connector: dials the server over TCP, or over the configured
/// unix socket when the host is empty, under the configured timeout.
pub struct MysqlConnector {
    pub user: String,
    pub password: String,
    pub socket: String,
    pub timeout: Duration,
}

impl MysqlConnector {
    pub fn new(user: &str, password: &str, socket: &str, timeout: Duration) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            socket: socket.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DbConn>, DriverError> {
        let endpoint = if host.is_empty() {
            #[cfg(unix)]
            {
                Endpoint::Unix {
                    path: self.socket.clone(),
                }
            }
            #[cfg(not(unix))]
            {
                return Err(DriverError::Connect(
                    "unix sockets are not supported on this platform".into(),
                ));
            }
        } else {
            Endpoint::Tcp {
                host: host.to_string(),
                port,
            }
        };
        let conn = MysqlConn::connect(&endpoint, &self.user, &self.password, self.timeout).await?;
        Ok(Box::new(conn))
    }
}
