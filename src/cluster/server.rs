//! Per-server state record
//!
//! A `ServerMonitor` is the cached view of one monitored server. It is
//! refreshed on every tick; state transitions are applied only by the
//! monitor's serialized commit step.

use std::fmt;

use tokio::net::lookup_host;
use tracing::debug;

use crate::driver::{DbConn, DriverError, ReplicationFilters, SlaveStatus};
use crate::gtid::{GtidList, GtidParseError};

/// Monitoring state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Master,
    Slave,
    Unconnected,
    Suspect,
    Failed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Master => "Master",
            ServerState::Slave => "Slave",
            ServerState::Unconnected => "Unconnected",
            ServerState::Suspect => "Suspect",
            ServerState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("DNS resolution error for host {0}")]
pub struct DnsError(pub String);

/// Refresh failures leave the record's fields untouched
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("bad GTID value: {0}")]
    Gtid(#[from] GtidParseError),
}

impl RefreshError {
    /// True when the connection should be dropped and redialed next tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            RefreshError::Driver(e) => e.is_fatal(),
            RefreshError::Gtid(_) => false,
        }
    }
}

/// Values observed from one server during a tick, integrated into the
/// record at the commit step.
#[derive(Debug, Clone)]
pub struct RefreshSnapshot {
    pub binlog_pos: GtidList,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub gtid_strict_mode: String,
    pub log_bin: String,
    pub read_only: String,
    pub server_id: u32,
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
    pub repl_filters: ReplicationFilters,
    pub semi_sync_master: bool,
    pub slave: Option<SlaveStatus>,
}

/// Cached view of one monitored server
pub struct ServerMonitor {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub ip: String,

    pub state: ServerState,
    pub prev_state: ServerState,
    pub fail_count: u32,

    pub server_id: u32,
    pub master_server_id: u32,
    pub master_host: String,

    pub log_bin: String,
    pub read_only: String,
    pub gtid_strict_mode: String,
    pub using_gtid: String,
    pub io_thread: String,
    pub sql_thread: String,
    pub delay: Option<i64>,
    pub io_errno: u16,
    pub io_error: String,
    pub sql_errno: u16,
    pub sql_error: String,

    pub binlog_pos: GtidList,
    pub current_gtid: GtidList,
    pub slave_gtid: GtidList,
    pub binlog_do_db: String,
    pub binlog_ignore_db: String,
    pub repl_filters: ReplicationFilters,

    pub semi_sync_master: bool,
    pub rpl_master_status: bool,

    pub conn: Option<Box<dyn DbConn>>,
}

impl ServerMonitor {
    /// Build a record from a configured host:port URL. Every server starts
    /// `Unconnected` until its first successful refresh classifies it.
    pub fn new(url: &str) -> Self {
        let (host, port) = split_host_port(url);
        Self {
            url: url.to_string(),
            host,
            port,
            ip: String::new(),
            state: ServerState::Unconnected,
            prev_state: ServerState::Unconnected,
            fail_count: 0,
            server_id: 0,
            master_server_id: 0,
            master_host: String::new(),
            log_bin: String::new(),
            read_only: String::new(),
            gtid_strict_mode: String::new(),
            using_gtid: String::new(),
            io_thread: String::new(),
            sql_thread: String::new(),
            delay: None,
            io_errno: 0,
            io_error: String::new(),
            sql_errno: 0,
            sql_error: String::new(),
            binlog_pos: GtidList::default(),
            current_gtid: GtidList::default(),
            slave_gtid: GtidList::default(),
            binlog_do_db: String::new(),
            binlog_ignore_db: String::new(),
            repl_filters: ReplicationFilters::default(),
            semi_sync_master: false,
            rpl_master_status: false,
            conn: None,
        }
    }

    /// Resolve the configured host. Failure is surfaced but the record stays
    /// monitorable; resolution is retried implicitly through reconnects.
    pub async fn resolve(&mut self) -> Result<(), DnsError> {
        if self.host.is_empty() {
            return Ok(());
        }
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|_| DnsError(self.host.clone()))?;
        match addrs.next() {
            Some(addr) => {
                self.ip = addr.ip().to_string();
                Ok(())
            }
            None => Err(DnsError(self.host.clone())),
        }
    }

    /// Read the server's variables, status and slave status into a snapshot.
    /// Runs on the concurrent side of the tick; nothing here touches the
    /// record itself.
    pub async fn collect_refresh(
        conn: &mut dyn DbConn,
        master_conn: &str,
    ) -> Result<RefreshSnapshot, RefreshError> {
        conn.ping().await.map_err(RefreshError::Driver)?;

        let vars = conn.get_variables().await?;
        let var = |name: &str| vars.get(name).cloned().unwrap_or_default();

        let binlog_pos = GtidList::parse(&var("GTID_BINLOG_POS"))?;
        let current_gtid = GtidList::parse(&var("GTID_CURRENT_POS"))?;
        let slave_gtid = GtidList::parse(&var("GTID_SLAVE_POS"))?;
        let server_id = var("SERVER_ID").parse().unwrap_or(0);
        let repl_filters = ReplicationFilters::from_variables(&vars);

        conn.set_default_master_conn(master_conn).await?;

        let status = conn.get_status().await?;
        let semi_sync_master = status
            .get("RPL_SEMI_SYNC_MASTER_STATUS")
            .map(|v| v == "ON")
            .unwrap_or(false);

        let (binlog_do_db, binlog_ignore_db) = conn.binlog_filters().await?;

        // Absence of slave status is not an error; the server is simply
        // not a replica.
        let slave = conn.get_slave_status().await?;

        Ok(RefreshSnapshot {
            binlog_pos,
            current_gtid,
            slave_gtid,
            gtid_strict_mode: var("GTID_STRICT_MODE"),
            log_bin: var("LOG_BIN"),
            read_only: var("READ_ONLY"),
            server_id,
            binlog_do_db,
            binlog_ignore_db,
            repl_filters,
            semi_sync_master,
            slave,
        })
    }

    /// Fold a snapshot into the record.
    pub fn apply_refresh(&mut self, snapshot: RefreshSnapshot) {
        self.binlog_pos = snapshot.binlog_pos;
        self.current_gtid = snapshot.current_gtid;
        self.slave_gtid = snapshot.slave_gtid;
        self.gtid_strict_mode = snapshot.gtid_strict_mode;
        self.log_bin = snapshot.log_bin;
        self.read_only = snapshot.read_only;
        self.server_id = snapshot.server_id;
        self.binlog_do_db = snapshot.binlog_do_db;
        self.binlog_ignore_db = snapshot.binlog_ignore_db;
        self.repl_filters = snapshot.repl_filters;
        self.semi_sync_master = snapshot.semi_sync_master;

        match snapshot.slave {
            Some(slave) => {
                self.using_gtid = slave.using_gtid;
                self.io_thread = slave.io_running;
                self.sql_thread = slave.sql_running;
                self.delay = slave.seconds_behind_master;
                self.master_server_id = slave.master_server_id;
                self.master_host = slave.master_host;
                self.io_errno = slave.last_io_errno;
                self.io_error = slave.last_io_error;
                self.sql_errno = slave.last_sql_errno;
                self.sql_error = slave.last_sql_error;
            }
            None => self.clear_slave_fields(),
        }

        debug!(
            server = %self.url,
            current_gtid = %self.current_gtid,
            slave_gtid = %self.slave_gtid,
            binlog_pos = %self.binlog_pos,
            "Refreshed server"
        );
    }

    fn clear_slave_fields(&mut self) {
        self.using_gtid.clear();
        self.io_thread.clear();
        self.sql_thread.clear();
        self.delay = None;
        self.master_server_id = 0;
        self.master_host.clear();
        self.io_errno = 0;
        self.io_error.clear();
        self.sql_errno = 0;
        self.sql_error.clear();
    }

    /// Serialized refresh helper for the election and discovery paths.
    pub async fn refresh(&mut self, master_conn: &str) -> Result<(), RefreshError> {
        let mut conn = self.conn.take().ok_or(DriverError::NotConnected)?;
        let result = Self::collect_refresh(conn.as_mut(), master_conn).await;
        match result {
            Ok(snapshot) => {
                self.conn = Some(conn);
                self.apply_refresh(snapshot);
                Ok(())
            }
            Err(e) => {
                if !e.is_fatal() {
                    self.conn = Some(conn);
                }
                Err(e)
            }
        }
    }

    /// Human-readable replication health, for the periodic topology log.
    pub fn replication_status(&self) -> String {
        if self.state == ServerState::Master {
            return "Master OK".to_string();
        }
        match self.delay {
            None => {
                if self.sql_thread == "Yes" && self.io_thread == "No" {
                    format!("NOT OK, IO Stopped ({})", self.io_errno)
                } else if self.sql_thread == "No" && self.io_thread == "Yes" {
                    format!("NOT OK, SQL Stopped ({})", self.sql_errno)
                } else {
                    "NOT OK, ALL Stopped".to_string()
                }
            }
            Some(delay) if delay > 0 => "Behind master".to_string(),
            Some(_) => "Running OK".to_string(),
        }
    }

    /// True when every given sibling reports the same observed master.
    pub fn has_siblings(&self, siblings: &[&ServerMonitor]) -> bool {
        siblings
            .iter()
            .all(|s| s.master_server_id == self.master_server_id)
    }
}

fn split_host_port(url: &str) -> (String, u16) {
    match url.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(3306)),
        None => (url.to_string(), 3306),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_splits_host_port() {
        let server = ServerMonitor::new("db1:3307");
        assert_eq!(server.host, "db1");
        assert_eq!(server.port, 3307);
        assert_eq!(server.state, ServerState::Unconnected);

        let server = ServerMonitor::new("db2");
        assert_eq!(server.host, "db2");
        assert_eq!(server.port, 3306);
    }

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let mut server = ServerMonitor::new("127.0.0.1:3306");
        server.resolve().await.unwrap();
        assert_eq!(server.ip, "127.0.0.1");
    }

    #[test]
    fn test_replication_status() {
        let mut server = ServerMonitor::new("db1:3306");

        server.state = ServerState::Master;
        assert_eq!(server.replication_status(), "Master OK");

        server.state = ServerState::Slave;
        server.delay = None;
        server.sql_thread = "Yes".to_string();
        server.io_thread = "No".to_string();
        server.io_errno = 1236;
        assert_eq!(server.replication_status(), "NOT OK, IO Stopped (1236)");

        server.sql_thread = "No".to_string();
        server.io_thread = "Yes".to_string();
        server.sql_errno = 1032;
        assert_eq!(server.replication_status(), "NOT OK, SQL Stopped (1032)");

        server.io_thread = "No".to_string();
        assert_eq!(server.replication_status(), "NOT OK, ALL Stopped");

        server.delay = Some(12);
        assert_eq!(server.replication_status(), "Behind master");

        server.delay = Some(0);
        assert_eq!(server.replication_status(), "Running OK");
    }

    #[test]
    fn test_apply_refresh_clears_slave_fields() {
        let mut server = ServerMonitor::new("db1:3306");
        server.io_thread = "Yes".to_string();
        server.delay = Some(3);
        server.master_server_id = 7;
        server.master_host = "db0".to_string();

        let snapshot = RefreshSnapshot {
            binlog_pos: GtidList::parse("0-1-5").unwrap(),
            current_gtid: GtidList::default(),
            slave_gtid: GtidList::default(),
            gtid_strict_mode: "ON".to_string(),
            log_bin: "ON".to_string(),
            read_only: "OFF".to_string(),
            server_id: 1,
            binlog_do_db: String::new(),
            binlog_ignore_db: String::new(),
            repl_filters: ReplicationFilters::default(),
            semi_sync_master: true,
            slave: None,
        };
        server.apply_refresh(snapshot);

        assert_eq!(server.io_thread, "");
        assert_eq!(server.delay, None);
        assert_eq!(server.master_server_id, 0);
        assert_eq!(server.master_host, "");
        assert!(server.semi_sync_master);
        assert_eq!(server.binlog_pos.to_string(), "0-1-5");
    }

    #[test]
    fn test_has_siblings() {
        let mut a = ServerMonitor::new("a:3306");
        let mut b = ServerMonitor::new("b:3306");
        let mut c = ServerMonitor::new("c:3306");
        a.master_server_id = 1;
        b.master_server_id = 1;
        c.master_server_id = 2;

        assert!(a.has_siblings(&[&b]));
        assert!(!a.has_siblings(&[&b, &c]));
        assert!(a.has_siblings(&[]));
    }
}
