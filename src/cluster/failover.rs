//! Failover coordination: freeze, promote, rewire, rejoin

use std::time::Duration;

use tracing::{error, info, warn};

use crate::driver::DriverError;
use crate::metrics;

use super::monitor::TopologyMonitor;
use super::server::ServerState;

impl TopologyMonitor {
    /// Fence the outgoing master so no client may commit writes against it.
    /// Used on graceful switchover, when the old master is still reachable.
    pub(crate) async fn freeze(&mut self, idx: usize) -> bool {
        let url = self.servers[idx].url.clone();
        let wait_kill_ms = self.config.monitor.wait_kill_ms;
        let Some(conn) = self.servers[idx].conn.as_mut() else {
            warn!(server = %url, "Cannot freeze a server without a connection");
            return false;
        };

        if let Err(e) = conn.set_read_only(true).await {
            warn!(server = %url, error = %e, "Could not set server as read-only");
            return false;
        }

        let mut remaining_ms = wait_kill_ms as i64;
        while remaining_ms > 0 {
            let threads = conn.long_running_writes(0).await.unwrap_or(0);
            if threads == 0 {
                break;
            }
            info!(server = %url, threads, "Waiting for write threads to complete");
            tokio::time::sleep(Duration::from_millis(500)).await;
            remaining_ms -= 500;
        }

        // Saved so the switchover path can restore it afterwards
        self.saved_max_conn = conn
            .get_variables()
            .await
            .ok()
            .and_then(|vars| vars.get("MAX_CONNECTIONS").cloned());

        if let Err(e) = conn.exec("SET GLOBAL max_connections = 0").await {
            warn!(server = %url, error = %e, "Could not clamp max_connections");
        }
        info!(server = %url, "Terminating all threads");
        if let Err(e) = conn.kill_threads().await {
            warn!(server = %url, error = %e, "Could not kill all threads");
        }
        true
    }

    /// Reattach `idx` as a replica of `master_idx` via GTID CURRENT_POS.
    /// `START SLAVE` is best-effort; only the CHANGE MASTER error propagates.
    pub(crate) async fn rejoin_server(
        &mut self,
        idx: usize,
        master_idx: usize,
    ) -> Result<(), DriverError> {
        let master_ip = self.servers[master_idx].ip.clone();
        let master_port = self.servers[master_idx].port;
        let rpl_user = self.config.replication.user.clone();
        let rpl_pass = self.config.replication.password.clone();
        let readonly = self.config.monitor.readonly;
        let url = self.servers[idx].url.clone();

        let Some(conn) = self.servers[idx].conn.as_mut() else {
            return Err(DriverError::NotConnected);
        };

        if readonly {
            let _ = conn.set_read_only(true).await;
        }

        let change_master = format!(
            "CHANGE MASTER TO master_host='{}', master_port={}, master_user='{}', \
             master_password='{}', MASTER_USE_GTID=CURRENT_POS",
            master_ip, master_port, rpl_user, rpl_pass
        );
        let result = conn.exec(&change_master).await;

        if let Err(e) = conn.start_slave().await {
            warn!(server = %url, error = %e, "START SLAVE failed after rewire");
        }
        result
    }

    /// Move the master role to the best eligible replica. With `graceful`
    /// the old master is frozen first and rejoined behind the new one; in
    /// the failure path it is left as-is for a later rejoin.
    ///
    /// Returns false when the promotion was aborted; a failed election keeps
    /// the cluster in its no-master window and is retried on later ticks.
    pub async fn failover(&mut self, graceful: bool) -> bool {
        let Some(old_master) = self.master else {
            return false;
        };

        let Some(pos) = self.elect_candidate().await else {
            error!("Election failed, aborting promotion");
            return false;
        };
        let new_master = self.slaves[pos];

        if graceful && !self.freeze(old_master).await {
            return false;
        }

        info!(
            old = %self.servers[old_master].url,
            new = %self.servers[new_master].url,
            "Promoting new master"
        );

        {
            let url = self.servers[new_master].url.clone();
            let Some(conn) = self.servers[new_master].conn.as_mut() else {
                error!(server = %url, "Elected candidate has no connection, aborting");
                return false;
            };
            if let Err(e) = conn.exec("STOP SLAVE").await {
                warn!(server = %url, error = %e, "STOP SLAVE failed on candidate");
            }
            if let Err(e) = conn.exec("RESET SLAVE ALL").await {
                warn!(server = %url, error = %e, "RESET SLAVE ALL failed on candidate");
            }
            if let Err(e) = conn.set_read_only(false).await {
                error!(server = %url, error = %e,
                    "Could not make elected candidate writable, aborting");
                return false;
            }
        }

        self.slaves.swap_remove(pos);
        self.servers[new_master].state = ServerState::Master;
        self.servers[new_master].fail_count = 0;
        self.master = Some(new_master);
        metrics::metrics().record_failover();

        // Rewire the remaining replicas behind the new master
        let remaining = self.slaves.clone();
        for idx in remaining {
            if let Err(e) = self.rejoin_server(idx, new_master).await {
                error!(server = %self.servers[idx].url, error = %e,
                    "Could not rewire slave behind new master");
            }
        }

        if graceful {
            // The old master becomes a replica of the new one
            if let Err(e) = self.rejoin_server(old_master, new_master).await {
                error!(server = %self.servers[old_master].url, error = %e,
                    "Could not rejoin old master behind new master");
            }
            if let Some(max_conn) = self.saved_max_conn.take() {
                if let Some(conn) = self.servers[old_master].conn.as_mut() {
                    let sql = format!("SET GLOBAL max_connections = {}", max_conn);
                    if let Err(e) = conn.exec(&sql).await {
                        warn!(error = %e, "Could not restore max_connections on old master");
                    }
                }
            }
            self.servers[old_master].state = ServerState::Unconnected;
            self.servers[old_master].fail_count = 0;
        }

        true
    }
}
