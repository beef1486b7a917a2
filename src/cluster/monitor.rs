//! Topology monitor
//!
//! Drives the monitoring ticks: every server is probed and refreshed on its
//! own task, the tick barrier waits for all of them, and every state
//! transition, list edit and master-pointer update happens in the serialized
//! commit step that follows. Alerts are emitted after the transition they
//! report is committed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertSink};
use crate::config::Config;
use crate::driver::{Connector, DbConn, DriverError};
use crate::metrics;
use crate::state::StateFile;

use super::probe::{self, ProbeError};
use super::server::{RefreshError, ServerMonitor, ServerState};

/// What one server's concurrent check produced
pub(crate) struct TickOutcome {
    pub probe: Result<(), ProbeError>,
    pub refresh: Option<Result<super::server::RefreshSnapshot, RefreshError>>,
}

impl TickOutcome {
    /// A refresh failure counts as a probe failure for the tick.
    fn is_failure(&self) -> bool {
        self.probe.is_err() || matches!(self.refresh, Some(Err(_)))
    }
}

/// Coordinator owning the cluster view: the server records, the master
/// pointer, the slaves list and the freeze backup slot.
pub struct TopologyMonitor {
    pub(crate) config: Config,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) alert_sink: Option<Arc<dyn AlertSink>>,
    pub(crate) http: reqwest::Client,
    pub(crate) state_file: StateFile,
    pub(crate) servers: Vec<ServerMonitor>,
    pub(crate) master: Option<usize>,
    pub(crate) slaves: Vec<usize>,
    pub(crate) saved_max_conn: Option<String>,
}

impl TopologyMonitor {
    pub async fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        alert_sink: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        let mut servers = Vec::with_capacity(config.monitor.servers.len());
        for url in &config.monitor.servers {
            let mut server = ServerMonitor::new(url);
            if let Err(e) = server.resolve().await {
                // The server is still created and retried on later ticks
                error!("{}", e);
            }
            servers.push(server);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.monitor.timeout))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config: config.clone(),
            connector,
            alert_sink,
            http,
            state_file: StateFile::new(&config.state.file),
            servers,
            master: None,
            slaves: Vec::new(),
            saved_max_conn: None,
        }
    }

    pub fn servers(&self) -> &[ServerMonitor] {
        &self.servers
    }

    pub fn master_index(&self) -> Option<usize> {
        self.master
    }

    pub fn slave_indices(&self) -> &[usize] {
        &self.slaves
    }

    pub(crate) fn is_master(&self, idx: usize) -> bool {
        self.master == Some(idx)
    }

    /// Run monitoring ticks until the shutdown token fires. Cancellation is
    /// checked between ticks only; the per-operation timeouts bound a tick.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.monitor.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(servers = self.servers.len(), "Replication monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    self.ensure_master().await;
                    if self.config.monitor.verbose {
                        self.log_topology();
                    }
                }
            }
        }

        // Dropping the connections closes them
        for server in &mut self.servers {
            server.conn = None;
        }
    }

    /// One monitoring tick: concurrent per-server checks, then the
    /// serialized commit.
    pub async fn tick(&mut self) {
        let mut tasks: JoinSet<(usize, Option<Box<dyn DbConn>>, TickOutcome)> = JoinSet::new();
        let checktype = self.config.monitor.checktype;

        for idx in 0..self.servers.len() {
            let mut conn = self.servers[idx].conn.take();
            let host = self.servers[idx].host.clone();
            let port = self.servers[idx].port;
            let connector = self.connector.clone();
            let http = self.http.clone();
            let master_conn = self.config.db.master_conn.clone();

            tasks.spawn(async move {
                let probe_result =
                    probe::check(checktype, &host, port, &connector, &http, &mut conn).await;

                let refresh = if probe_result.is_ok() {
                    match probe::ensure_conn(&mut conn, &connector, &host, port).await {
                        Ok(()) => {
                            let result = match conn.as_mut() {
                                Some(c) => {
                                    ServerMonitor::collect_refresh(c.as_mut(), &master_conn).await
                                }
                                None => Err(RefreshError::Driver(DriverError::NotConnected)),
                            };
                            if matches!(&result, Err(e) if e.is_fatal()) {
                                conn = None;
                            }
                            Some(result)
                        }
                        Err(e) => Some(Err(RefreshError::Driver(e))),
                    }
                } else {
                    None
                };

                (idx, conn, TickOutcome { probe: probe_result, refresh })
            });
        }

        // Tick barrier: every per-server check settles before any commit
        let mut outcomes: Vec<Option<TickOutcome>> =
            (0..self.servers.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, conn, outcome)) => {
                    self.servers[idx].conn = conn;
                    outcomes[idx] = Some(outcome);
                }
                Err(e) => error!(error = %e, "Server check task failed"),
            }
        }

        // Serialized commit, in server order so transitions are deterministic
        for idx in 0..self.servers.len() {
            if let Some(outcome) = outcomes[idx].take() {
                self.commit(idx, outcome).await;
            }
        }

        self.publish_state_counts();
    }

    async fn commit(&mut self, idx: usize, outcome: TickOutcome) {
        let prev = self.servers[idx].state;
        self.servers[idx].prev_state = prev;

        metrics::metrics().record_probe(!outcome.is_failure());

        if outcome.is_failure() {
            self.commit_failure(idx, prev, &outcome).await;
            return;
        }

        let snapshot = match outcome.refresh {
            Some(Ok(snapshot)) => snapshot,
            // Unreachable: a successful probe always carries a refresh result
            _ => return,
        };
        let slave_present = snapshot.slave.is_some();
        self.servers[idx].apply_refresh(snapshot);

        if self.is_master(idx) {
            let server = &self.servers[idx];
            metrics::metrics()
                .set_master_up_and_sync(server.semi_sync_master, server.rpl_master_status);
        }

        if !slave_present {
            self.commit_no_slave_status(idx, prev).await;
            return;
        }

        // The server replicates; reintroduce it when it was out of the pool
        match prev {
            ServerState::Failed | ServerState::Unconnected => {
                self.servers[idx].state = ServerState::Slave;
                self.servers[idx].fail_count = 0;
                self.slaves.push(idx);
                metrics::metrics().record_transition("Slave");
                if self.config.monitor.readonly {
                    let url = self.servers[idx].url.clone();
                    if let Some(conn) = self.servers[idx].conn.as_mut() {
                        if let Err(e) = conn.set_read_only(true).await {
                            error!(server = %url, error = %e,
                                "Could not set rejoining slave as read-only");
                        }
                    }
                }
            }
            ServerState::Suspect if !self.is_master(idx) => {
                // Replica debouncing is consecutive: a recovered suspect
                // resets its failure count. It never left the slaves list.
                self.servers[idx].state = ServerState::Slave;
                self.servers[idx].fail_count = 0;
                metrics::metrics().record_transition("Slave");
            }
            _ => {}
        }
    }

    /// Probe succeeded but the server reports no slave status.
    async fn commit_no_slave_status(&mut self, idx: usize, prev: ServerState) {
        if prev == ServerState::Failed {
            debug!(server = %self.servers[idx].url,
                "Reinitializing previously failed server as unconnected");
            self.servers[idx].state = ServerState::Unconnected;
            self.servers[idx].fail_count = 0;
            metrics::metrics().record_transition("Unconnected");

            if self.config.monitor.autorejoin && !self.is_master(idx) {
                if let Some(master_idx) = self.master {
                    info!(server = %self.servers[idx].url,
                        "Rejoining previously failed server");
                    match self.rejoin_server(idx, master_idx).await {
                        Ok(()) => metrics::metrics().record_rejoin(true),
                        Err(e) => {
                            error!(server = %self.servers[idx].url, error = %e,
                                "Failed to rejoin previously failed server");
                            metrics::metrics().record_rejoin(false);
                        }
                    }
                }
            }
        } else if !self.is_master(idx) {
            if prev != ServerState::Unconnected {
                debug!(server = %self.servers[idx].url,
                    "State unconnected set by non-master rule");
                metrics::metrics().record_transition("Unconnected");
            }
            self.servers[idx].state = ServerState::Unconnected;
            // No longer a replica; it reenters the pool when slave status
            // reappears
            self.remove_slave(idx);
        } else if matches!(prev, ServerState::Suspect | ServerState::Unconnected) {
            // Master back from a transient blip, or recovered while still
            // holding the master role because no failover replaced it. The
            // failure count from a blip is deliberately kept.
            self.servers[idx].state = ServerState::Master;
            metrics::metrics().record_transition("Master");
        }
    }

    async fn commit_failure(&mut self, idx: usize, prev: ServerState, outcome: &TickOutcome) {
        if let Err(e) = &outcome.probe {
            debug!(server = %self.servers[idx].url, error = %e, "Probe failed");
        } else if let Some(Err(e)) = &outcome.refresh {
            debug!(server = %self.servers[idx].url, error = %e, "Refresh failed");
        }

        let maxfail = self.config.monitor.maxfail;
        let mut confirmed_master_failure = false;

        if self.is_master(idx) && self.servers[idx].state != ServerState::Failed {
            let server = &mut self.servers[idx];
            server.fail_count += 1;
            if server.fail_count <= maxfail {
                warn!(retry = server.fail_count, maxfail, "Master failure detected!");
            }
            if server.fail_count >= maxfail {
                if server.fail_count == maxfail {
                    warn!("Declaring master as failed");
                    confirmed_master_failure = true;
                }
                server.state = ServerState::Failed;
            } else {
                server.state = ServerState::Suspect;
            }
        } else if !matches!(
            self.servers[idx].state,
            ServerState::Master | ServerState::Failed
        ) {
            let server = &mut self.servers[idx];
            server.fail_count += 1;
            if server.fail_count >= maxfail {
                if server.fail_count == maxfail {
                    warn!(server = %server.url, "Declaring server as failed");
                }
                server.state = ServerState::Failed;
                self.remove_slave(idx);
            } else {
                server.state = ServerState::Suspect;
            }
        }

        let state = self.servers[idx].state;
        if state != prev {
            metrics::metrics().record_transition(state.as_str());
            self.send_alert(idx).await;
        }

        if confirmed_master_failure {
            let position = self.servers[idx].binlog_pos.clone();
            if let Err(e) = self.state_file.write_position(&position).await {
                error!(path = %self.state_file.path().display(), error = %e,
                    "Could not persist failed master's binlog position");
            }
        }
    }

    /// Unordered O(1) removal from the slaves list; order is not observable.
    pub(crate) fn remove_slave(&mut self, idx: usize) {
        if let Some(pos) = self.slaves.iter().position(|&s| s == idx) {
            self.slaves.swap_remove(pos);
        }
    }

    async fn send_alert(&self, idx: usize) {
        let Some(sink) = &self.alert_sink else { return };
        if self.config.alert.mail_to.is_empty() {
            return;
        }
        let server = &self.servers[idx];
        if self.config.monitor.verbose {
            info!(server = %server.url, from = %server.prev_state, to = %server.state,
                "Server state changed");
        }
        let alert = Alert {
            from: self.config.alert.mail_from.clone(),
            to: self.config.alert.mail_to.clone(),
            kind: server.state.to_string(),
            origin: server.url.clone(),
            destination: self.config.alert.smtp_addr.clone(),
        };
        match sink.send(&alert).await {
            Ok(()) => metrics::metrics().record_alert(),
            Err(e) => error!(error = %e, "Could not send email alert"),
        }
    }

    /// Post-tick bookkeeping: recover a master pointer, or drive failover
    /// while the cluster has a confirmed-failed master.
    pub async fn ensure_master(&mut self) {
        match self.master {
            Some(m) if self.servers[m].state == ServerState::Failed => {
                if !self.failover(false).await {
                    warn!("Failover did not complete, cluster has no writable master");
                }
            }
            Some(_) => {}
            None => self.discover_topology(),
        }
    }

    /// Establish the master pointer from observed replication topology.
    /// Never overrides a live master.
    fn discover_topology(&mut self) {
        let candidates: Vec<usize> = self
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ServerState::Unconnected)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return;
        }

        if let Some(&first) = self.slaves.first() {
            let rest: Vec<&ServerMonitor> = self.slaves[1..]
                .iter()
                .map(|&i| &self.servers[i])
                .collect();
            if !self.servers[first].has_siblings(&rest) {
                warn!("Slaves report different masters, topology may be mixed");
            }
        }

        let observed_master_host = self
            .slaves
            .iter()
            .map(|&i| self.servers[i].master_host.clone())
            .find(|h| !h.is_empty());

        let chosen = candidates
            .iter()
            .copied()
            .find(|&i| {
                observed_master_host
                    .as_deref()
                    .map(|h| self.servers[i].host == h || self.servers[i].ip == h)
                    .unwrap_or(false)
            })
            .or_else(|| {
                candidates
                    .iter()
                    .copied()
                    .find(|&i| self.servers[i].url == self.config.monitor.pref_master)
            })
            .or_else(|| (candidates.len() == 1).then(|| candidates[0]));

        match chosen {
            Some(idx) => {
                info!(master = %self.servers[idx].url, "Master detected");
                self.servers[idx].state = ServerState::Master;
                self.servers[idx].fail_count = 0;
                self.remove_slave(idx);
                self.master = Some(idx);
            }
            None => debug!(
                candidates = candidates.len(),
                "Could not determine a master yet"
            ),
        }
    }

    fn publish_state_counts(&self) {
        for state in [
            ServerState::Master,
            ServerState::Slave,
            ServerState::Unconnected,
            ServerState::Suspect,
            ServerState::Failed,
        ] {
            let count = self.servers.iter().filter(|s| s.state == state).count();
            metrics::metrics().set_server_state_count(state.as_str(), count as i64);
        }
    }

    fn log_topology(&self) {
        for server in &self.servers {
            info!(
                server = %server.url,
                state = %server.state,
                health = %server.replication_status(),
                "Topology"
            );
        }
    }
}
