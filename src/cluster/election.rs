//! Replica candidate election
//!
//! Filters the current slaves down to promotion-eligible candidates and
//! picks the one with the greatest cumulative GTID sequence. Everything the
//! filters compare against the old master comes from its cached record; the
//! old master is usually unreachable by the time an election runs.

use tracing::{debug, error, warn};

use super::monitor::TopologyMonitor;
use super::server::ServerState;

impl TopologyMonitor {
    /// Pick the most advanced eligible replica. Returns an index into the
    /// slaves list, or None when nothing qualifies.
    pub async fn elect_candidate(&mut self) -> Option<usize> {
        debug!(candidates = self.slaves.len(), "Processing candidates");

        let master_binlog_filters = self
            .master
            .map(|m| {
                (
                    self.servers[m].binlog_do_db.clone(),
                    self.servers[m].binlog_ignore_db.clone(),
                )
            });
        let master_repl_filters = self.master.map(|m| self.servers[m].repl_filters.clone());
        let master_binlog_pos = self.master.map(|m| self.servers[m].binlog_pos.clone());

        let master_conn_name = self.config.db.master_conn.clone();
        let options = self.config.monitor.clone();

        let mut best: Option<usize> = None;
        let mut max: u64 = 0;

        for pos in 0..self.slaves.len() {
            let idx = self.slaves[pos];
            let url = self.servers[idx].url.clone();

            if let Err(e) = self.servers[idx].refresh(&master_conn_name).await {
                warn!(server = %url, error = %e, "Could not refresh candidate, skipping");
                continue;
            }

            if options.ignore_list.contains(&url) {
                debug!(server = %url, "Candidate is in the ignore list, skipping");
                continue;
            }

            debug!(server = %url, index = pos, "Checking eligibility of candidate");

            if options.multi_master && self.servers[idx].state == ServerState::Master {
                warn!(server = %url, "Candidate has state Master, skipping");
                continue;
            }

            let prerequisites = match self.servers[idx].conn.as_mut() {
                Some(conn) => conn.slave_prerequisites().await.unwrap_or(false),
                None => false,
            };
            if !prerequisites {
                debug!(server = %url, "Candidate fails replica prerequisites, skipping");
                continue;
            }

            if let Some((do_db, ignore_db)) = &master_binlog_filters {
                let candidate = &self.servers[idx];
                if &candidate.binlog_do_db != do_db || &candidate.binlog_ignore_db != ignore_db {
                    warn!(server = %url, "Binlog filters differ on master and candidate, skipping");
                    continue;
                }
            }

            if let Some(filters) = &master_repl_filters {
                if &self.servers[idx].repl_filters != filters {
                    warn!(server = %url,
                        "Replication filters differ on master and candidate, skipping");
                    continue;
                }
            }

            let delay = match self.servers[idx].delay {
                Some(delay) => delay,
                None => {
                    warn!(server = %url, "Candidate replication is stopped, skipping");
                    continue;
                }
            };
            if delay > options.max_delay {
                warn!(server = %url, delay, max_delay = options.max_delay,
                    "Candidate exceeds maximum replication delay, skipping");
                continue;
            }

            if options.gtid_check {
                if let Some(master_pos) = &master_binlog_pos {
                    if &self.servers[idx].current_gtid != master_pos {
                        warn!(server = %url, "Candidate not in sync with master, skipping");
                        continue;
                    }
                }
            }

            // Rig the election when the candidate is the preferred master
            if url == options.pref_master {
                debug!(server = %url, "Election rig: preferred master elected");
                return Some(pos);
            }

            let score: u64 = self.servers[idx].slave_gtid.sum();
            debug!(server = %url, score, "Candidate sequence score");
            if score > max {
                max = score;
                best = Some(pos);
            }
        }

        if max > 0 {
            best
        } else {
            error!("No suitable candidates found.");
            None
        }
    }
}
