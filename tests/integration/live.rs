//! Live-server smoke tests for the driver, against a real MariaDB.

use std::time::Duration;

use mysql::prelude::*;

use argus::driver::{Connector, MysqlConnector};
use argus::gtid::GtidList;

use crate::{get_mysql_config, skip_if_not_enabled};

fn connector() -> MysqlConnector {
    let config = get_mysql_config();
    MysqlConnector::new(&config.user, &config.password, "", Duration::from_secs(3))
}

#[tokio::test]
async fn test_connect_and_ping() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let mut conn = connector().connect(&config.host, config.port).await.unwrap();
    conn.ping().await.expect("ping should succeed");
}

#[tokio::test]
async fn test_variables_match_direct_client() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let mut conn = connector().connect(&config.host, config.port).await.unwrap();
    let vars = conn.get_variables().await.unwrap();

    let server_id = vars.get("SERVER_ID").expect("SERVER_ID variable");

    // Cross-check against an independent client
    let pool = mysql::Pool::new(config.url().as_str()).unwrap();
    let mut direct = pool.get_conn().unwrap();
    let direct_id: Option<u64> = direct.query_first("SELECT @@server_id").unwrap();
    assert_eq!(server_id.parse::<u64>().ok(), direct_id);
}

#[tokio::test]
async fn test_gtid_variables_parse() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let mut conn = connector().connect(&config.host, config.port).await.unwrap();
    let vars = conn.get_variables().await.unwrap();

    // MariaDB exposes these; empty on a fresh server, which parses too
    for name in ["GTID_BINLOG_POS", "GTID_CURRENT_POS", "GTID_SLAVE_POS"] {
        let value = vars.get(name).cloned().unwrap_or_default();
        GtidList::parse(&value).unwrap_or_else(|e| panic!("{} = {:?}: {}", name, value, e));
    }
}

#[tokio::test]
async fn test_slave_status_shape() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let mut conn = connector().connect(&config.host, config.port).await.unwrap();

    // A standalone server has no slave status; a replica reports its threads
    if let Some(status) = conn.get_slave_status().await.unwrap() {
        assert!(["Yes", "No", "Connecting", ""].contains(&status.io_running.as_str()));
        assert!(!status.master_host.is_empty());
    }
}
