//! MySQL connection: connect, authenticate, text-protocol queries

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake,
};
use super::packet::{capabilities, commands, parse_lenenc_int, parse_lenenc_str, Packet,
    PacketCodec};
use super::{DbConn, DriverError, SlaveStatus};

/// Where to dial: TCP host:port, or a local unix socket
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: String },
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Text-protocol result set
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Value of `name` in `row`; None when the column is missing or NULL.
    pub fn get(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.column_index(name)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// A live connection to one monitored server
pub struct MysqlConn {
    framed: Framed<Stream, PacketCodec>,
    timeout: Duration,
}

impl MysqlConn {
    /// Dial and authenticate, all under `timeout`.
    pub async fn connect(
        endpoint: &Endpoint,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        tokio::time::timeout(timeout, Self::do_connect(endpoint, user, password, timeout))
            .await
            .map_err(|_| DriverError::Timeout)?
    }

    async fn do_connect(
        endpoint: &Endpoint,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let stream = match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| DriverError::Connect(e.to_string()))?;
                Stream::Tcp(stream)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| DriverError::Connect(e.to_string()))?;
                Stream::Unix(stream)
            }
        };

        let mut conn = Self {
            framed: Framed::new(stream, PacketCodec),
            timeout,
        };

        let greeting = conn.recv_raw().await?;
        if is_err_packet(&greeting.payload) {
            let err = ErrPacket::parse(&greeting.payload)
                .unwrap_or_else(|| ErrPacket {
                    error_code: 0,
                    error_message: "server rejected connection".into(),
                });
            return Err(DriverError::Connect(err.error_message));
        }
        let handshake = InitialHandshake::parse(&greeting.payload)
            .ok_or_else(|| DriverError::Protocol("invalid server handshake".into()))?;
        debug!(server_version = %handshake.server_version, "Received server handshake");

        let caps = capabilities::CLIENT_CAPABILITIES & handshake.capability_flags;
        let auth_response = compute_auth_response(password, &handshake.auth_plugin_data);

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: user.to_string(),
            auth_response,
            database: None,
            auth_plugin_name: handshake.auth_plugin_name.clone(),
        };
        conn.send(response.encode(greeting.sequence_id + 1)).await?;

        let reply = conn.recv_raw().await?;
        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload).unwrap_or_else(|| ErrPacket {
                error_code: 1045,
                error_message: "access denied".into(),
            });
            return Err(DriverError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(DriverError::Protocol("expected OK after handshake".into()));
        }

        Ok(conn)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), DriverError> {
        self.framed
            .send(packet)
            .await
            .map_err(|e| DriverError::Io(e.to_string()))
    }

    async fn recv_raw(&mut self) -> Result<Packet, DriverError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(DriverError::Io(e.to_string())),
            None => Err(DriverError::Disconnected),
        }
    }

    async fn recv(&mut self) -> Result<Packet, DriverError> {
        tokio::time::timeout(self.timeout, self.recv_raw())
            .await
            .map_err(|_| DriverError::Timeout)?
    }

    /// Run a text-protocol query and collect the full result set.
    /// Statements that return OK yield an empty result set.
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        self.send(Packet::command(commands::COM_QUERY, sql.as_bytes()))
            .await?;

        let first = self.recv().await?;
        if is_err_packet(&first.payload) {
            return Err(query_error(&first.payload));
        }
        if is_ok_packet(&first.payload) {
            return Ok(ResultSet::default());
        }

        let (col_count, _) = parse_lenenc_int(&first.payload)
            .ok_or_else(|| DriverError::Protocol("bad column count".into()))?;
        let col_count = col_count as usize;

        let mut result = ResultSet::default();
        for _ in 0..col_count {
            let def = self.recv().await?;
            result.columns.push(parse_column_name(&def.payload)?);
        }

        // Classic framing sends an EOF between the definitions and the rows;
        // DEPRECATE_EOF backends jump straight to the first row.
        let mut next = self.recv().await?;
        if is_eof_packet(&next.payload) {
            next = self.recv().await?;
        }

        loop {
            // Rows end at the EOF marker. A row can itself start with 0x00
            // (empty first column) or 0xFE (8-byte length prefix), so only
            // the short-0xFE form terminates.
            if is_eof_packet(&next.payload) {
                break;
            }
            if is_err_packet(&next.payload) {
                return Err(query_error(&next.payload));
            }
            result.rows.push(parse_row(&next.payload, col_count)?);
            next = self.recv().await?;
        }

        Ok(result)
    }

    async fn query_single(&mut self, sql: &str) -> Result<Option<String>, DriverError> {
        let result = self.query(sql).await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.first())
            .cloned()
            .flatten())
    }

    async fn variables_map(&mut self, sql: &str) -> Result<HashMap<String, String>, DriverError> {
        let result = self.query(sql).await?;
        let mut map = HashMap::with_capacity(result.rows.len());
        for row in &result.rows {
            if let (Some(Some(name)), Some(value)) = (row.first(), row.get(1)) {
                map.insert(
                    name.to_uppercase(),
                    value.clone().unwrap_or_default(),
                );
            }
        }
        Ok(map)
    }
}

fn query_error(payload: &[u8]) -> DriverError {
    match ErrPacket::parse(payload) {
        Some(err) => DriverError::Query {
            code: err.error_code,
            message: err.error_message,
        },
        None => DriverError::Protocol("unparseable error packet".into()),
    }
}

/// Column name is the fifth length-encoded string of a column definition.
fn parse_column_name(payload: &[u8]) -> Result<String, DriverError> {
    let mut offset = 0;
    let mut name = None;
    for i in 0..5 {
        let (value, used) = parse_lenenc_str(&payload[offset..])
            .ok_or_else(|| DriverError::Protocol("bad column definition".into()))?;
        offset += used;
        if i == 4 {
            name = value;
        }
    }
    Ok(name.unwrap_or_default())
}

fn parse_row(payload: &[u8], col_count: usize) -> Result<Vec<Option<String>>, DriverError> {
    let mut offset = 0;
    let mut row = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let (value, used) = parse_lenenc_str(&payload[offset..])
            .ok_or_else(|| DriverError::Protocol("bad row data".into()))?;
        offset += used;
        row.push(value);
    }
    Ok(row)
}

fn parse_slave_status(result: &ResultSet) -> Option<SlaveStatus> {
    if result.rows.is_empty() {
        return None;
    }
    let text = |name: &str| result.get(0, name).unwrap_or_default().to_string();
    fn number<T: std::str::FromStr + Default>(result: &ResultSet, name: &str) -> T {
        result
            .get(0, name)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
    Some(SlaveStatus {
        using_gtid: text("Using_Gtid"),
        io_running: text("Slave_IO_Running"),
        sql_running: text("Slave_SQL_Running"),
        seconds_behind_master: result
            .get(0, "Seconds_Behind_Master")
            .and_then(|v| v.parse().ok()),
        master_server_id: number(result, "Master_Server_Id"),
        master_host: text("Master_Host"),
        last_io_errno: number(result, "Last_IO_Errno"),
        last_io_error: text("Last_IO_Error"),
        last_sql_errno: number(result, "Last_SQL_Errno"),
        last_sql_error: text("Last_SQL_Error"),
    })
}

#[async_trait]
impl DbConn for MysqlConn {
    async fn ping(&mut self) -> Result<(), DriverError> {
        self.send(Packet::command(commands::COM_PING, &[])).await?;
        let reply = self.recv().await?;
        if is_ok_packet(&reply.payload) {
            Ok(())
        } else {
            Err(DriverError::Protocol("unexpected ping response".into()))
        }
    }

    async fn get_variables(&mut self) -> Result<HashMap<String, String>, DriverError> {
        self.variables_map("SHOW GLOBAL VARIABLES").await
    }

    async fn get_status(&mut self) -> Result<HashMap<String, String>, DriverError> {
        self.variables_map("SHOW GLOBAL STATUS").await
    }

    async fn get_slave_status(&mut self) -> Result<Option<SlaveStatus>, DriverError> {
        let result = self.query("SHOW SLAVE STATUS").await?;
        Ok(parse_slave_status(&result))
    }

    async fn set_read_only(&mut self, on: bool) -> Result<(), DriverError> {
        let flag = if on { 1 } else { 0 };
        self.exec(&format!("SET GLOBAL read_only = {}", flag)).await
    }

    async fn set_default_master_conn(&mut self, name: &str) -> Result<(), DriverError> {
        let escaped = name.replace('\'', "''");
        self.exec(&format!("SET default_master_connection = '{}'", escaped))
            .await
    }

    async fn long_running_writes(&mut self, min_secs: u64) -> Result<u64, DriverError> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.processlist \
             WHERE command = 'Query' AND time >= {} AND info NOT LIKE 'select%'",
            min_secs
        );
        let value = self.query_single(&sql).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn kill_threads(&mut self) -> Result<(), DriverError> {
        let result = self
            .query(
                "SELECT id FROM information_schema.processlist \
                 WHERE command != 'Binlog Dump' AND id != CONNECTION_ID()",
            )
            .await?;
        for row in &result.rows {
            if let Some(Some(id)) = row.first() {
                // Sessions may vanish between listing and killing
                let _ = self.exec(&format!("KILL {}", id)).await;
            }
        }
        Ok(())
    }

    async fn binlog_filters(&mut self) -> Result<(String, String), DriverError> {
        let result = self.query("SHOW MASTER STATUS").await?;
        if result.rows.is_empty() {
            return Ok((String::new(), String::new()));
        }
        let do_db = result.get(0, "Binlog_Do_DB").unwrap_or_default().to_string();
        let ignore_db = result
            .get(0, "Binlog_Ignore_DB")
            .unwrap_or_default()
            .to_string();
        Ok((do_db, ignore_db))
    }

    async fn slave_prerequisites(&mut self) -> Result<bool, DriverError> {
        let log_bin = self
            .variables_map("SHOW GLOBAL VARIABLES LIKE 'log_bin'")
            .await?;
        let server_id = self
            .variables_map("SHOW GLOBAL VARIABLES LIKE 'server_id'")
            .await?;
        let log_bin_on = log_bin.get("LOG_BIN").map(|v| v == "ON").unwrap_or(false);
        let server_id_ok = server_id
            .get("SERVER_ID")
            .map(|v| v.parse::<u32>().unwrap_or(0) != 0)
            .unwrap_or(false);
        Ok(log_bin_on && server_id_ok)
    }

    async fn start_slave(&mut self) -> Result<(), DriverError> {
        self.exec("START SLAVE").await
    }

    async fn exec(&mut self, sql: &str) -> Result<(), DriverError> {
        self.query(sql).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> ResultSet {
        ResultSet {
            columns: vec![
                "Master_Host".into(),
                "Slave_IO_Running".into(),
                "Seconds_Behind_Master".into(),
            ],
            rows: vec![vec![
                Some("db1".into()),
                Some("Yes".into()),
                None,
            ]],
        }
    }

    #[test]
    fn test_result_set_lookup() {
        let result = sample_result();
        assert_eq!(result.get(0, "Master_Host"), Some("db1"));
        assert_eq!(result.get(0, "master_host"), Some("db1"));
        assert_eq!(result.get(0, "Seconds_Behind_Master"), None);
        assert_eq!(result.get(0, "Nope"), None);
        assert_eq!(result.get(1, "Master_Host"), None);
    }

    #[test]
    fn test_parse_slave_status_null_delay() {
        let status = parse_slave_status(&sample_result()).unwrap();
        assert_eq!(status.master_host, "db1");
        assert_eq!(status.io_running, "Yes");
        assert_eq!(status.seconds_behind_master, None);
    }

    #[test]
    fn test_parse_slave_status_empty() {
        let empty = ResultSet::default();
        assert!(parse_slave_status(&empty).is_none());
    }
}
