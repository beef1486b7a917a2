//! Server liveness probing
//!
//! A probe is a pure function of the server identity and the configured
//! check type; it completes within the connection timeout and never blocks
//! the monitor beyond it.

use std::sync::Arc;

use thiserror::Error;

use crate::config::CheckType;
use crate::driver::{Connector, DbConn, DriverError};

/// Port the HTTP monitoring agent listens on
pub const AGENT_PORT: u16 = 10001;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("ping failed: {0}")]
    Ping(String),
    #[error("HTTP response code error: {0}")]
    AgentStatus(u16),
    #[error("agent check failed: {0}")]
    Agent(String),
}

/// Make sure a usable connection sits in `conn`, dialing when absent.
pub async fn ensure_conn(
    conn: &mut Option<Box<dyn DbConn>>,
    connector: &Arc<dyn Connector>,
    host: &str,
    port: u16,
) -> Result<(), DriverError> {
    if conn.is_none() {
        *conn = Some(connector.connect(host, port).await?);
    }
    Ok(())
}

/// Run one liveness check. A failed tcp probe drops the cached connection so
/// the next tick redials.
pub async fn check(
    checktype: CheckType,
    host: &str,
    port: u16,
    connector: &Arc<dyn Connector>,
    http: &reqwest::Client,
    conn: &mut Option<Box<dyn DbConn>>,
) -> Result<(), ProbeError> {
    match checktype {
        CheckType::Tcp => {
            ensure_conn(conn, connector, host, port)
                .await
                .map_err(|e| ProbeError::Connect(e.to_string()))?;
            let c = match conn.as_mut() {
                Some(c) => c,
                None => return Err(ProbeError::Connect("no connection".into())),
            };
            if let Err(e) = c.ping().await {
                *conn = None;
                return Err(ProbeError::Ping(e.to_string()));
            }
            Ok(())
        }
        CheckType::Agent => agent_check(http, host, AGENT_PORT).await,
    }
}

/// GET the agent's check endpoint; anything but 200 is a failure.
async fn agent_check(http: &reqwest::Client, host: &str, port: u16) -> Result<(), ProbeError> {
    let url = format!("http://{}:{}/check/", host, port);
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| ProbeError::Agent(e.to_string()))?;
    let status = response.status().as_u16();
    if status != 200 {
        return Err(ProbeError::AgentStatus(status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with a fixed status line.
    async fn fake_agent(listener: TcpListener, status_line: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let response = format!(
            "{}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
            status_line
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    struct NoConnector;

    #[async_trait::async_trait]
    impl Connector for NoConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn DbConn>, DriverError> {
            Err(DriverError::Connect("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_agent_check_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_agent(listener, "HTTP/1.1 200 OK"));

        let http = reqwest::Client::new();
        agent_check(&http, "127.0.0.1", port).await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_check_bad_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_agent(listener, "HTTP/1.1 503 Service Unavailable"));

        let http = reqwest::Client::new();
        let err = agent_check(&http, "127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::AgentStatus(503)));
    }

    #[tokio::test]
    async fn test_agent_check_unreachable() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let http = reqwest::Client::new();
        let err = agent_check(&http, "127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Agent(_)));
    }

    #[tokio::test]
    async fn test_tcp_probe_connect_failure() {
        let connector: Arc<dyn Connector> = Arc::new(NoConnector);
        let http = reqwest::Client::new();
        let mut conn = None;
        let err = check(
            CheckType::Tcp,
            "127.0.0.1",
            3306,
            &connector,
            &http,
            &mut conn,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
        assert!(conn.is_none());
    }
}
