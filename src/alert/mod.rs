//! Email alerting for server state transitions
//!
//! Alerts are best-effort: a failed dispatch is logged by the caller and
//! never stalls the monitor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// One state-transition notification
#[derive(Debug, Clone)]
pub struct Alert {
    pub from: String,
    pub to: String,
    /// The new server state, e.g. "Failed"
    pub kind: String,
    /// URL of the server that transitioned
    pub origin: String,
    /// SMTP relay address (host:port)
    pub destination: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("SMTP connection failed: {0}")]
    Connect(String),
    #[error("SMTP IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SMTP dialog error: expected {expected}, got {line:?}")]
    Dialog { expected: u16, line: String },
    #[error("SMTP dialog timed out")]
    Timeout,
}

/// Alert dispatch seam; the monitor only knows this trait.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Minimal SMTP client speaking HELO/MAIL/RCPT/DATA against the relay
/// named in the alert's destination.
pub struct SmtpAlerter {
    timeout: Duration,
}

impl SmtpAlerter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn dispatch(&self, alert: &Alert) -> Result<(), AlertError> {
        let stream = TcpStream::connect(&alert.destination)
            .await
            .map_err(|e| AlertError::Connect(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        expect_reply(&mut reader, 220).await?;

        write_half.write_all(b"HELO argus\r\n").await?;
        expect_reply(&mut reader, 250).await?;

        write_half
            .write_all(format!("MAIL FROM:<{}>\r\n", alert.from).as_bytes())
            .await?;
        expect_reply(&mut reader, 250).await?;

        write_half
            .write_all(format!("RCPT TO:<{}>\r\n", alert.to).as_bytes())
            .await?;
        expect_reply(&mut reader, 250).await?;

        write_half.write_all(b"DATA\r\n").await?;
        expect_reply(&mut reader, 354).await?;

        let body = format!(
            "From: {}\r\nTo: {}\r\nSubject: Replication monitor alert\r\n\r\n\
             Server {} changed state to {}\r\n.\r\n",
            alert.from, alert.to, alert.origin, alert.kind
        );
        write_half.write_all(body.as_bytes()).await?;
        expect_reply(&mut reader, 250).await?;

        write_half.write_all(b"QUIT\r\n").await?;
        debug!(origin = %alert.origin, kind = %alert.kind, "Alert dispatched");
        Ok(())
    }
}

#[async_trait]
impl AlertSink for SmtpAlerter {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        tokio::time::timeout(self.timeout, self.dispatch(alert))
            .await
            .map_err(|_| AlertError::Timeout)?
    }
}

/// Read SMTP replies until the final line of the reply, then check the code.
/// Continuation lines carry a '-' after the code.
async fn expect_reply<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    expected: u16,
) -> Result<(), AlertError> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(AlertError::Dialog {
                expected,
                line: "<EOF>".into(),
            });
        }
        let code: u16 = line.get(..3).and_then(|c| c.parse().ok()).unwrap_or(0);
        let continuation = line.as_bytes().get(3) == Some(&b'-');
        if continuation {
            continue;
        }
        if code != expected {
            return Err(AlertError::Dialog {
                expected,
                line: line.trim_end().to_string(),
            });
        }
        return Ok(());
    }
}
