//! Event socket client for the telephony gateway.
//!
//! The gateway speaks a line-oriented protocol: each message is a block of
//! `Name: value` headers terminated by an empty line, optionally followed by
//! a `Content-Length` body. A session opens with an `auth/request` from the
//! gateway, which the client answers with `auth <password>`. Commands are
//! acknowledged by a `command/reply` whose `Reply-Text` starts with `+OK` or
//! `-ERR`.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use faxline_lifecycle::{GatewayConnection, GatewayConnector, GatewayError};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{debug, warn};

/// Connection settings for the event socket.
#[derive(Debug, Clone)]
pub struct EslConfig {
    /// Gateway host.
    pub host: String,
    /// Event socket port.
    pub port: u16,
    /// Event socket password.
    pub password: String,
    /// Bound on connecting and on waiting for any single reply.
    pub io_timeout: Duration,
}

impl Default for EslConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8021,
            password: "ClueCon".to_string(),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens authenticated event socket sessions.
#[derive(Debug, Clone)]
pub struct EslConnector {
    config: EslConfig,
}

impl EslConnector {
    /// Creates a connector.
    pub const fn new(config: EslConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GatewayConnector for EslConnector {
    type Connection = EslConnection;

    async fn connect(&self) -> Result<EslConnection, GatewayError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(self.config.io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| GatewayError::Connect(format!("connect to {addr} timed out")))?
            .map_err(|e| GatewayError::Connect(format!("connect to {addr}: {e}")))?;

        let mut connection = EslConnection {
            stream: BufReader::new(stream),
            io_timeout: self.config.io_timeout,
            healthy: true,
        };

        let greeting = connection.read_message().await.map_err(connect_error)?;
        if greeting.content_type() != Some("auth/request") {
            return Err(GatewayError::Connect(format!(
                "unexpected greeting: {:?}",
                greeting.content_type()
            )));
        }

        let reply = connection
            .command(&format!("auth {}", self.config.password))
            .await
            .map_err(connect_error)?;
        debug!(%addr, reply = %reply, "event socket authenticated");

        Ok(connection)
    }
}

fn connect_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Command(message) => GatewayError::Connect(message),
        other => other,
    }
}

/// One authenticated event socket session.
pub struct EslConnection {
    stream: BufReader<TcpStream>,
    io_timeout: Duration,
    healthy: bool,
}

impl EslConnection {
    /// Sends a command and waits for its `command/reply`.
    async fn command(&mut self, command: &str) -> Result<String, GatewayError> {
        // A line break would end the frame early and start another command.
        if command.contains(|c: char| c == '\r' || c == '\n') {
            return Err(GatewayError::Command("command contains a line break".to_string()));
        }

        let frame = format!("{command}\n\n");
        if let Err(e) = self.stream.get_mut().write_all(frame.as_bytes()).await {
            self.healthy = false;
            return Err(GatewayError::Command(format!("write failed: {e}")));
        }

        loop {
            let message = self.read_message().await?;
            if message.content_type() != Some("command/reply") {
                // Events and logs may interleave with replies.
                continue;
            }

            let reply = message.header("Reply-Text").unwrap_or_default().to_string();
            if reply.starts_with("+OK") {
                return Ok(reply);
            }
            return Err(GatewayError::Command(reply));
        }
    }

    async fn read_message(&mut self) -> Result<EslMessage, GatewayError> {
        let read = tokio::time::timeout(self.io_timeout, read_message(&mut self.stream)).await;
        match read {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => {
                self.healthy = false;
                Err(GatewayError::Command(format!("read failed: {e}")))
            },
            Err(_) => {
                self.healthy = false;
                Err(GatewayError::Command("no reply from gateway".to_string()))
            },
        }
    }
}

#[async_trait]
impl GatewayConnection for EslConnection {
    async fn originate(&mut self, args: &str) -> Result<String, GatewayError> {
        let reply = self.command(&format!("bgapi originate {args}")).await;
        if let Err(err) = &reply {
            warn!(error = %err, healthy = self.healthy, "originate not accepted");
        }
        reply
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[derive(Debug, Default)]
struct EslMessage {
    headers: HashMap<String, String>,
}

impl EslMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> std::io::Result<EslMessage> {
    let mut message = EslMessage::default();
    let mut line = String::new();

    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            if message.headers.is_empty() {
                continue;
            }
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            message.headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    if let Some(length) = message.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await?;
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        sync::mpsc,
    };

    use super::*;

    /// Fake gateway accepting one session; every received command is
    /// forwarded on the channel and answered from `replies` in order.
    async fn fake_gateway(replies: Vec<&'static str>) -> (u16, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (commands, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            socket.get_mut().write_all(b"Content-Type: auth/request\n\n").await.unwrap();

            for reply in replies {
                let mut command = String::new();
                loop {
                    let mut line = String::new();
                    if socket.read_line(&mut line).await.unwrap() == 0 {
                        return;
                    }
                    if line.trim().is_empty() {
                        break;
                    }
                    command.push_str(line.trim());
                }
                commands.send(command).unwrap();
                socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        (port, received)
    }

    fn connector(port: u16, password: &str) -> EslConnector {
        EslConnector::new(EslConfig {
            port,
            password: password.to_string(),
            io_timeout: Duration::from_secs(2),
            ..EslConfig::default()
        })
    }

    #[tokio::test]
    async fn authenticates_and_originates() {
        let (port, mut received) = fake_gateway(vec![
            "Content-Type: command/reply\nReply-Text: +OK accepted\n\n",
            "Content-Type: log/data\nContent-Length: 5\n\nhello\
             Content-Type: command/reply\nReply-Text: +OK Job-UUID: 7f4de4bc\n\n",
        ])
        .await;

        let mut connection = connector(port, "ClueCon").connect().await.unwrap();
        assert_eq!(received.recv().await.unwrap(), "auth ClueCon");

        let args = "{origination_uuid=abc}sofia/gateway/1/2 &txfax(a.tiff)";
        let reply = connection.originate(args).await;
        assert_eq!(received.recv().await.unwrap(), format!("bgapi originate {args}"));
        assert_eq!(reply.unwrap(), "+OK Job-UUID: 7f4de4bc");
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    async fn multi_line_arguments_never_reach_the_socket() {
        let (port, mut received) = fake_gateway(vec![
            "Content-Type: command/reply\nReply-Text: +OK accepted\n\n",
            "Content-Type: command/reply\nReply-Text: +OK Job-UUID: 1\n\n",
        ])
        .await;

        let mut connection = connector(port, "ClueCon").connect().await.unwrap();
        assert_eq!(received.recv().await.unwrap(), "auth ClueCon");

        let err = connection
            .originate("sofia/gateway/1/2\n\napi system touch /tmp/x")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Command(_)));
        assert!(connection.is_healthy());

        connection.originate("sofia/gateway/1/2 &txfax(a.tiff)").await.unwrap();
        assert_eq!(
            received.recv().await.unwrap(),
            "bgapi originate sofia/gateway/1/2 &txfax(a.tiff)"
        );
    }

    #[tokio::test]
    async fn rejected_password_is_a_connect_error() {
        let (port, _received) =
            fake_gateway(vec!["Content-Type: command/reply\nReply-Text: -ERR invalid\n\n"]).await;

        let err = connector(port, "wrong").connect().await.err().unwrap();
        assert!(matches!(err, GatewayError::Connect(ref m) if m.contains("-ERR invalid")));
    }

    #[tokio::test]
    async fn command_error_keeps_connection_usable() {
        let (port, _received) = fake_gateway(vec![
            "Content-Type: command/reply\nReply-Text: +OK accepted\n\n",
            "Content-Type: command/reply\nReply-Text: -ERR NO_ROUTE_DESTINATION\n\n",
        ])
        .await;

        let mut connection = connector(port, "ClueCon").connect().await.unwrap();
        let err = connection.originate("x").await.unwrap_err();

        assert!(matches!(err, GatewayError::Command(ref m) if m.contains("NO_ROUTE_DESTINATION")));
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    async fn closed_socket_marks_connection_broken() {
        let (port, _received) =
            fake_gateway(vec!["Content-Type: command/reply\nReply-Text: +OK accepted\n\n"]).await;

        let mut connection = connector(port, "ClueCon").connect().await.unwrap();
        let err = connection.originate("x").await.unwrap_err();

        assert!(matches!(err, GatewayError::Command(_)));
        assert!(!connection.is_healthy());
    }

    #[tokio::test]
    async fn unreachable_gateway_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connector(port, "ClueCon").connect().await.err().unwrap();
        assert!(matches!(err, GatewayError::Connect(_)));
    }
}
