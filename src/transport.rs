//! SMTP transport: one lock-protected, reusable connection per worker
//! instance. See spec.md §4.3.

use crate::error::ServiceError;
use mail_send::mail_builder::MessageBuilder;
use mail_send::smtp::message::IntoMessage;
use mail_send::{SmtpClient, SmtpClientBuilder};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

/// A connection is considered fresh if it was used within this long.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Attempts per `send` call before giving up (spec.md §4.3).
const SEND_MAX_ATTEMPTS: u32 = 2;

enum Stream {
    Tls(SmtpClient<TlsStream<TcpStream>>),
    Plain(SmtpClient<TcpStream>),
}

impl Stream {
    async fn send(&mut self, message: mail_send::smtp::message::Message<'_>) -> mail_send::Result<()> {
        match self {
            Stream::Tls(client) => client.send(message).await,
            Stream::Plain(client) => client.send(message).await,
        }
    }

    async fn noop(&mut self) -> mail_send::Result<()> {
        match self {
            Stream::Tls(client) => client.noop().await,
            Stream::Plain(client) => client.noop().await,
        }
    }
}

struct ConnectionState {
    stream: Stream,
    last_used: Instant,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
    pub timeout: Duration,
}

/// Owns exactly one SMTP connection, guarded by an exclusive lock — only
/// one send proceeds at a time per transport instance (spec.md §5).
/// Implementers wanting more parallelism run one `SmtpTransport` per
/// worker task rather than sharing this one.
pub struct SmtpTransport {
    settings: SmtpSettings,
    connection: Mutex<Option<ConnectionState>>,
}

impl SmtpTransport {
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Stream, ServiceError> {
        let builder = SmtpClientBuilder::new(self.settings.host.as_str(), self.settings.port)
            .implicit_tls(false)
            .timeout(self.settings.timeout)
            .credentials((self.settings.username.as_str(), self.settings.password.as_str()));

        let stream = if self.settings.use_tls {
            let client = builder
                .connect()
                .await
                .map_err(|err| ServiceError::transport(format!("connect failed: {err}")))?;
            Stream::Tls(client)
        } else {
            let client = builder
                .connect_plain()
                .await
                .map_err(|err| ServiceError::transport(format!("connect failed: {err}")))?;
            Stream::Plain(client)
        };

        debug!(host = %self.settings.host, port = self.settings.port, "opened new SMTP connection");
        Ok(stream)
    }

    /// Returns a connection known to be live, reusing the held one when
    /// it's both fresh and passes a NOOP. Any other outcome tears the
    /// connection down and opens a new one.
    async fn acquire<'a>(
        &self,
        guard: &'a mut Option<ConnectionState>,
    ) -> Result<&'a mut ConnectionState, ServiceError> {
        let reusable = match guard.as_mut() {
            Some(state) if state.last_used.elapsed() < CONNECTION_TIMEOUT => {
                match state.stream.noop().await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("held SMTP connection failed NOOP, reconnecting: {err}");
                        false
                    }
                }
            }
            Some(_) => {
                debug!("held SMTP connection is stale, reconnecting");
                false
            }
            None => false,
        };

        if !reusable {
            let stream = self.connect().await?;
            *guard = Some(ConnectionState {
                stream,
                last_used: Instant::now(),
            });
        }

        Ok(guard.as_mut().expect("just populated above"))
    }

    /// Sends a multipart/alternative message. Up to `SEND_MAX_ATTEMPTS`
    /// attempts; a failing attempt tears down the connection before the
    /// next retry, guarding against half-open sockets (spec.md §4.3).
    pub async fn send(
        &self,
        recipient_email: &str,
        recipient_name: Option<&str>,
        subject: &str,
        body_html: &str,
        body_text: Option<&str>,
    ) -> Result<(), ServiceError> {
        let to_header = match recipient_name {
            Some(name) if !name.is_empty() => format!("{name} <{recipient_email}>"),
            _ => recipient_email.to_string(),
        };
        let from_header = format!("{} <{}>", self.settings.from_name, self.settings.from_email);

        let mut builder = MessageBuilder::new()
            .from((self.settings.from_name.as_str(), self.settings.from_email.as_str()))
            .to(recipient_email)
            .subject(subject)
            .html_body(body_html.to_string());
        if let Some(text) = body_text {
            builder = builder.text_body(text.to_string());
        }
        let message = builder
            .into_message()
            .map_err(|err| ServiceError::transport(format!("could not assemble message: {err}")))?;
        debug!(to = %to_header, from = %from_header, "assembled outgoing message");

        let mut guard = self.connection.lock().await;

        let mut last_error = None;
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            let state = match self.acquire(&mut guard).await {
                Ok(state) => state,
                Err(err) => {
                    last_error = Some(err);
                    *guard = None;
                    continue;
                }
            };

            match state.stream.send(message.clone()).await {
                Ok(()) => {
                    state.last_used = Instant::now();
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, "SMTP send failed: {err}");
                    last_error = Some(ServiceError::transport(err.to_string()));
                    *guard = None;
                }
            }
        }

        // Final failure after exhausting all attempts is unconditionally
        // transient (spec.md §4.3), regardless of how the underlying
        // message happened to lexically classify.
        Err(last_error
            .map(ServiceError::force_transient)
            .unwrap_or_else(|| ServiceError::Transport {
                message: "send failed with no diagnostic".to_string(),
                transient: true,
            }))
    }

    /// Opens a connection, authenticates, and reports success — used at
    /// worker startup to fail fast on bad SMTP credentials.
    pub async fn validate(&self) -> bool {
        match self.connect().await {
            Ok(mut stream) => {
                let _ = stream.noop().await;
                info!("SMTP transport validated successfully");
                true
            }
            Err(err) => {
                warn!("SMTP transport validation failed: {err}");
                false
            }
        }
    }

    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
        debug!("SMTP transport closed");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "user".to_string(),
            password: "pass".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Notifications".to_string(),
            use_tls: false,
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn validate_fails_fast_against_unreachable_host() {
        let transport = SmtpTransport::new(settings());
        assert!(!transport.validate().await);
    }

    #[tokio::test]
    async fn send_against_unreachable_host_reports_transient_transport_error() {
        let transport = SmtpTransport::new(settings());
        let err = transport
            .send("a@x.io", None, "Hi", "<p>hi</p>", None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
