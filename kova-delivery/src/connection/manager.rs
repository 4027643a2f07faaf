//! Opening authenticated sessions and owning the persistent one.
//!
//! Ports are tried in configured order. Port 465 speaks TLS from the first
//! byte, 587 upgrades with STARTTLS, and any other port is treated like 587
//! with a warning. Each port gets `connect_retries` attempts with
//! `connect_backoff_ms * 2^attempt` between them.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use kova_common::{TlsPolicy, internal, tracing};
use kova_smtp::client::SmtpClient;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;

use super::{Session, Transport};
use crate::{Delivery, MailError, MailerConfig, OutboundMessage};

/// How the channel is secured on a given port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    Implicit,
    StartTls,
    Plain,
}

impl TlsMode {
    fn for_port(port: u16, policy: TlsPolicy) -> Self {
        if policy.is_disabled() {
            return Self::Plain;
        }
        match port {
            465 => Self::Implicit,
            587 => Self::StartTls,
            other => {
                tracing::warn!(port = other, "Unknown SMTP port, using STARTTLS");
                Self::StartTls
            }
        }
    }
}

/// Outcome of the STARTTLS step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartTlsOutcome {
    Upgraded,
    /// Not offered and not required
    Skipped,
    /// Upgrade failed under the opportunistic policy; reconnect in plaintext
    RetryPlain,
}

pub struct ConnectionManager {
    config: Arc<MailerConfig>,
    /// The persistent session used by [`ConnectionManager::send_message`]
    session: Mutex<Option<Session>>,
    /// Serialises connect sequences so failures cannot trigger a reconnect storm
    connect_lock: Mutex<()>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: Arc<MailerConfig>) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            connect_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Establish the persistent session if there is no healthy one.
    ///
    /// Returns `true` once an authenticated session is in place.
    pub async fn connect(&self) -> bool {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(Session::is_healthy) {
            return true;
        }

        match self.open_session().await {
            Ok(session) => {
                *slot = Some(session);
                true
            }
            Err(e) => {
                tracing::error!("Unable to connect to SMTP relay: {e}");
                false
            }
        }
    }

    /// Open a fresh session over the configured ports.
    pub async fn open_session(&self) -> Result<Session, MailError> {
        self.open_session_on(&self.config.effective_ports()).await
    }

    /// Open a fresh session, trying `ports` in order.
    ///
    /// # Errors
    ///
    /// [`MailError::CannotConnect`] when every port and attempt failed.
    pub async fn open_session_on(&self, ports: &[u16]) -> Result<Session, MailError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MailError::Configuration("mailer stopped".to_string()));
        }

        let _guard = self.connect_lock.lock().await;
        let attempts = self.config.connect_retries.max(1);

        for &port in ports {
            for attempt in 0..attempts {
                match self.try_port(port).await {
                    Ok(session) => {
                        tracing::info!(
                            host = %self.config.host,
                            port,
                            session = session.id(),
                            "SMTP session established"
                        );
                        return Ok(session);
                    }
                    Err(e) => {
                        tracing::warn!(
                            host = %self.config.host,
                            port,
                            attempt = attempt + 1,
                            of = attempts,
                            "SMTP connect failed: {e}"
                        );
                        if attempt + 1 < attempts {
                            tokio::time::sleep(self.config.connect_backoff(attempt)).await;
                        }
                    }
                }
            }
        }

        Err(MailError::CannotConnect)
    }

    async fn try_port(&self, port: u16) -> Result<Session, MailError> {
        let mode = TlsMode::for_port(port, self.config.tls);
        let mut client = self.greet(port, mode).await?;

        if mode == TlsMode::StartTls {
            match self.negotiate_starttls(&mut client).await? {
                StartTlsOutcome::Upgraded | StartTlsOutcome::Skipped => {}
                StartTlsOutcome::RetryPlain => {
                    tracing::info!(port, "Reconnecting without STARTTLS per RFC 3207 Section 4.1");
                    drop(client);
                    client = self.greet(port, TlsMode::Plain).await?;
                    self.ehlo(&mut client).await?;
                }
            }
        } else {
            self.ehlo(&mut client).await?;
        }

        self.login(&mut client).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, client, port))
    }

    /// Connect, optionally wrap in TLS, and read the greeting.
    async fn greet(&self, port: u16, mode: TlsMode) -> Result<SmtpClient, MailError> {
        let limit = self.config.timeouts.connect();
        let address = format!("{}:{port}", self.config.host);
        let host = self.config.host.clone();

        let connecting = async {
            let mut client = if mode == TlsMode::Implicit {
                SmtpClient::connect_tls(&address, host, self.config.accept_invalid_certs).await?
            } else {
                SmtpClient::connect(&address, host)
                    .await?
                    .accept_invalid_certs(self.config.accept_invalid_certs)
            };

            let greeting = client.read_greeting().await?;
            if !greeting.is_success() {
                return Err(MailError::Connection(format!(
                    "server rejected connection: {} {}",
                    greeting.code,
                    greeting.message()
                )));
            }
            Ok::<_, MailError>(client)
        };

        tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| MailError::timeout("connect", limit))?
    }

    async fn ehlo(&self, client: &mut SmtpClient) -> Result<(), MailError> {
        let limit = self.config.timeouts.connect();
        tokio::time::timeout(limit, client.ehlo(&self.config.helo_name))
            .await
            .map_err(|_| MailError::timeout("EHLO", limit))??
            .into_result()?;
        Ok(())
    }

    async fn negotiate_starttls(
        &self,
        client: &mut SmtpClient,
    ) -> Result<StartTlsOutcome, MailError> {
        self.ehlo(client).await?;

        let required = self.config.tls.is_required();
        if !client.supports("STARTTLS") {
            if required {
                return Err(MailError::Connection(
                    "server does not offer STARTTLS and TLS is required".to_string(),
                ));
            }
            tracing::warn!(host = %self.config.host, "STARTTLS not offered, continuing in plaintext");
            return Ok(StartTlsOutcome::Skipped);
        }

        let limit = self.config.timeouts.connect();
        let upgraded = match tokio::time::timeout(limit, client.starttls()).await {
            Ok(Ok(response)) if response.is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!(
                "STARTTLS refused: {} {}",
                response.code,
                response.message()
            )),
            Ok(Err(e)) => Err(format!("STARTTLS failed: {e}")),
            Err(_) => Err(format!("STARTTLS timed out after {limit:?}")),
        };

        match upgraded {
            Ok(()) => {
                self.ehlo(client).await?;
                Ok(StartTlsOutcome::Upgraded)
            }
            Err(reason) if required => Err(MailError::Connection(reason)),
            Err(reason) => {
                tracing::warn!(host = %self.config.host, "{reason}");
                Ok(StartTlsOutcome::RetryPlain)
            }
        }
    }

    async fn login(&self, client: &mut SmtpClient) -> Result<(), MailError> {
        let limit = self.config.timeouts.login();
        tokio::time::timeout(
            limit,
            client.authenticate(
                self.config.sender(),
                self.config.password.expose_secret(),
            ),
        )
        .await
        .map_err(|_| MailError::timeout("login", limit))??;
        Ok(())
    }

    /// Send over the persistent session.
    ///
    /// Connects first when there is no healthy session. When the send fails
    /// in a way that breaks the session, the session is torn down and exactly
    /// one reconnect-and-resend is attempted before the error is returned.
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<Delivery, MailError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MailError::Configuration("mailer stopped".to_string()));
        }

        let mut slot = self.session.lock().await;
        let timeouts = &self.config.timeouts;

        if !slot.as_ref().is_some_and(Session::is_healthy) {
            *slot = Some(self.open_session().await?);
        }

        let Some(session) = slot.as_mut() else {
            return Err(MailError::Internal("session slot empty after connect".to_string()));
        };

        let error = match session.deliver(message, timeouts).await {
            Ok(delivery) => return Ok(delivery),
            Err(e) if e.session_survives() => return Err(e),
            Err(e) => e,
        };

        internal!(level = WARN, "Send failed ({error}), reconnecting once");
        *slot = None;

        let mut fresh = self.open_session().await?;
        let result = fresh.deliver(message, timeouts).await;
        if fresh.is_healthy() {
            *slot = Some(fresh);
        }
        result
    }

    /// QUIT the persistent session and refuse further sends.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(session) = self.session.lock().await.take() {
            session.close(self.config.timeouts.quit()).await;
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn start(&self) -> bool {
        !self.is_stopped() && self.connect().await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, MailError> {
        self.send_message(message).await
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }
}
