//! One live, authenticated SMTP session.

use std::time::Duration;

use kova_common::tracing;
use kova_smtp::client::{ClientError, SmtpClient};
use tokio::time::Instant;

use crate::{Delivery, MailError, OutboundMessage, RefusedRecipient, SmtpTimeouts};

/// A connection handle.
///
/// Owned by exactly one sender at a time. Any failure that leaves the SMTP
/// dialogue in an unknown state clears `healthy`; unhealthy sessions are
/// recreated or dropped, never reused.
pub struct Session {
    id: u64,
    client: SmtpClient,
    port: u16,
    healthy: bool,
    last_used: Instant,
    delivered: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("healthy", &self.healthy)
            .field("tls", &self.client.is_tls())
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(id: u64, client: SmtpClient, port: u16) -> Self {
        Self {
            id,
            client,
            port,
            healthy: true,
            last_used: Instant::now(),
            delivered: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub const fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    #[must_use]
    pub const fn last_used(&self) -> Instant {
        self.last_used
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Messages accepted on this session so far.
    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Run one MAIL/RCPT/DATA transaction under the send timeout.
    ///
    /// Recipients refused individually are returned in the [`Delivery`]; the
    /// transaction fails only if every recipient is refused.
    pub async fn deliver(
        &mut self,
        message: &OutboundMessage,
        timeouts: &SmtpTimeouts,
    ) -> Result<Delivery, MailError> {
        self.last_used = Instant::now();
        let limit = timeouts.send();

        let result = match tokio::time::timeout(limit, self.transaction(message)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::timeout("send", limit)),
        };

        match &result {
            Ok(_) => self.delivered += 1,
            Err(e) if e.session_survives() => {
                // Leave the session ready for the next transaction
                let reset = tokio::time::timeout(timeouts.quit(), self.client.rset()).await;
                if !matches!(reset, Ok(Ok(_))) {
                    self.healthy = false;
                }
            }
            Err(_) => self.healthy = false,
        }

        self.last_used = Instant::now();
        result
    }

    async fn transaction(&mut self, message: &OutboundMessage) -> Result<Delivery, MailError> {
        self.client.mail_from(&message.sender).await?.into_result()?;

        let mut accepted = 0usize;
        let mut refused = Vec::new();
        let mut last_refusal = None;
        for recipient in &message.recipients {
            match self.client.rcpt_to(recipient).await?.into_result() {
                Ok(_) => accepted += 1,
                Err(ClientError::SmtpError { code, message: text }) => {
                    tracing::warn!(session = self.id, %recipient, code, "Recipient refused: {text}");
                    refused.push(RefusedRecipient {
                        address: recipient.clone(),
                        reply: format!("{code} {text}"),
                    });
                    last_refusal = Some(ClientError::SmtpError { code, message: text });
                }
                Err(e) => return Err(e.into()),
            }
        }

        if accepted == 0 {
            return Err(last_refusal.map_or_else(
                || MailError::InvalidJob("message has no recipients".to_string()),
                MailError::from,
            ));
        }

        self.client.data().await?;
        self.client
            .send_data(message.content.as_bytes())
            .await?
            .into_result()?;
        Ok(Delivery { refused })
    }

    /// Cheap liveness check before reusing an idle session.
    pub async fn probe(&mut self, limit: Duration) -> bool {
        let alive = matches!(
            tokio::time::timeout(limit, self.client.noop()).await,
            Ok(Ok(response)) if response.is_success()
        );
        if !alive {
            self.healthy = false;
        }
        alive
    }

    /// Send QUIT and drop the connection.
    pub async fn close(mut self, limit: Duration) {
        if tokio::time::timeout(limit, self.client.quit()).await.is_err() {
            tracing::debug!(session = self.id, "QUIT timed out during teardown");
        }
    }
}
