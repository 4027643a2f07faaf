//! The atomic unit of dispatch: one message, retried with backoff.
//!
//! This is the only place sends are retried. Callers get back a
//! [`SendOutcome`] and never retry a failed send themselves.

use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use kova_common::{internal, tracing};
use tokio::sync::Semaphore;

use crate::{
    AttachmentSpec, CircuitBreaker, Composer, Delivery, MailBody, MailError, MailJob, RetryPolicy,
    Transport,
};

/// What to send for one job.
#[derive(Debug)]
pub struct SendRequest<'a> {
    pub job: &'a MailJob,
    /// Final body text; report bodies are rendered before the request is made
    pub body: Cow<'a, str>,
    /// Attachments produced at dispatch time, such as a bulk archive
    pub extra_attachments: Vec<AttachmentSpec>,
}

impl<'a> SendRequest<'a> {
    /// A request using the job's own body.
    ///
    /// A report body without a rendered report is sent as its header and footer.
    #[must_use]
    pub fn new(job: &'a MailJob) -> Self {
        let body = match job.body() {
            MailBody::Text(text) => Cow::Borrowed(text.as_str()),
            MailBody::DispatchReport { header, footer } => {
                Cow::Owned(format!("{header}\n\n{footer}").trim().to_string())
            }
        };

        Self {
            job,
            body,
            extra_attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Cow<'a, str>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentSpec) -> Self {
        self.extra_attachments.push(attachment);
        self
    }
}

/// Result of one executor invocation.
#[derive(Debug)]
pub struct SendOutcome {
    pub result: Result<Delivery, MailError>,
    /// Transport sends actually attempted, `0` when refused up front
    pub attempts: u32,
}

impl SendOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    const fn refused(error: MailError) -> Self {
        Self {
            result: Err(error),
            attempts: 0,
        }
    }
}

pub struct SendExecutor {
    transport: Arc<dyn Transport>,
    circuit: Arc<CircuitBreaker>,
    composer: Composer,
    retry: RetryPolicy,
    /// Sends in flight across the process, independent of pool size
    in_flight: Semaphore,
    interrupted: AtomicBool,
}

impl SendExecutor {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        circuit: Arc<CircuitBreaker>,
        composer: Composer,
        retry: RetryPolicy,
        max_parallel_sends: usize,
    ) -> Self {
        Self {
            transport,
            circuit,
            composer,
            retry,
            in_flight: Semaphore::new(max_parallel_sends.max(1)),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Refuse every send that has not reached the transport yet.
    ///
    /// Attempts already on the wire run to completion but are not retried.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send one message.
    ///
    /// 1. An open circuit refuses the send without touching the network.
    /// 2. Up to `max_retries + 1` attempts follow, each making sure the
    ///    transport is started first.
    /// 3. A failure feeds the circuit breaker, then sleeps
    ///    `base * 2^(attempt - 1)` unless it was the final attempt.
    ///
    /// Permanent failures (5xx rejections, attachment problems) end the loop
    /// early since every retry would fail the same way.
    pub async fn execute(&self, request: SendRequest<'_>) -> SendOutcome {
        if let Some(remaining) = self.circuit.remaining_open() {
            return SendOutcome::refused(MailError::CircuitOpen { remaining });
        }

        let Ok(_permit) = self.in_flight.acquire().await else {
            return SendOutcome::refused(MailError::Internal("send limiter closed".to_string()));
        };
        if self.is_interrupted() {
            return SendOutcome::refused(MailError::Interrupted);
        }

        let message = match self
            .composer
            .compose(request.job, &request.body, &request.extra_attachments)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(job = %request.job.label(), "Message not sent: {e}");
                return SendOutcome::refused(e);
            }
        };

        let label = request.job.label();
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            if self.is_interrupted() {
                return SendOutcome {
                    result: Err(MailError::Interrupted),
                    attempts: attempt - 1,
                };
            }

            if let Some(remaining) = self.circuit.remaining_open() {
                return SendOutcome {
                    result: Err(MailError::CircuitOpen { remaining }),
                    attempts: attempt - 1,
                };
            }

            let sent = if self.transport.start().await {
                self.transport.send(&message).await
            } else {
                Err(MailError::CannotConnect)
            };

            let error = match sent {
                Ok(delivery) => {
                    self.circuit.record_success();
                    internal!(level = INFO, "Sent {label} on attempt {attempt}/{max_attempts}");
                    if delivery.is_partial() {
                        tracing::warn!(
                            job = %label,
                            refused = delivery.refused.len(),
                            "Relay refused some recipients"
                        );
                    }
                    return SendOutcome {
                        result: Ok(delivery),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            tracing::warn!(
                job = %label,
                attempt,
                of = max_attempts,
                "Send failed: {error}"
            );

            if error.counts_against_circuit() {
                self.circuit.record_failure();
            }

            if error.is_permanent() || self.retry.is_final_attempt(attempt) {
                return SendOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
    }
}
