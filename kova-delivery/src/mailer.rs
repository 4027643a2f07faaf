//! The process-wide mail facade.
//!
//! Built once at startup and passed to whoever needs to send, with explicit
//! [`Mailer::start`] and [`Mailer::stop`] calls around its lifetime.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use kova_common::{internal, tracing};
use serde::Serialize;

use crate::{
    CircuitBreaker, CircuitBreakerStats, Composer, ConnectionManager, ConnectionPool,
    DispatchReport, DispatchState, Dispatcher, MailError, MailJob, MailerConfig, ReportContext,
    SendExecutor, SendRequest, SendResult, Transport,
};

/// Lifetime counters across batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailerStats {
    pub sent: u64,
    pub failed: u64,
}

/// Results of one batch plus the accountant's report on them.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub results: Vec<SendResult>,
    pub report: DispatchReport,
}

impl DispatchOutcome {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

pub struct Mailer {
    config: Arc<MailerConfig>,
    transport: Arc<dyn Transport>,
    executor: Arc<SendExecutor>,
    dispatcher: Dispatcher,
    sent: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicBool,
}

impl Mailer {
    /// Validate `config` and wire up the SMTP transport.
    ///
    /// A `pool_size` of one keeps a single persistent session; anything
    /// larger uses a [`ConnectionPool`].
    ///
    /// # Errors
    ///
    /// [`MailError::Configuration`] when the configuration cannot work.
    pub fn new(config: MailerConfig) -> Result<Self, MailError> {
        config.validate()?;
        let config = Arc::new(config);

        let manager = Arc::new(ConnectionManager::new(Arc::clone(&config)));
        let transport: Arc<dyn Transport> = if config.pool_size <= 1 {
            manager
        } else {
            Arc::new(ConnectionPool::new(manager))
        };

        Ok(Self::assemble(config, transport))
    }

    /// Use a caller-supplied transport instead of SMTP.
    ///
    /// # Errors
    ///
    /// [`MailError::Configuration`] when the configuration cannot work.
    pub fn with_transport(
        config: MailerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, MailError> {
        config.validate()?;
        Ok(Self::assemble(Arc::new(config), transport))
    }

    fn assemble(config: Arc<MailerConfig>, transport: Arc<dyn Transport>) -> Self {
        let executor = Arc::new(SendExecutor::new(
            Arc::clone(&transport),
            Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            Composer::new(&config),
            config.retry.clone(),
            config.max_parallel_sends,
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&executor), &config);

        Self {
            config,
            transport,
            executor,
            dispatcher,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Open the first session(s). Returns `false` when nothing could connect;
    /// sends will keep trying on their own.
    pub async fn start(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let started = self.transport.start().await;
        if started {
            internal!(level = INFO, "Mailer started against {}", self.config.host);
        } else {
            tracing::warn!(host = %self.config.host, "Mailer could not connect at startup");
        }
        started
    }

    /// Close every session. Later sends fail with a configuration error.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.stop().await;
        internal!(level = INFO, "Mailer stopped");
    }

    /// Let the running batch wind down: sends already talking to the relay
    /// finish, everything not yet started fails with
    /// [`MailError::Interrupted`]. Applies to later batches too.
    pub fn interrupt(&self) {
        if !self.executor.is_interrupted() {
            self.executor.interrupt();
            internal!(level = WARN, "Mailer interrupted, finishing sends in flight");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run a batch through the three phases and report on it.
    pub async fn dispatch(
        &self,
        jobs: impl Into<Arc<[MailJob]>>,
        context: &ReportContext,
    ) -> DispatchOutcome {
        let jobs: Arc<[MailJob]> = jobs.into();

        let results = if self.is_stopped() {
            let stopped = MailError::Configuration("mailer stopped".to_string());
            jobs.iter()
                .enumerate()
                .map(|(index, job)| SendResult::failure(index, job, &stopped, 0))
                .collect()
        } else {
            self.dispatcher.run(Arc::clone(&jobs), context).await
        };

        self.tally(&results);
        let report = self.dispatcher.accountant().report(&jobs, &results, context);
        DispatchOutcome { results, report }
    }

    /// Send one job outside a batch.
    pub async fn send_one(&self, job: &MailJob) -> SendResult {
        let result = if self.is_stopped() {
            SendResult::failure(
                0,
                job,
                &MailError::Configuration("mailer stopped".to_string()),
                0,
            )
        } else {
            let outcome = self.executor.execute(SendRequest::new(job)).await;
            match outcome.result {
                Ok(delivery) => {
                    SendResult::success(0, job, outcome.attempts).with_refused(delivery.refused)
                }
                Err(e) => SendResult::failure(0, job, &e, outcome.attempts),
            }
        };

        self.tally(std::slice::from_ref(&result));
        result
    }

    fn tally(&self, results: &[SendResult]) {
        let sent = results.iter().filter(|r| r.success).count() as u64;
        self.sent.fetch_add(sent, Ordering::Relaxed);
        self.failed
            .fetch_add(results.len() as u64 - sent, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> MailerStats {
        MailerStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitBreakerStats {
        self.executor.circuit().stats()
    }

    #[must_use]
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        self.executor.circuit()
    }

    #[must_use]
    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatcher.state()
    }
}
