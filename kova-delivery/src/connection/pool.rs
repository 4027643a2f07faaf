//! A bounded set of reusable sessions.
//!
//! A semaphore with `pool_size` permits caps sessions in use. Idle sessions
//! wait in a queue; one is handed out per lease and returned with
//! [`ConnectionPool::put`]. Sessions that break are recreated once on return.
//! If recreation fails the session is discarded and the pool shrinks, never
//! below one.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use kova_common::{internal, tracing};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{ConnectionManager, Session, Transport};
use crate::{Delivery, MailError, OutboundMessage};

/// Idle sessions quieter than this are reused without a NOOP probe.
const PROBE_AFTER: Duration = Duration::from_secs(30);

/// Exclusive use of one session until handed back.
///
/// Dropping a lease without [`ConnectionPool::put`] closes the session and
/// frees the slot; the next lease opens a fresh one.
#[derive(Debug)]
pub struct PooledSession {
    session: Session,
    permit: OwnedSemaphorePermit,
}

impl PooledSession {
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub const fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

pub struct ConnectionPool {
    manager: Arc<ConnectionManager>,
    idle: parking_lot::Mutex<VecDeque<Session>>,
    permits: Arc<Semaphore>,
    /// Current number of permits; drops when broken sessions cannot be replaced
    capacity: AtomicUsize,
    started: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let size = manager.config().pool_size.max(1);
        Self {
            manager,
            idle: parking_lot::Mutex::new(VecDeque::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            capacity: AtomicUsize::new(size),
            started: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open up to `capacity` sessions ahead of time.
    ///
    /// Idempotent. Returns `true` if at least one session is ready; sessions
    /// that fail to open now are opened lazily on first use.
    pub async fn start(&self) -> bool {
        if self.manager.is_stopped() {
            return false;
        }

        let _guard = self.start_lock.lock().await;
        if self.started.load(Ordering::Acquire) {
            return true;
        }

        let wanted = self.capacity();
        let mut opened = 0usize;
        for _ in 0..wanted {
            match self.manager.open_session().await {
                Ok(session) => {
                    self.idle.lock().push_back(session);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!("Could not pre-open pooled session: {e}");
                    break;
                }
            }
        }

        if opened == 0 {
            tracing::error!("SMTP pool failed to start, no session could be opened");
            return false;
        }

        internal!(level = INFO, "SMTP pool started with {opened}/{wanted} sessions");
        self.started.store(true, Ordering::Release);
        true
    }

    /// Lease a session, waiting at most `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// - [`MailError::PoolExhausted`] when no slot frees up in time
    /// - [`MailError::Configuration`] after [`ConnectionPool::stop`]
    /// - any error from opening a new session
    pub async fn get(&self, timeout: Duration) -> Result<PooledSession, MailError> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| MailError::PoolExhausted(timeout))?
            .map_err(|_| MailError::Configuration("mailer stopped".to_string()))?;

        let quit = self.manager.config().timeouts.quit();
        let idle_timeout = self.manager.config().idle_timeout();

        loop {
            let candidate = self.idle.lock().pop_front();
            let Some(mut session) = candidate else {
                let session = self.manager.open_session().await?;
                return Ok(PooledSession { session, permit });
            };

            if !session.is_healthy() {
                continue;
            }

            if session.idle_for() > idle_timeout {
                internal!(
                    level = DEBUG,
                    "Closing session {} after {:?} idle",
                    session.id(),
                    session.idle_for()
                );
                session.close(quit).await;
                continue;
            }

            if session.idle_for() > PROBE_AFTER && !session.probe(quit).await {
                tracing::debug!(session = session.id(), "Idle session failed NOOP probe");
                continue;
            }

            return Ok(PooledSession { session, permit });
        }
    }

    /// Return a lease.
    ///
    /// Healthy sessions go back to the idle queue. A broken session is
    /// replaced by a fresh one; when that fails too, the slot is retired
    /// unless it is the last one.
    pub async fn put(&self, lease: PooledSession) {
        let PooledSession { session, permit } = lease;

        if self.manager.is_stopped() {
            session.close(self.manager.config().timeouts.quit()).await;
            return;
        }

        if session.is_healthy() {
            self.idle.lock().push_back(session);
            return;
        }

        let broken = session.id();
        drop(session);

        match self.manager.open_session().await {
            Ok(fresh) => {
                internal!(level = DEBUG, "Replaced broken session {broken} with {}", fresh.id());
                self.idle.lock().push_back(fresh);
            }
            Err(e) => {
                let shrunk = self
                    .capacity
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        current.checked_sub(1).filter(|next| *next >= 1)
                    })
                    .is_ok();

                if shrunk {
                    permit.forget();
                    tracing::warn!(
                        capacity = self.capacity(),
                        "Could not replace broken session {broken}, shrinking pool: {e}"
                    );
                } else {
                    tracing::warn!("Could not replace broken session {broken}: {e}");
                }
            }
        }
    }

    /// Lease, deliver and return.
    pub async fn send_message(&self, message: &OutboundMessage) -> Result<Delivery, MailError> {
        if self.manager.is_stopped() {
            return Err(MailError::Configuration("mailer stopped".to_string()));
        }

        let config = self.manager.config();
        let mut lease = self.get(config.pool_acquire_timeout()).await?;
        let result = lease.session_mut().deliver(message, &config.timeouts).await;
        self.put(lease).await;
        result
    }

    /// Refuse new leases and QUIT every idle session.
    ///
    /// Leased sessions are closed when they are returned.
    pub async fn stop(&self) {
        self.manager.stop().await;
        self.permits.close();

        let drained: Vec<Session> = self.idle.lock().drain(..).collect();
        let quit = self.manager.config().timeouts.quit();
        for session in drained {
            session.close(quit).await;
        }
        internal!(level = INFO, "SMTP pool stopped");
    }

    /// Slots the pool may hand out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Leases currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.capacity().saturating_sub(self.permits.available_permits())
    }
}

#[async_trait]
impl Transport for ConnectionPool {
    async fn start(&self) -> bool {
        Self::start(self).await
    }

    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, MailError> {
        self.send_message(message).await
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }
}
