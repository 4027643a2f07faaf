//! Per-domain concurrency limits for the group phase.
//!
//! Each recipient domain gets its own semaphore so that a provider that
//! throttles us (one slow domain) only stalls its own destinations while the
//! global send limit keeps serving everyone else.

use std::sync::Arc;

use dashmap::DashMap;
use kova_common::{Domain, tracing};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct DomainThrottle {
    /// Concurrent sends allowed per domain, `0` means unlimited
    limit: usize,
    slots: DashMap<Domain, Arc<Semaphore>>,
}

impl DomainThrottle {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            slots: DashMap::new(),
        }
    }

    fn semaphore(&self, domain: &Domain) -> Arc<Semaphore> {
        self.slots
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limit)))
            .clone()
    }

    /// Wait for a slot on `domain`.
    ///
    /// Returns `None` when throttling is disabled or no domain is known; the
    /// caller proceeds immediately in that case.
    pub async fn acquire(&self, domain: Option<&Domain>) -> Option<OwnedSemaphorePermit> {
        if self.limit == 0 {
            return None;
        }
        let domain = domain?;

        let semaphore = self.semaphore(domain);
        if semaphore.available_permits() == 0 {
            tracing::debug!(domain = %domain, limit = self.limit, "Waiting for domain slot");
        }
        semaphore.acquire_owned().await.ok()
    }

    /// Slots currently free for `domain`.
    #[must_use]
    pub fn available(&self, domain: &Domain) -> usize {
        self.slots
            .get(domain)
            .map_or(self.limit, |semaphore| semaphore.available_permits())
    }
}
