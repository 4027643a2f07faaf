//! The phase state machine.
//!
//! ```text
//! Idle -> GroupPhase -> InputPhase -> BulkPhase -> Done
//! ```
//!
//! Each phase starts only after every job of the previous one has a result.
//! Group jobs run concurrently inside a [`JoinSet`], bounded by the
//! executor's global limit and the per-domain throttle. A group task hands
//! its result back over a channel before it paces, so the phase deadline can
//! only cancel work that has not finished sending. Input and bulk jobs
//! run one at a time. Results land in slots reserved by submission index, so
//! `results[i]` always belongs to `jobs[i]`.

use std::{panic::AssertUnwindSafe, path::PathBuf, sync::Arc, time::Duration};

use futures_util::FutureExt;
use kova_common::{internal, tracing};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinSet, time::Instant};

use crate::{
    DomainThrottle, JobKind, MailBody, MailError, MailJob, MailerConfig, ReportContext,
    ResultAccountant, SendExecutor, SendOutcome, SendRequest, SendResult, build_archive,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    Idle,
    GroupPhase,
    InputPhase,
    BulkPhase,
    Done,
}

pub struct Dispatcher {
    executor: Arc<SendExecutor>,
    throttle: Arc<DomainThrottle>,
    accountant: ResultAccountant,
    group_phase_timeout: Duration,
    group_send_delay: Duration,
    temp_dir: PathBuf,
    state: parking_lot::Mutex<DispatchState>,
    /// One batch at a time
    batch_lock: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(executor: Arc<SendExecutor>, config: &MailerConfig) -> Self {
        Self {
            executor,
            throttle: Arc::new(DomainThrottle::new(config.per_domain_concurrency)),
            accountant: ResultAccountant::default(),
            group_phase_timeout: config.group_phase_timeout(),
            group_send_delay: config.group_send_delay(),
            temp_dir: config.temp_dir.clone(),
            state: parking_lot::Mutex::new(DispatchState::Idle),
            batch_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_accountant(mut self, accountant: ResultAccountant) -> Self {
        self.accountant = accountant;
        self
    }

    #[must_use]
    pub const fn accountant(&self) -> &ResultAccountant {
        &self.accountant
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        *self.state.lock()
    }

    fn enter(&self, state: DispatchState) {
        internal!(level = DEBUG, "Dispatch state -> {state:?}");
        *self.state.lock() = state;
    }

    /// Run a batch to completion.
    ///
    /// Always returns exactly `jobs.len()` results with `results[i].job_index == i`.
    /// No send failure escapes as anything other than a failed result.
    pub async fn run(&self, jobs: Arc<[MailJob]>, context: &ReportContext) -> Vec<SendResult> {
        let _batch = self.batch_lock.lock().await;
        let mut slots: Vec<Option<SendResult>> = vec![None; jobs.len()];

        let indices_of = |kind: JobKind| -> Vec<usize> {
            jobs.iter()
                .enumerate()
                .filter(|(_, job)| job.kind() == kind)
                .map(|(index, _)| index)
                .collect()
        };
        let groups = indices_of(JobKind::Group);
        let inputs = indices_of(JobKind::Input);
        let bulks = indices_of(JobKind::Bulk);

        internal!(
            level = INFO,
            "Dispatching {} jobs: {} group, {} input, {} bulk",
            jobs.len(),
            groups.len(),
            inputs.len(),
            bulks.len()
        );

        self.enter(DispatchState::GroupPhase);
        self.run_group_phase(&jobs, &groups, &mut slots).await;

        self.enter(DispatchState::InputPhase);
        for &index in &inputs {
            let result = self.run_serial(&jobs, index, &slots, context).await;
            slots[index] = Some(result);
        }

        self.enter(DispatchState::BulkPhase);
        for &index in &bulks {
            let result = self.run_serial(&jobs, index, &slots, context).await;
            slots[index] = Some(result);
        }

        self.enter(DispatchState::Done);

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    SendResult::failed_with(index, &jobs[index], "job was not executed", 0)
                })
            })
            .collect()
    }

    async fn run_group_phase(
        &self,
        jobs: &Arc<[MailJob]>,
        indices: &[usize],
        slots: &mut [Option<SendResult>],
    ) {
        if indices.is_empty() {
            return;
        }

        let (done, mut finished) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();
        for &index in indices {
            let jobs = Arc::clone(jobs);
            let executor = Arc::clone(&self.executor);
            let throttle = Arc::clone(&self.throttle);
            let delay = self.group_send_delay;
            let done = done.clone();

            set.spawn(async move {
                let job = &jobs[index];
                let _slot = throttle.acquire(job.domain().as_ref()).await;
                let result = send_guarded(&executor, index, job, SendRequest::new(job)).await;
                // The receiver only goes away once the phase is over
                let _ = done.send((index, result));
                // Pace the domain while still holding its slot
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            });
        }
        drop(done);

        let deadline = Instant::now() + self.group_phase_timeout;
        let mut timed_out = false;
        let mut received = 0;

        while received < indices.len() {
            match tokio::time::timeout_at(deadline, finished.recv()).await {
                Ok(Some((index, result))) => {
                    slots[index] = Some(result);
                    received += 1;
                }
                // Every task has ended, some without reporting
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tracing::warn!(
                        pending = indices.len() - received,
                        "Group phase exceeded {:?}, cancelling remaining sends",
                        self.group_phase_timeout
                    );
                    break;
                }
            }
        }

        // Only pacing sleeps and unfinished sends remain
        set.abort_all();
        while let Some(joined) = set.join_next().await {
            match joined {
                Err(e) if e.is_panic() => tracing::error!("Group send task failed: {e}"),
                _ => {}
            }
        }
        while let Ok((index, result)) = finished.try_recv() {
            slots[index] = Some(result);
        }

        for &index in indices {
            if slots[index].is_some() {
                continue;
            }
            let error = if timed_out {
                MailError::timeout("group phase", self.group_phase_timeout)
            } else {
                MailError::Internal("group send task failed".to_string())
            };
            slots[index] = Some(SendResult::failure(index, &jobs[index], &error, 0));
        }

        let sent = indices
            .iter()
            .filter(|&&i| slots[i].as_ref().is_some_and(|r| r.success))
            .count();
        internal!(
            level = INFO,
            "Group phase finished: {sent} sent, {} failed",
            indices.len() - sent
        );
    }

    /// Send one input or bulk job, rendering a report body and building its
    /// archive first when asked to.
    async fn run_serial(
        &self,
        jobs: &Arc<[MailJob]>,
        index: usize,
        slots: &[Option<SendResult>],
        context: &ReportContext,
    ) -> SendResult {
        let job = &jobs[index];
        let mut request = SendRequest::new(job);

        if let MailBody::DispatchReport { header, footer } = job.body() {
            let completed: Vec<SendResult> = slots.iter().flatten().cloned().collect();
            let report = self.accountant.report(jobs, &completed, context);
            let body = [header.as_str(), report.text.as_str(), footer.as_str()]
                .into_iter()
                .filter(|part| !part.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            request = request.with_body(body);
        }

        let archive = match job.archive() {
            Some(spec) => match build_archive(spec, &self.temp_dir).await {
                Ok(archive) => Some(archive),
                Err(e) => {
                    tracing::error!(job = %job.label(), "Bulk archive failed: {e}");
                    return SendResult::failure(index, job, &e, 0);
                }
            },
            None => None,
        };

        if let Some(archive) = &archive {
            request = request.with_attachment(archive.attachment());
        }

        let result = send_guarded(&self.executor, index, job, request).await;

        if let Some(archive) = archive {
            archive.remove().await;
        }
        result
    }
}

/// Run one send, turning a panic inside it into a failed result.
async fn send_guarded(
    executor: &SendExecutor,
    index: usize,
    job: &MailJob,
    request: SendRequest<'_>,
) -> SendResult {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(executor.execute(request))
        .catch_unwind()
        .await;
    let finished = Instant::now();

    let result = match outcome {
        Ok(SendOutcome {
            result: Ok(delivery),
            attempts,
        }) => SendResult::success(index, job, attempts).with_refused(delivery.refused),
        Ok(SendOutcome {
            result: Err(e),
            attempts,
        }) => SendResult::failure(index, job, &e, attempts),
        Err(_) => {
            tracing::error!(job = %job.label(), "Send panicked");
            SendResult::failed_with(index, job, "send panicked", 0)
        }
    };
    result.timed(started, finished)
}
