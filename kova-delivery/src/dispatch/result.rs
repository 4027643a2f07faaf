use serde::Serialize;
use tokio::time::Instant;

use crate::{JobKind, MailError, MailJob, RefusedRecipient};

/// Outcome of one job.
///
/// `job_index` is the job's position in the submitted batch. `error` is set
/// exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub job_index: usize,
    pub kind: JobKind,
    pub success: bool,
    pub error: Option<String>,
    pub recipients: Vec<String>,
    pub destination_id: Option<String>,
    pub destination_name: Option<String>,
    /// Transport attempts made, `0` when the send never reached the network
    pub attempts: u32,
    /// Envelope recipients the relay refused on an otherwise successful send
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub refused: Vec<RefusedRecipient>,
    #[serde(skip)]
    pub started_at: Option<Instant>,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl SendResult {
    fn for_job(job_index: usize, job: &MailJob) -> Self {
        let metadata = job.metadata();
        Self {
            job_index,
            kind: job.kind(),
            success: false,
            error: None,
            recipients: job.recipients().to_vec(),
            destination_id: metadata.destination_id.clone(),
            destination_name: metadata.destination_name.clone(),
            attempts: 0,
            refused: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn success(job_index: usize, job: &MailJob, attempts: u32) -> Self {
        Self {
            success: true,
            attempts,
            ..Self::for_job(job_index, job)
        }
    }

    #[must_use]
    pub fn failure(job_index: usize, job: &MailJob, error: &MailError, attempts: u32) -> Self {
        Self::failed_with(job_index, job, error.to_string(), attempts)
    }

    #[must_use]
    pub fn failed_with(
        job_index: usize,
        job: &MailJob,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            error: Some(error.into()),
            attempts,
            ..Self::for_job(job_index, job)
        }
    }

    #[must_use]
    pub fn with_refused(mut self, refused: Vec<RefusedRecipient>) -> Self {
        self.refused = refused;
        self
    }

    /// `To` recipients the relay accepted. Empty for a failed send.
    pub fn accepted_recipients(&self) -> impl Iterator<Item = &str> {
        self.recipients
            .iter()
            .filter(|recipient| {
                self.success
                    && !self
                        .refused
                        .iter()
                        .any(|refused| refused.address.eq_ignore_ascii_case(recipient))
            })
            .map(String::as_str)
    }

    #[must_use]
    pub(crate) fn timed(mut self, started_at: Instant, finished_at: Instant) -> Self {
        self.started_at = Some(started_at);
        self.finished_at = Some(finished_at);
        self
    }

    /// Name used in reports, falling back to the destination id and then
    /// the first recipient.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.destination_name
            .clone()
            .or_else(|| self.destination_id.clone())
            .or_else(|| self.recipients.first().cloned())
            .unwrap_or_else(|| format!("job-{}", self.job_index))
    }
}
