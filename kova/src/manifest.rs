//! JSON job manifests.
//!
//! A manifest is either a bare array of jobs or an object with a `jobs` array
//! and an optional report `context`:
//!
//! ```json
//! {
//!   "context": { "title": "Weekly split", "unmatched_categories": ["Kars"] },
//!   "jobs": [
//!     { "kind": "group", "destination_id": "g1", "destination_name": "Central",
//!       "recipients": "a@example.org, b@example.org", "subject": "Your rows",
//!       "body": "See attached.", "attachments": [{ "path": "output/Central.xlsx" }],
//!       "categories": ["Ankara"], "row_count": 120 },
//!     { "kind": "bulk", "subject": "Summary", "priority": "high",
//!       "html_body": "<p>Summary</p>", "headers": { "X-Batch": "42" },
//!       "report": { "header": "Hello,", "footer": "Regards" } }
//!   ]
//! }
//! ```
//!
//! `priority` is `high`, `normal`, `low` or the matching `X-Priority` level
//! (1, 3, 5). Relative paths resolve against the manifest's directory. Input and bulk
//! jobs without recipients go to `input_email` and `personal_email`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use kova_delivery::{
    ArchiveSpec, AttachmentSpec, JobKind, MailError, MailJob, Priority, ReportContext,
};
use serde::Deserialize;
use thiserror::Error;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Job {index} ({kind}) has no recipients and no default is configured")]
    NoRecipient { index: usize, kind: JobKind },

    #[error("Job {index}: {source}")]
    Job { index: usize, source: MailError },
}

/// A parsed manifest, ready to dispatch.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub jobs: Vec<MailJob>,
    pub context: ReportContext,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestRepr {
    Bare(Vec<JobEntry>),
    Full {
        #[serde(default)]
        context: ReportContext,
        jobs: Vec<JobEntry>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Addresses {
    One(String),
    Many(Vec<String>),
}

impl Default for Addresses {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Addresses {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(address) => vec![address],
            Self::Many(addresses) => addresses,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(u8),
    Named(Priority),
}

impl PriorityRepr {
    fn into_priority(self) -> Result<Priority, MailError> {
        match self {
            Self::Level(level) => Priority::try_from(level),
            Self::Named(priority) => Ok(priority),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReportFrame {
    #[serde(default)]
    header: String,
    #[serde(default)]
    footer: String,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    kind: JobKind,
    #[serde(default)]
    destination_id: Option<String>,
    #[serde(default)]
    destination_name: Option<String>,
    #[serde(default)]
    recipients: Addresses,
    #[serde(default)]
    cc: Addresses,
    #[serde(default)]
    bcc: Addresses,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    report: Option<ReportFrame>,
    #[serde(default)]
    html_body: Option<String>,
    #[serde(default)]
    priority: Option<PriorityRepr>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    attachments: Vec<AttachmentSpec>,
    /// Send even when every attachment had to be skipped
    #[serde(default)]
    attachments_optional: bool,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    row_count: Option<usize>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    archive: Option<ArchiveSpec>,
}

impl Manifest {
    pub fn load(path: &Path, settings: &Settings) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base, settings)
    }

    pub fn parse(text: &str, base: &Path, settings: &Settings) -> Result<Self, ManifestError> {
        let (context, entries) = match serde_json::from_str(text)? {
            ManifestRepr::Bare(jobs) => (ReportContext::default(), jobs),
            ManifestRepr::Full { context, jobs } => (context, jobs),
        };

        let jobs = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.into_job(index, base, settings))
            .collect::<Result<_, _>>()?;

        Ok(Self { jobs, context })
    }
}

impl JobEntry {
    fn into_job(
        self,
        index: usize,
        base: &Path,
        settings: &Settings,
    ) -> Result<MailJob, ManifestError> {
        let mut recipients = self.recipients.into_vec();
        if recipients.iter().all(|r| r.trim().is_empty()) {
            let fallback = match self.kind {
                JobKind::Input => settings.input_email.clone(),
                JobKind::Bulk => settings.personal_email.clone(),
                JobKind::Group => None,
            };
            recipients = vec![fallback.ok_or(ManifestError::NoRecipient {
                index,
                kind: self.kind,
            })?];
        }

        let mut builder = MailJob::builder(self.kind)
            .recipients(recipients)
            .cc(self.cc.into_vec())
            .bcc(self.bcc.into_vec())
            .subject(self.subject)
            .categories(self.categories);

        builder = match (self.report, self.body) {
            (Some(frame), _) => builder.report_body(frame.header, frame.footer),
            (None, Some(body)) => builder.body(body),
            (None, None) => builder,
        };

        if let Some(reply_to) = self.reply_to {
            builder = builder.reply_to(reply_to);
        }
        if let Some(html) = self.html_body {
            builder = builder.html_body(html);
        }
        if let Some(priority) = self.priority {
            let priority = priority
                .into_priority()
                .map_err(|source| ManifestError::Job { index, source })?;
            builder = builder.priority(priority);
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        for mut attachment in self.attachments {
            attachment.path = base.join(attachment.path);
            builder = builder.attachment(attachment);
        }
        if self.attachments_optional {
            builder = builder.attachments_optional();
        }
        if let Some(mut archive) = self.archive {
            for entry in &mut archive.entries {
                entry.path = base.join(&entry.path);
            }
            builder = builder.archive(archive);
        }

        if self.destination_id.is_some() || self.destination_name.is_some() {
            let id = self
                .destination_id
                .clone()
                .or_else(|| self.destination_name.clone())
                .unwrap_or_default();
            let name = self.destination_name.unwrap_or_else(|| id.clone());
            builder = builder.destination(id, name);
        }
        if let Some(rows) = self.row_count {
            builder = builder.row_count(rows);
        }
        if let Some(filename) = self.filename {
            builder = builder.filename(filename);
        }

        builder
            .build()
            .map_err(|source| ManifestError::Job { index, source })
    }
}
