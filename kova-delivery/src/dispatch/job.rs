//! The unit of dispatch work.

use std::path::PathBuf;

use kova_common::Domain;
use mailparse::MailAddr;
use serde::{Deserialize, Serialize};

use crate::MailError;

/// Which phase a job runs in.
///
/// Group jobs run concurrently first, input jobs serially after every group
/// job has resolved, bulk jobs serially last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Group,
    Input,
    Bulk,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Input => "input",
            Self::Bulk => "bulk",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file to attach, with an optional name to present instead of the file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub path: PathBuf,
    #[serde(default, rename = "filename")]
    pub display_name: Option<String>,
}

impl AttachmentSpec {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            display_name: None,
        }
    }

    #[must_use]
    pub fn named(path: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            display_name: Some(display_name.into()),
        }
    }

    /// Name shown to the recipient.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned())
        })
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailBody {
    Text(String),
    /// The dispatch report of the phases completed before this job, framed
    /// by `header` and `footer`.
    DispatchReport { header: String, footer: String },
}

impl Default for MailBody {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Importance advertised in the `X-Priority` and `Priority` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// `X-Priority` level: 1, 3 or 5.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 3,
            Self::Low => 5,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Normal => "Normal",
            Self::Low => "Low",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = MailError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Self::High),
            3 => Ok(Self::Normal),
            5 => Ok(Self::Low),
            other => Err(MailError::InvalidJob(format!(
                "priority must be 1, 3 or 5, not {other}"
            ))),
        }
    }
}

/// Headers the composer writes itself and a job may not set.
const RESERVED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "reply-to",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "x-priority",
    "priority",
];

/// One file inside a bulk archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    /// Path inside the archive, e.g. `output/Ankara.xlsx`
    pub name: String,
}

/// A zip archive assembled right before a bulk job is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSpec {
    pub file_name: String,
    pub entries: Vec<ArchiveEntry>,
}

/// Reporting context carried through the dispatch untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub destination_id: Option<String>,
    pub destination_name: Option<String>,
    /// Data categories routed to this destination (e.g. cities)
    #[serde(default)]
    pub categories: Vec<String>,
    pub row_count: Option<usize>,
    pub filename: Option<String>,
}

/// A planned email.
///
/// `kind` is fixed at construction; there is no way to move a job to another
/// phase afterwards.
#[derive(Debug, Clone)]
pub struct MailJob {
    kind: JobKind,
    recipients: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    reply_to: Option<String>,
    subject: String,
    body: MailBody,
    /// Sent as the `text/html` alternative to `body`
    html_body: Option<String>,
    priority: Option<Priority>,
    headers: Vec<(String, String)>,
    attachments: Vec<AttachmentSpec>,
    attachments_required: bool,
    archive: Option<ArchiveSpec>,
    metadata: JobMetadata,
}

impl MailJob {
    #[must_use]
    pub fn builder(kind: JobKind) -> MailJobBuilder {
        MailJobBuilder::new(kind)
    }

    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.kind
    }

    /// To recipients, validated and in submission order.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    /// Every address that receives the message over SMTP, including Bcc.
    #[must_use]
    pub fn envelope_recipients(&self) -> Vec<String> {
        self.recipients
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub const fn body(&self) -> &MailBody {
        &self.body
    }

    #[must_use]
    pub fn html_body(&self) -> Option<&str> {
        self.html_body.as_deref()
    }

    #[must_use]
    pub const fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Extra headers in the order they were added.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn attachments(&self) -> &[AttachmentSpec] {
        &self.attachments
    }

    /// Whether the job must fail when every attachment had to be skipped.
    #[must_use]
    pub const fn attachments_required(&self) -> bool {
        self.attachments_required
    }

    #[must_use]
    pub const fn archive(&self) -> Option<&ArchiveSpec> {
        self.archive.as_ref()
    }

    #[must_use]
    pub const fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    /// Domain of the first recipient, used as the throttling key.
    #[must_use]
    pub fn domain(&self) -> Option<Domain> {
        self.recipients.first().and_then(|r| Domain::of_address(r))
    }

    /// Short identification for logs and error lines.
    #[must_use]
    pub fn label(&self) -> String {
        self.metadata
            .destination_name
            .clone()
            .or_else(|| self.metadata.destination_id.clone())
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }
}

/// Builder for [`MailJob`]; validation happens in [`MailJobBuilder::build`].
#[derive(Debug, Clone)]
pub struct MailJobBuilder {
    kind: JobKind,
    recipients: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    reply_to: Option<String>,
    subject: String,
    body: MailBody,
    html_body: Option<String>,
    priority: Option<Priority>,
    headers: Vec<(String, String)>,
    attachments: Vec<AttachmentSpec>,
    attachments_required: Option<bool>,
    archive: Option<ArchiveSpec>,
    metadata: JobMetadata,
}

impl MailJobBuilder {
    fn new(kind: JobKind) -> Self {
        Self {
            kind,
            recipients: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: String::new(),
            body: MailBody::default(),
            html_body: None,
            priority: None,
            headers: Vec::new(),
            attachments: Vec::new(),
            attachments_required: None,
            archive: None,
            metadata: JobMetadata::default(),
        }
    }

    /// Adds recipients. Entries may hold several comma separated addresses.
    #[must_use]
    pub fn recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.recipients
            .extend(recipients.into_iter().map(|r| r.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipients.push(recipient.into());
        self
    }

    #[must_use]
    pub fn cc<I, S>(mut self, cc: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cc.extend(cc.into_iter().map(|r| r.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn bcc<I, S>(mut self, bcc: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.bcc.extend(bcc.into_iter().map(|r| r.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = MailBody::Text(body.into());
        self
    }

    /// Use the dispatch report of the earlier phases as the body.
    #[must_use]
    pub fn report_body(mut self, header: impl Into<String>, footer: impl Into<String>) -> Self {
        self.body = MailBody::DispatchReport {
            header: header.into(),
            footer: footer.into(),
        };
        self
    }

    #[must_use]
    pub fn mail_body(mut self, body: MailBody) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn html_body(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a custom header such as `X-Report-Id`.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn attach(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(AttachmentSpec::new(path));
        self
    }

    #[must_use]
    pub fn attachment(mut self, attachment: AttachmentSpec) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Send even if every attachment has to be skipped.
    #[must_use]
    pub const fn attachments_optional(mut self) -> Self {
        self.attachments_required = Some(false);
        self
    }

    #[must_use]
    pub fn archive(mut self, archive: ArchiveSpec) -> Self {
        self.archive = Some(archive);
        self
    }

    #[must_use]
    pub fn destination(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.metadata.destination_id = Some(id.into());
        self.metadata.destination_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata
            .categories
            .extend(categories.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn row_count(mut self, rows: usize) -> Self {
        self.metadata.row_count = Some(rows);
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.metadata.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validate recipients and freeze the job.
    ///
    /// # Errors
    ///
    /// [`MailError::InvalidJob`] when there is no valid To recipient, any
    /// address fails to parse, an archive is requested on a non-bulk job, or
    /// a custom header is malformed or one the composer writes itself.
    pub fn build(self) -> Result<MailJob, MailError> {
        let recipients = normalize_recipients(&self.recipients)?;
        if recipients.is_empty() {
            return Err(MailError::InvalidJob("job has no recipients".to_string()));
        }

        if self.archive.is_some() && self.kind != JobKind::Bulk {
            return Err(MailError::InvalidJob(format!(
                "archives are only built for bulk jobs, not {}",
                self.kind
            )));
        }

        for (name, value) in &self.headers {
            validate_header(name, value)?;
        }

        let reply_to = match self.reply_to {
            Some(address) => normalize_recipients(&[address])?.into_iter().next(),
            None => None,
        };

        let attachments_required = self
            .attachments_required
            .unwrap_or(!self.attachments.is_empty());

        Ok(MailJob {
            kind: self.kind,
            recipients,
            cc: normalize_recipients(&self.cc)?,
            bcc: normalize_recipients(&self.bcc)?,
            reply_to,
            subject: self.subject,
            body: self.body,
            html_body: self.html_body.filter(|html| !html.trim().is_empty()),
            priority: self.priority,
            headers: self.headers,
            attachments: self.attachments,
            attachments_required,
            archive: self.archive,
            metadata: self.metadata,
        })
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), MailError> {
    // RFC 5322 field names are printable ASCII without the colon
    let well_formed =
        !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':');
    if !well_formed {
        return Err(MailError::InvalidJob(format!("invalid header name '{name}'")));
    }
    if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(MailError::InvalidJob(format!("header '{name}' cannot be overridden")));
    }
    if value.contains(['\r', '\n']) {
        return Err(MailError::InvalidJob(format!("header '{name}' spans several lines")));
    }
    Ok(())
}

/// Split comma separated entries, drop blanks, and parse every address.
fn normalize_recipients(raw: &[String]) -> Result<Vec<String>, MailError> {
    let mut out = Vec::new();

    for entry in raw.iter().flat_map(|r| r.split([',', ';'])) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let parsed = mailparse::addrparse(entry)
            .map_err(|e| MailError::InvalidJob(format!("invalid recipient '{entry}': {e}")))?;

        for addr in parsed.iter() {
            let MailAddr::Single(info) = addr else {
                return Err(MailError::InvalidJob(format!(
                    "group syntax is not supported: '{entry}'"
                )));
            };
            if Domain::of_address(&info.addr).is_none() {
                return Err(MailError::InvalidJob(format!(
                    "invalid recipient '{entry}': missing domain"
                )));
            }
            out.push(info.addr.clone());
        }
    }

    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn recipients_are_split_trimmed_and_validated() {
        let job = MailJob::builder(JobKind::Group)
            .recipients(["  a@example.com, b@example.org ", "", "Ops Team <ops@example.net>"])
            .subject("Ankara")
            .build()
            .unwrap();

        assert_eq!(
            job.recipients(),
            ["a@example.com", "b@example.org", "ops@example.net"]
        );
        assert_eq!(job.domain().as_deref(), Some("example.com"));
    }

    #[test]
    fn empty_recipients_rejected() {
        let result = MailJob::builder(JobKind::Input)
            .recipients([" ", ","])
            .build();
        assert!(matches!(result, Err(MailError::InvalidJob(_))));
    }

    #[test]
    fn address_without_domain_rejected() {
        let result = MailJob::builder(JobKind::Group).recipient("nobody").build();
        assert!(matches!(result, Err(MailError::InvalidJob(_))));
    }

    #[test]
    fn archive_only_on_bulk() {
        let archive = ArchiveSpec {
            file_name: "all.zip".into(),
            entries: vec![],
        };
        let result = MailJob::builder(JobKind::Group)
            .recipient("a@example.com")
            .archive(archive.clone())
            .build();
        assert!(result.is_err());

        let job = MailJob::builder(JobKind::Bulk)
            .recipient("a@example.com")
            .archive(archive)
            .build()
            .unwrap();
        assert!(job.archive().is_some());
    }

    #[test]
    fn attachments_required_by_default_when_present() {
        let job = MailJob::builder(JobKind::Group)
            .recipient("a@example.com")
            .attach("/tmp/file.xlsx")
            .build()
            .unwrap();
        assert!(job.attachments_required());

        let job = MailJob::builder(JobKind::Group)
            .recipient("a@example.com")
            .attach("/tmp/file.xlsx")
            .attachments_optional()
            .build()
            .unwrap();
        assert!(!job.attachments_required());

        let job = MailJob::builder(JobKind::Group)
            .recipient("a@example.com")
            .build()
            .unwrap();
        assert!(!job.attachments_required());
    }

    #[test]
    fn bcc_only_in_envelope() {
        let job = MailJob::builder(JobKind::Bulk)
            .recipient("to@example.com")
            .cc(["cc@example.com"])
            .bcc(["hidden@example.com"])
            .build()
            .unwrap();
        assert_eq!(
            job.envelope_recipients(),
            ["to@example.com", "cc@example.com", "hidden@example.com"]
        );
        assert_eq!(job.cc(), ["cc@example.com"]);
    }

    #[test]
    fn custom_headers_are_validated() {
        let builder = || MailJob::builder(JobKind::Group).recipient("a@example.com");

        let job = builder()
            .header("X-Report-Id", "2026-10-16")
            .priority(Priority::High)
            .build()
            .unwrap();
        assert_eq!(job.headers(), [("X-Report-Id".to_string(), "2026-10-16".to_string())]);
        assert_eq!(job.priority(), Some(Priority::High));

        for (name, value) in [
            ("Bad Name", "x"),
            ("X-Split:", "x"),
            ("", "x"),
            ("Subject", "override"),
            ("x-priority", "1"),
            ("X-Note", "one\r\nBcc: someone@example.org"),
        ] {
            let result = builder().header(name, value).build();
            assert!(matches!(result, Err(MailError::InvalidJob(_))), "{name}: {value}");
        }
    }

    #[test]
    fn priority_levels() {
        assert_eq!(Priority::try_from(1).unwrap(), Priority::High);
        assert_eq!(Priority::try_from(5).unwrap().level(), 5);
        assert!(Priority::try_from(2).is_err());
    }

    #[test]
    fn blank_html_body_is_dropped() {
        let job = MailJob::builder(JobKind::Input)
            .recipient("a@example.com")
            .html_body("  ")
            .build()
            .unwrap();
        assert_eq!(job.html_body(), None);
    }

    #[test]
    fn attachment_display_name() {
        assert_eq!(AttachmentSpec::new("/data/output/İzmir.xlsx").file_name(), "İzmir.xlsx");
        assert_eq!(AttachmentSpec::named("/tmp/x1", "report.xlsx").file_name(), "report.xlsx");
    }
}
