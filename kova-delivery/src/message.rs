//! Turns a [`MailJob`] into wire-ready message content.
//!
//! Attachments are checked one by one. A missing, unreadable or oversized
//! file is skipped with a warning and never truncated; the job only fails
//! when attachments were required and none survived.

use std::path::Path;

use kova_common::tracing;
use kova_smtp::client::{MessageBuilder, guess_content_type};

use crate::{AttachmentError, AttachmentSpec, MailError, MailJob, MailerConfig};

/// A composed message plus its SMTP envelope.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub sender: String,
    /// Envelope recipients, Bcc included
    pub recipients: Vec<String>,
    /// RFC 5322 message, CRLF line endings
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct Composer {
    sender: String,
    from_name: Option<String>,
    max_attachment_bytes: u64,
}

impl Composer {
    #[must_use]
    pub fn new(config: &MailerConfig) -> Self {
        Self {
            sender: config.sender().to_string(),
            from_name: config.from_name.clone(),
            max_attachment_bytes: config.max_attachment_bytes(),
        }
    }

    /// Build the message for `job` with `body` as text and `extra`
    /// attachments (such as a freshly built archive) after the job's own.
    ///
    /// # Errors
    ///
    /// [`AttachmentError::NoValidAttachments`] when attachments were required
    /// and every one was skipped.
    pub async fn compose(
        &self,
        job: &MailJob,
        body: &str,
        extra: &[AttachmentSpec],
    ) -> Result<OutboundMessage, MailError> {
        let mut builder = MessageBuilder::new()
            .from(self.sender.as_str())
            .to_multiple(job.recipients())
            .cc_multiple(job.cc())
            .subject(job.subject())
            .body(body);

        if let Some(html) = job.html_body() {
            builder = builder.html_body(html);
        }
        if let Some(name) = &self.from_name {
            builder = builder.from_name(name.as_str());
        }
        if let Some(reply_to) = job.reply_to() {
            builder = builder.reply_to(reply_to);
        }
        if let Some(priority) = job.priority() {
            builder = builder
                .header("X-Priority", priority.level().to_string())
                .header("Priority", priority.as_str());
        }
        builder = builder.header("X-Mailer", "kova");
        for (name, value) in job.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let requested = job.attachments().len() + extra.len();
        let mut attached = 0usize;

        for spec in job.attachments().iter().chain(extra) {
            match self.load(spec).await {
                Ok(data) => {
                    let name = spec.file_name();
                    builder = builder.attach(name.as_str(), content_type_for(spec, &name), data);
                    attached += 1;
                }
                Err(e) => {
                    tracing::warn!(job = %job.label(), "Skipping attachment: {e}");
                }
            }
        }

        let required = job.attachments_required() || !extra.is_empty();
        if requested > 0 && attached == 0 && required {
            return Err(AttachmentError::NoValidAttachments.into());
        }

        Ok(OutboundMessage {
            sender: self.sender.clone(),
            recipients: job.envelope_recipients(),
            content: builder.build()?,
        })
    }

    async fn load(&self, spec: &AttachmentSpec) -> Result<Vec<u8>, AttachmentError> {
        let path = &spec.path;
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(AttachmentError::Missing(path.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AttachmentError::Missing(path.clone()));
            }
            Err(e) => {
                return Err(AttachmentError::Read {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if metadata.len() > self.max_attachment_bytes {
            return Err(AttachmentError::Oversized {
                path: path.clone(),
                size: metadata.len(),
                limit: self.max_attachment_bytes,
            });
        }

        tokio::fs::read(path)
            .await
            .map_err(|e| AttachmentError::Read {
                path: path.clone(),
                reason: e.to_string(),
            })
    }
}

/// Prefer the displayed name's extension, fall back to the file on disk.
fn content_type_for(spec: &AttachmentSpec, name: &str) -> &'static str {
    match guess_content_type(Path::new(name)) {
        "application/octet-stream" => guess_content_type(&spec.path),
        known => known,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{JobKind, Priority};

    fn composer(limit_mb: u64) -> Composer {
        Composer {
            sender: "bot@example.com".to_string(),
            from_name: Some("Dağıtım".to_string()),
            max_attachment_bytes: limit_mb * 1024 * 1024,
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![b'x'; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn oversized_attachment_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let small = write_file(&dir, "Ankara.xlsx", 128);
        let big = write_file(&dir, "huge.xlsx", 1024 * 1024 + 1);

        let job = MailJob::builder(JobKind::Group)
            .recipient("ankara@example.com")
            .subject("Ankara")
            .body("rows attached")
            .attach(&small)
            .attach(&big)
            .build()
            .unwrap();

        let message = composer(1).compose(&job, "rows attached", &[]).await.unwrap();
        assert!(message.content.contains("Ankara.xlsx"));
        assert!(!message.content.contains("huge.xlsx"));
        assert_eq!(message.recipients, vec!["ankara@example.com"]);
    }

    #[tokio::test]
    async fn only_attachment_oversized_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_file(&dir, "huge.xlsx", 1024 * 1024 + 1);

        let job = MailJob::builder(JobKind::Group)
            .recipient("ankara@example.com")
            .attach(&big)
            .build()
            .unwrap();

        let err = composer(1).compose(&job, "", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            MailError::Attachment(AttachmentError::NoValidAttachments)
        ));
    }

    #[tokio::test]
    async fn missing_attachment_on_optional_job_still_sends() {
        let dir = tempfile::tempdir().unwrap();
        let job = MailJob::builder(JobKind::Input)
            .recipient("input@example.com")
            .attach(dir.path().join("gone.xlsx"))
            .attachments_optional()
            .build()
            .unwrap();

        let message = composer(25).compose(&job, "hello", &[]).await.unwrap();
        assert!(!message.content.contains("multipart/mixed"));
    }

    #[tokio::test]
    async fn html_priority_and_custom_headers_rendered() {
        let job = MailJob::builder(JobKind::Group)
            .recipient("izmir@example.com")
            .subject("İzmir")
            .html_body("<table><tr><td>İzmir</td></tr></table>")
            .priority(Priority::High)
            .header("X-Report-Id", "batch-42")
            .header("X-Region", "Ege Bölgesi")
            .build()
            .unwrap();

        let message = composer(25).compose(&job, "rows attached", &[]).await.unwrap();
        let parsed = mailparse::parse_mail(message.content.as_bytes()).unwrap();
        let header = |name: &str| {
            parsed
                .headers
                .iter()
                .find(|h| h.get_key() == name)
                .map(mailparse::MailHeader::get_value)
        };

        assert_eq!(header("X-Priority").as_deref(), Some("1"));
        assert_eq!(header("Priority").as_deref(), Some("High"));
        assert_eq!(header("X-Mailer").as_deref(), Some("kova"));
        assert_eq!(header("X-Report-Id").as_deref(), Some("batch-42"));
        assert_eq!(header("X-Region").as_deref(), Some("Ege Bölgesi"));

        assert_eq!(parsed.ctype.mimetype, "multipart/alternative");
        assert_eq!(parsed.subparts[0].get_body().unwrap(), "rows attached");
        assert_eq!(parsed.subparts[1].ctype.mimetype, "text/html");
        assert_eq!(
            parsed.subparts[1].get_body().unwrap(),
            "<table><tr><td>İzmir</td></tr></table>"
        );
    }

    #[tokio::test]
    async fn plain_job_has_no_priority_headers() {
        let job = MailJob::builder(JobKind::Input)
            .recipient("input@example.com")
            .build()
            .unwrap();

        let message = composer(25).compose(&job, "hello", &[]).await.unwrap();
        assert!(!message.content.contains("X-Priority"));
        assert!(message.content.contains("Content-Type: text/plain"));
    }

    #[tokio::test]
    async fn extra_attachments_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_file(&dir, "01J0ARCHIVE-all.zip", 64);

        let job = MailJob::builder(JobKind::Bulk)
            .recipient("me@example.com")
            .build()
            .unwrap();

        let message = composer(25)
            .compose(&job, "report", &[AttachmentSpec::named(&archive, "all.zip")])
            .await
            .unwrap();
        assert!(message.content.contains("filename=\"all.zip\""));
        assert!(message.content.contains("application/zip"));
        assert!(message.content.contains("From: =?UTF-8?B?"));
    }
}
