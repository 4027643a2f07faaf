//! Typed errors for mail dispatch.
//!
//! Every send primitive returns `Result<_, MailError>`. The orchestrator turns
//! each error into a failed `SendResult`; only configuration errors are fatal,
//! and only at construction time.

use std::{path::PathBuf, time::Duration};

use kova_smtp::client::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    /// Missing host or credentials, or an unusable setting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or protocol failure on an established or establishing session.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The relay refused the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Every configured port and attempt failed.
    #[error("Mailer cannot connect")]
    CannotConnect,

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    /// A network operation or the whole group phase ran past its budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The circuit breaker is refusing sends.
    #[error("Circuit breaker open, sends refused for another {remaining:?}")]
    CircuitOpen { remaining: Duration },

    /// No pooled session freed up in time.
    #[error("No SMTP session available within {0:?}")]
    PoolExhausted(Duration),

    /// 5xx reply; retrying will not help.
    #[error("Rejected by server: {code} {message}")]
    Rejected { code: u16, message: String },

    /// 4xx reply.
    #[error("Temporary server failure: {code} {message}")]
    Temporary { code: u16, message: String },

    /// The bulk archive could not be produced.
    #[error("Archive build failed: {0}")]
    Archive(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The batch was interrupted before this send started.
    #[error("Dispatch interrupted")]
    Interrupted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Problems with a single attachment.
///
/// `Missing`, `Oversized` and `Read` only ever cause the attachment to be
/// skipped. `NoValidAttachments` fails the job.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Attachment {} is {size} bytes, limit is {limit} bytes", path.display())]
    Oversized { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to read attachment {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    #[error("No valid attachments")]
    NoValidAttachments,
}

impl MailError {
    /// Errors that will fail the same way on every attempt.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Attachment(_)
                | Self::Rejected { .. }
                | Self::Archive(_)
                | Self::InvalidJob(_)
                | Self::Interrupted
        )
    }

    /// Failures that say something about the health of the relay and feed
    /// the circuit breaker.
    #[must_use]
    pub const fn counts_against_circuit(&self) -> bool {
        !self.is_permanent() && !matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the session that produced this error can still be used.
    ///
    /// A 5xx rejection of one transaction leaves the session intact.
    #[must_use]
    pub const fn session_survives(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Attachment(_) | Self::InvalidJob(_))
    }

    pub(crate) const fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }
}

/// Classifies client errors by SMTP reply class.
///
/// - 4xx replies are temporary
/// - 5xx replies are permanent rejections
/// - credential refusals are authentication failures
/// - I/O, TLS and protocol desyncs are connection failures
impl From<ClientError> for MailError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::AuthenticationFailed { code, message } => {
                Self::Authentication(format!("{code} {message}"))
            }
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Temporary { code, message }
            }
            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Rejected { code, message }
            }
            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => {
                Self::Connection(format!("unexpected reply {code} {message}"))
            }
            ClientError::Io(e) => Self::Connection(format!("I/O error: {e}")),
            ClientError::ConnectionClosed => Self::Connection("connection closed".to_string()),
            ClientError::TlsError(e) => Self::Connection(format!("TLS error: {e}")),
            ClientError::ParseError(e) => Self::Connection(format!("protocol error: {e}")),
            ClientError::Utf8Error(e) => Self::Connection(format!("protocol error: {e}")),
            ClientError::BuilderError(e) => Self::InvalidJob(e),
        }
    }
}
