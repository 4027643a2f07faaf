//! Mail dispatch for kova.
//!
//! A batch of [`MailJob`]s is handed to the [`Mailer`], which runs it through
//! three strictly ordered phases (group, input, bulk). Every send goes through
//! the [`SendExecutor`], which owns retries and consults the
//! [`CircuitBreaker`] before touching the network. Sessions come from a
//! [`ConnectionPool`] layered on a [`ConnectionManager`]. The
//! [`ResultAccountant`] turns the index-stable result array into statistics
//! and a bounded, human readable report.

mod archive;
mod circuit_breaker;
mod config;
mod connection;
mod dispatch;
mod error;
mod executor;
mod mailer;
mod message;
pub mod policy;
mod report;
mod throttle;
mod types;

pub use archive::{BuiltArchive, build_archive};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::MailerConfig;
pub use connection::{ConnectionManager, ConnectionPool, PooledSession, Session, Transport};
pub use dispatch::{
    ArchiveEntry, ArchiveSpec, AttachmentSpec, DispatchState, Dispatcher, JobKind, JobMetadata,
    MailBody, MailJob, MailJobBuilder, Priority, SendResult,
};
pub use error::{AttachmentError, MailError};
pub use executor::{SendExecutor, SendOutcome, SendRequest};
pub use mailer::{DispatchOutcome, Mailer, MailerStats};
pub use message::{Composer, OutboundMessage};
pub use policy::RetryPolicy;
pub use report::{
    DestinationSummary, DispatchReport, DispatchStats, PhaseStats, ReportContext,
    ResultAccountant,
};
pub use throttle::DomainThrottle;
pub use types::{Delivery, RefusedRecipient, SmtpTimeouts};
