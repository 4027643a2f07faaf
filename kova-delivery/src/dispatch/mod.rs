//! Batches of mail jobs and the phase orchestrator that runs them.

mod job;
mod orchestrator;
mod result;

pub use job::{
    ArchiveEntry, ArchiveSpec, AttachmentSpec, JobKind, JobMetadata, MailBody, MailJob,
    MailJobBuilder, Priority,
};
pub use orchestrator::{DispatchState, Dispatcher};
pub use result::SendResult;
