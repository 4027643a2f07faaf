//! SMTP session lifecycle.
//!
//! [`ConnectionManager`] knows how to open an authenticated [`Session`] and
//! keeps one persistent session for callers that want a single connection.
//! [`ConnectionPool`] keeps several sessions and hands them out one caller at
//! a time. Both implement [`Transport`], which is all the executor sees.

mod manager;
mod pool;
mod session;

use async_trait::async_trait;
pub use manager::ConnectionManager;
pub use pool::{ConnectionPool, PooledSession};
pub use session::Session;

use crate::{Delivery, MailError, OutboundMessage};

/// Something that can deliver composed messages to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make sure at least one session can be established.
    ///
    /// Idempotent. Returns `false` when no connection could be made.
    async fn start(&self) -> bool;

    /// Deliver one message. Errors are returned, never panicked.
    ///
    /// Success means the relay took the message for at least one recipient;
    /// the returned [`Delivery`] lists the ones it refused.
    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, MailError>;

    /// Close every session. Later sends fail.
    async fn stop(&self);
}
