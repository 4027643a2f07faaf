//! Types and helpers shared by every kova crate.

pub mod domain;
pub mod logging;
pub mod tls;

pub use domain::Domain;
pub use tls::TlsPolicy;
pub use tracing;
