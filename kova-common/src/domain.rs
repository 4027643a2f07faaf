//! Recipient domain newtype.
//!
//! Used as the key for per-domain throttling so that a rate limit imposed by
//! one receiving provider does not stall unrelated destinations.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lowercase domain name.
///
/// ```
/// use kova_common::Domain;
///
/// let domain = Domain::of_address("Ops@Example.COM");
/// assert_eq!(domain.map(|d| d.to_string()), Some("example.com".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(s: &str) -> Self {
        Self(Arc::from(s.trim().to_ascii_lowercase()))
    }

    /// Extract the domain part of an email address.
    ///
    /// Returns `None` when the address has no `@` or an empty domain part.
    #[must_use]
    pub fn of_address(address: &str) -> Option<Self> {
        let (_, domain) = address.trim().trim_end_matches('>').rsplit_once('@')?;
        (!domain.is_empty()).then(|| Self::new(domain))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
