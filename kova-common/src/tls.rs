//! Transport security policy for outbound SMTP sessions.

use serde::{Deserialize, Serialize};

/// How a session secures its channel when the port does not imply TLS.
///
/// Port 465 always speaks TLS from the first byte regardless of this policy,
/// unless the policy is [`TlsPolicy::Disabled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Upgrade via STARTTLS, fail the session if the upgrade is unavailable.
    ///
    /// Credentials are never sent over a plaintext channel under this policy.
    #[default]
    Required,

    /// Upgrade via STARTTLS when advertised, otherwise continue in plaintext.
    ///
    /// A failed upgrade reconnects and proceeds without TLS (RFC 3207 Section 4.1).
    Opportunistic,

    /// Never negotiate TLS. Only meant for local relays and tests.
    Disabled,
}

impl TlsPolicy {
    /// Whether a failed or missing STARTTLS must abort the session.
    #[must_use]
    pub const fn is_required(self) -> bool {
        matches!(self, Self::Required)
    }

    #[must_use]
    pub const fn is_disabled(self) -> bool {
        matches!(self, Self::Disabled)
    }
}

impl std::fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Required => "required",
            Self::Opportunistic => "opportunistic",
            Self::Disabled => "disabled",
        })
    }
}
