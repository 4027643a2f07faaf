//! Shared configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A recipient the relay refused at RCPT while the rest of the envelope was
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefusedRecipient {
    pub address: String,
    /// Reply code and text, e.g. `550 5.1.1 No such user`
    pub reply: String,
}

/// What the relay accepted for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Empty when every envelope recipient was accepted
    pub refused: Vec<RefusedRecipient>,
}

impl Delivery {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.refused.is_empty()
    }
}

/// SMTP operation timeout configuration
///
/// Every network operation is bounded so a hung socket turns into a failed
/// send instead of stalling the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect, TLS handshake, greeting and EHLO/STARTTLS
    ///
    /// Default: 20 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// AUTH exchange
    ///
    /// Default: 20 seconds
    #[serde(default = "default_login_timeout")]
    pub login_secs: u64,

    /// One complete MAIL/RCPT/DATA transaction
    ///
    /// Default: 20 seconds
    #[serde(default = "default_send_timeout")]
    pub send_secs: u64,

    /// QUIT during teardown
    ///
    /// Default: 5 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            login_secs: default_login_timeout(),
            send_secs: default_send_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn login(&self) -> Duration {
        Duration::from_secs(self.login_secs)
    }

    #[must_use]
    pub const fn send(&self) -> Duration {
        Duration::from_secs(self.send_secs)
    }

    #[must_use]
    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

const fn default_connect_timeout() -> u64 {
    20
}

const fn default_login_timeout() -> u64 {
    20
}

const fn default_send_timeout() -> u64 {
    20
}

const fn default_quit_timeout() -> u64 {
    5
}
