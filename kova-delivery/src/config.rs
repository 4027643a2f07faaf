//! Mailer configuration.

use std::{path::PathBuf, time::Duration};

use kova_common::TlsPolicy;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::{CircuitBreakerConfig, MailError, RetryPolicy, SmtpTimeouts};

/// Ports tried in order when none are configured: implicit TLS, then submission.
pub const DEFAULT_PORTS: [u16; 2] = [465, 587];

/// Everything the mailer needs, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// SMTP relay host name
    #[serde(default = "default_host")]
    pub host: String,

    /// Account used for AUTH and as the envelope sender
    #[serde(default)]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: SecretString,

    /// Display name for the From header
    #[serde(default)]
    pub from_name: Option<String>,

    /// Name announced in EHLO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Candidate ports, tried in order. Accepts a list, a number or `"465,587"`.
    #[serde(default, deserialize_with = "deserialize_ports")]
    pub ports: Vec<u16>,

    #[serde(default)]
    pub tls: TlsPolicy,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Persistent sessions kept by the pool. `1` uses a single managed session.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a send waits for a free pooled session (seconds)
    #[serde(default = "default_pool_acquire_timeout_secs")]
    pub pool_acquire_timeout_secs: u64,

    /// Pooled sessions idle longer than this are closed before reuse (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sends in flight across the whole process
    #[serde(default = "default_max_parallel_sends")]
    pub max_parallel_sends: usize,

    /// Concurrent group sends per recipient domain, `0` disables the limit
    #[serde(default = "default_per_domain_concurrency")]
    pub per_domain_concurrency: usize,

    #[serde(default = "default_max_attachment_size_mb")]
    pub max_attachment_size_mb: u64,

    /// Attempts per port when establishing a session
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Base of the `base * 2^attempt` backoff between connect attempts (milliseconds)
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Budget for the whole group phase (seconds)
    #[serde(default = "default_group_phase_timeout_secs")]
    pub group_phase_timeout_secs: u64,

    /// Pause after each group send while holding the domain slot (milliseconds)
    #[serde(default)]
    pub group_send_delay_ms: u64,

    /// Where bulk archives are assembled
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            username: String::new(),
            password: default_password(),
            from_name: None,
            helo_name: default_helo_name(),
            ports: Vec::new(),
            tls: TlsPolicy::default(),
            accept_invalid_certs: false,
            pool_size: default_pool_size(),
            pool_acquire_timeout_secs: default_pool_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_parallel_sends: default_max_parallel_sends(),
            per_domain_concurrency: default_per_domain_concurrency(),
            max_attachment_size_mb: default_max_attachment_size_mb(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            retry: RetryPolicy::default(),
            timeouts: SmtpTimeouts::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            group_phase_timeout_secs: default_group_phase_timeout_secs(),
            group_send_delay_ms: 0,
            temp_dir: default_temp_dir(),
        }
    }
}

impl MailerConfig {
    /// Reject configurations that cannot possibly send mail.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.host.trim().is_empty() {
            return Err(MailError::Configuration("SMTP host is not set".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(MailError::Configuration(
                "SMTP username is not set".to_string(),
            ));
        }
        if self.password.expose_secret().is_empty() {
            return Err(MailError::Configuration(
                "SMTP password is not set".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(MailError::Configuration(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.max_parallel_sends == 0 {
            return Err(MailError::Configuration(
                "max_parallel_sends must be at least 1".to_string(),
            ));
        }
        if self.connect_retries == 0 {
            return Err(MailError::Configuration(
                "connect_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured ports, or the provider default when none are set.
    #[must_use]
    pub fn effective_ports(&self) -> Vec<u16> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }
        if self.host.to_ascii_lowercase().contains("yandex") {
            vec![465]
        } else {
            DEFAULT_PORTS.to_vec()
        }
    }

    /// Envelope sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.username.trim()
    }

    #[must_use]
    pub const fn max_attachment_bytes(&self) -> u64 {
        self.max_attachment_size_mb.saturating_mul(1024 * 1024)
    }

    #[must_use]
    pub const fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn group_phase_timeout(&self) -> Duration {
        Duration::from_secs(self.group_phase_timeout_secs)
    }

    #[must_use]
    pub const fn group_send_delay(&self) -> Duration {
        Duration::from_millis(self.group_send_delay_ms)
    }

    /// Delay after a failed connect attempt (`attempt` is 0-based).
    #[must_use]
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.connect_backoff_ms
                .saturating_mul(1u64 << attempt.min(16)),
        )
    }
}

fn default_host() -> String {
    "smtp.gmail.com".to_string()
}

fn default_password() -> SecretString {
    SecretString::from(String::new())
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

const fn default_pool_size() -> usize {
    2
}

const fn default_pool_acquire_timeout_secs() -> u64 {
    60
}

const fn default_idle_timeout_secs() -> u64 {
    240
}

const fn default_max_parallel_sends() -> usize {
    3
}

const fn default_per_domain_concurrency() -> usize {
    1
}

const fn default_max_attachment_size_mb() -> u64 {
    25
}

const fn default_connect_retries() -> u32 {
    2
}

const fn default_connect_backoff_ms() -> u64 {
    1000
}

const fn default_group_phase_timeout_secs() -> u64 {
    360
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortsRepr {
    List(Vec<u16>),
    One(u16),
    Text(String),
}

fn deserialize_ports<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match PortsRepr::deserialize(deserializer)? {
        PortsRepr::List(ports) => Ok(ports),
        PortsRepr::One(port) => Ok(vec![port]),
        PortsRepr::Text(text) => parse_ports(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse a comma separated port list such as `"465, 587"`.
pub(crate) fn parse_ports(text: &str) -> Result<Vec<u16>, String> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u16>()
                .map_err(|e| format!("invalid SMTP port '{part}': {e}"))
        })
        .collect()
}
