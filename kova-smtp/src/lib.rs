//! SMTP submission client used by the kova dispatcher.
//!
//! The [`client`] module speaks just enough of RFC 5321 to submit mail to an
//! authenticated relay: greeting, EHLO, STARTTLS or implicit TLS, AUTH,
//! and a single MAIL/RCPT/DATA transaction at a time on a reusable session.

pub mod client;
