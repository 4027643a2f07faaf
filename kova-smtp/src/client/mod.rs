//! SMTP client for submitting mail to an authenticated relay.
//!
//! Supports:
//!
//! - Plain TCP with STARTTLS upgrade (port 587 style)
//! - Implicit TLS from the first byte (port 465 style)
//! - AUTH PLAIN and AUTH LOGIN
//! - Multiple transactions on one session, separated by RSET
//!
//! # Examples
//!
//! ```no_run
//! use kova_smtp::client::{MessageBuilder, SmtpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("smtp.example.com:587", "smtp.example.com").await?;
//! client.read_greeting().await?.into_result()?;
//! client.ehlo("localhost").await?.into_result()?;
//! client.starttls().await?.into_result()?;
//! client.ehlo("localhost").await?.into_result()?;
//! client.authenticate("user@example.com", "secret").await?;
//!
//! let message = MessageBuilder::new()
//!     .from("user@example.com")
//!     .to("ops@example.org")
//!     .subject("Report")
//!     .body("See attached")
//!     .build()?;
//!
//! client.mail_from("user@example.com").await?.into_result()?;
//! client.rcpt_to("ops@example.org").await?.into_result()?;
//! client.data().await?;
//! client.send_data(message.as_bytes()).await?.into_result()?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod message;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use message::{Attachment, MessageBuilder, encode_header_word, guess_content_type};
pub use response::{Response, ResponseLine};
pub use smtp_client::{AuthMechanism, SmtpClient, dot_stuff};
