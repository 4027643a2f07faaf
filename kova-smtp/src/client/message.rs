//! Email message builder with support for headers, body, and MIME attachments.

use std::{fmt::Write, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use ulid::Ulid;

use super::error::{ClientError, Result};

/// Width of base64 body lines (RFC 2045 6.8).
const BASE64_LINE: usize = 76;

/// An email attachment with filename, content type, and data.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// The filename to use in the MIME header.
    pub filename: String,
    /// The MIME content type (e.g., "application/pdf").
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Builder for constructing RFC 5322 messages with MIME attachments.
///
/// Non-ASCII header values are emitted as RFC 2047 encoded words and
/// non-ASCII bodies are base64 encoded, so the output is always 7-bit clean.
/// An HTML body is sent as the `multipart/alternative` sibling of the text.
///
/// # Examples
///
/// ```
/// use kova_smtp::client::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("sender@example.com")
///     .to("recipient@example.com")
///     .subject("Hello")
///     .body("This is the message body")
///     .build()
///     .unwrap();
///
/// assert!(message.contains("Subject: Hello\r\n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    from_name: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    reply_to: Option<String>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<String>,
    html_body: Option<String>,
    attachments: Vec<Attachment>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the From address.
    #[must_use]
    pub fn from(mut self, email: impl Into<String>) -> Self {
        self.from = Some(email.into());
        self
    }

    /// Sets the display name shown next to the From address.
    #[must_use]
    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.from_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    #[must_use]
    pub fn to(mut self, email: impl Into<String>) -> Self {
        self.to.push(email.into());
        self
    }

    #[must_use]
    pub fn to_multiple(mut self, emails: &[impl AsRef<str>]) -> Self {
        self.to
            .extend(emails.iter().map(|email| email.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn cc_multiple(mut self, emails: &[impl AsRef<str>]) -> Self {
        self.cc
            .extend(emails.iter().map(|email| email.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn reply_to(mut self, email: impl Into<String>) -> Self {
        self.reply_to = Some(email.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds a custom header. Later headers with the same name are kept as well.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(content.into());
        self
    }

    /// Sets an HTML rendering of the body.
    #[must_use]
    pub fn html_body(mut self, content: impl Into<String>) -> Self {
        self.html_body = Some(content.into());
        self
    }

    /// Adds a file attachment from raw data.
    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Builds the final message.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no From address or no To recipient.
    pub fn build(self) -> Result<String> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| ClientError::BuilderError("missing From address".to_string()))?;
        if self.to.is_empty() {
            return Err(ClientError::BuilderError(
                "at least one To recipient is required".to_string(),
            ));
        }

        let mut message = String::with_capacity(
            2048 + self
                .attachments
                .iter()
                .map(|a| a.data.len() * 4 / 3)
                .sum::<usize>(),
        );

        self.write_headers(&mut message, from)?;

        if self.attachments.is_empty() {
            self.write_body(&mut message)?;
            return Ok(message);
        }

        let boundary = generate_boundary();
        write!(
            message,
            "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
        )
        .map_err(fmt_error)?;
        message.push_str("This is a multi-part message in MIME format.\r\n");

        write!(message, "--{boundary}\r\n").map_err(fmt_error)?;
        self.write_body(&mut message)?;
        message.push_str("\r\n");

        for attachment in &self.attachments {
            let filename = encode_header_word(&attachment.filename);
            write!(message, "--{boundary}\r\n").map_err(fmt_error)?;
            write!(
                message,
                "Content-Type: {}; name=\"{filename}\"\r\n",
                attachment.content_type
            )
            .map_err(fmt_error)?;
            message.push_str("Content-Transfer-Encoding: base64\r\n");
            write!(
                message,
                "Content-Disposition: attachment; filename=\"{filename}\"\r\n\r\n"
            )
            .map_err(fmt_error)?;
            message.push_str(&base64_wrapped(&attachment.data));
        }

        write!(message, "--{boundary}--\r\n").map_err(fmt_error)?;
        Ok(message)
    }

    fn write_headers(&self, message: &mut String, from: &str) -> Result<()> {
        match &self.from_name {
            Some(name) => write!(message, "From: {} <{from}>\r\n", encode_header_word(name)),
            None => write!(message, "From: {from}\r\n"),
        }
        .map_err(fmt_error)?;

        write!(message, "To: {}\r\n", self.to.join(", ")).map_err(fmt_error)?;
        if !self.cc.is_empty() {
            write!(message, "Cc: {}\r\n", self.cc.join(", ")).map_err(fmt_error)?;
        }
        if let Some(reply_to) = &self.reply_to {
            write!(message, "Reply-To: {reply_to}\r\n").map_err(fmt_error)?;
        }
        if let Some(subject) = &self.subject {
            write!(message, "Subject: {}\r\n", encode_header_word(subject)).map_err(fmt_error)?;
        }

        write!(message, "Date: {}\r\n", chrono::Utc::now().to_rfc2822()).map_err(fmt_error)?;
        let host = from.rsplit_once('@').map_or("localhost", |(_, domain)| domain);
        write!(message, "Message-ID: <{}@{host}>\r\n", Ulid::new()).map_err(fmt_error)?;

        for (name, value) in &self.headers {
            write!(message, "{name}: {}\r\n", encode_header_word(value)).map_err(fmt_error)?;
        }

        message.push_str("MIME-Version: 1.0\r\n");
        Ok(())
    }

    /// The text part, or text and HTML wrapped in `multipart/alternative`.
    fn write_body(&self, message: &mut String) -> Result<()> {
        let text = self.body.as_deref().unwrap_or_default();
        let Some(html) = &self.html_body else {
            return write_text_part(message, "plain", text);
        };

        let boundary = generate_boundary();
        write!(
            message,
            "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
        )
        .map_err(fmt_error)?;
        // Least faithful rendering first (RFC 2046 5.1.4)
        for (subtype, content) in [("plain", text), ("html", html.as_str())] {
            write!(message, "--{boundary}\r\n").map_err(fmt_error)?;
            write_text_part(message, subtype, content)?;
            message.push_str("\r\n");
        }
        write!(message, "--{boundary}--\r\n").map_err(fmt_error)?;
        Ok(())
    }
}

/// Writes a `text/{subtype}` part: headers, blank line, content.
fn write_text_part(message: &mut String, subtype: &str, body: &str) -> Result<()> {
    write!(message, "Content-Type: text/{subtype}; charset=utf-8\r\n").map_err(fmt_error)?;
    if body.is_ascii() {
        message.push_str("Content-Transfer-Encoding: 7bit\r\n\r\n");
        message.push_str(body);
    } else {
        message.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
        message.push_str(&base64_wrapped(body.as_bytes()));
    }
    Ok(())
}

fn fmt_error(e: std::fmt::Error) -> ClientError {
    ClientError::BuilderError(e.to_string())
}

/// Generates a unique MIME boundary string.
fn generate_boundary() -> String {
    format!("----=_Part_{}", Ulid::new())
}

/// Base64 with CRLF line breaks every 76 characters.
fn base64_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        // base64 output is ASCII so every chunk boundary is a char boundary
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push_str("\r\n");
    }
    out
}

/// Encodes a header value as an RFC 2047 `B` encoded word when it is not plain ASCII.
#[must_use]
pub fn encode_header_word(value: &str) -> String {
    if value.is_ascii() && !value.contains(['\r', '\n']) {
        value.to_string()
    } else {
        let cleaned: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        format!("=?UTF-8?B?{}?=", STANDARD.encode(cleaned.as_bytes()))
    }
}

/// Guesses the MIME content type based on file extension.
#[must_use]
pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match extension.to_lowercase().as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}
