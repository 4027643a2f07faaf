//! SMTP client connection with support for implicit TLS, STARTTLS and AUTH.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use kova_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

/// Build a TLS connector trusting the platform roots.
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    tls_connector(accept_invalid_certs)?
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// A certificate verifier that accepts all certificates.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// SASL mechanisms the client can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

/// An SMTP client session.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
    capabilities: Vec<String>,
}

impl SmtpClient {
    fn with_connection(connection: ClientConnection, server_domain: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain,
            accept_invalid_certs: false,
            capabilities: Vec::new(),
        }
    }

    /// Opens a plaintext TCP session to `addr`.
    ///
    /// `server_domain` is the name presented for SNI and certificate
    /// verification if the session is later upgraded with STARTTLS.
    pub async fn connect(addr: &str, server_domain: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;
        Ok(Self::with_connection(
            ClientConnection::Plain(stream),
            server_domain.into(),
        ))
    }

    /// Opens a session that speaks TLS from the first byte (SMTPS).
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let server_domain = server_domain.into();
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;
        let tls = handshake(stream, &server_domain, accept_invalid_certs).await?;

        Ok(Self::with_connection(ClientConnection::Tls(Box::new(tls)), server_domain)
            .accept_invalid_certs(accept_invalid_certs))
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Extension keywords from the last successful EHLO, one per line.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Whether the last EHLO advertised `extension` (case-insensitive keyword match).
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.capabilities.iter().any(|line| {
            line.split([' ', '='])
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// Pick PLAIN when offered, then LOGIN; PLAIN when the server lists nothing.
    #[must_use]
    pub fn preferred_auth(&self) -> AuthMechanism {
        let offered: Vec<String> = self
            .capabilities
            .iter()
            .filter_map(|line| {
                let upper = line.to_ascii_uppercase();
                upper
                    .strip_prefix("AUTH ")
                    .or_else(|| upper.strip_prefix("AUTH="))
                    .map(str::to_string)
            })
            .flat_map(|mechs| {
                mechs
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();

        if offered.is_empty() || offered.iter().any(|m| m == "PLAIN") {
            AuthMechanism::Plain
        } else if offered.iter().any(|m| m == "LOGIN") {
            AuthMechanism::Login
        } else {
            AuthMechanism::Plain
        }
    }

    /// Reads the initial server greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command line to the server.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{command}");
        self.write_line(command).await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    /// Sends a command and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if response.is_success() {
            self.capabilities = response.lines.iter().skip(1).cloned().collect();
        }
        Ok(response)
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.capabilities.clear();
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends STARTTLS and upgrades the connection on a positive reply.
    ///
    /// Extensions are forgotten after the upgrade; EHLO must be sent again.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let old_connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                old_connection
                    .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
            self.capabilities.clear();
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    /// Authenticates with the mechanism chosen by [`SmtpClient::preferred_auth`].
    ///
    /// Credentials never reach the log.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<Response> {
        match self.preferred_auth() {
            AuthMechanism::Plain => {
                let token = STANDARD.encode(format!("\0{username}\0{password}"));
                outgoing!("AUTH PLAIN <redacted>");
                self.write_line(&format!("AUTH PLAIN {token}")).await?;
                auth_outcome(self.read_response().await?)
            }
            AuthMechanism::Login => {
                let challenge = self.command("AUTH LOGIN").await?;
                if challenge.code != 334 {
                    return auth_outcome(challenge);
                }

                outgoing!("<redacted username>");
                self.write_line(&STANDARD.encode(username)).await?;
                let challenge = self.read_response().await?;
                if challenge.code != 334 {
                    return auth_outcome(challenge);
                }

                outgoing!("<redacted password>");
                self.write_line(&STANDARD.encode(password)).await?;
                auth_outcome(self.read_response().await?)
            }
        }
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA; a `354` reply is required before content may follow.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.expect_code(354)
    }

    /// Sends the message content followed by the end-of-data marker.
    ///
    /// Line endings are normalised to CRLF and leading dots are doubled.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let mut payload = dot_stuff(data);
        if !payload.ends_with(b"\r\n") {
            payload.extend_from_slice(b"\r\n");
        }
        payload.extend_from_slice(b".\r\n");

        outgoing!("<message content: {} bytes>", payload.len());
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(&payload)
            .await?;

        self.read_response().await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    /// Reads a complete reply from the server.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

fn auth_outcome(response: Response) -> Result<Response> {
    if response.code == 235 {
        Ok(response)
    } else {
        Err(ClientError::AuthenticationFailed {
            code: response.code,
            message: response.message(),
        })
    }
}

/// Normalises line endings to CRLF and doubles leading dots (RFC 5321 4.5.2).
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 2);
    let mut lines = data.split(|&b| b == b'\n').peekable();

    while let Some(line) = lines.next() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        if lines.peek().is_some() {
            out.extend_from_slice(b"\r\n");
        }
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        assert_eq!(dot_stuff(b"a\n.b\n..c"), b"a\r\n..b\r\n...c");
    }

    #[test]
    fn dot_stuffing_normalises_line_endings() {
        assert_eq!(dot_stuff(b"one\r\ntwo\nthree\n"), b"one\r\ntwo\r\nthree\r\n");
    }

    /// Scripted server: answers each line it reads with the next canned reply.
    async fn scripted_server(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut received = Vec::new();

            writer.write_all(b"220 test ESMTP\r\n").await.unwrap();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                writer.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn auth_plain_sends_single_token() {
        let (addr, server) = scripted_server(vec![
            "250-test\r\n250-AUTH PLAIN LOGIN\r\n250 8BITMIME\r\n",
            "235 2.7.0 Accepted\r\n",
        ])
        .await;

        let mut client = SmtpClient::connect(&addr, "localhost").await.unwrap();
        assert_eq!(client.read_greeting().await.unwrap().code, 220);
        client.ehlo("client").await.unwrap();
        assert!(client.supports("8bitmime"));
        assert_eq!(client.preferred_auth(), AuthMechanism::Plain);

        client.authenticate("user", "pass").await.unwrap();

        let received = server.await.unwrap();
        let expected = format!("AUTH PLAIN {}", STANDARD.encode("\0user\0pass"));
        assert_eq!(received[1], expected);
    }

    #[tokio::test]
    async fn auth_login_walks_challenges() {
        let (addr, server) = scripted_server(vec![
            "250-test\r\n250 AUTH LOGIN\r\n",
            "334 VXNlcm5hbWU6\r\n",
            "334 UGFzc3dvcmQ6\r\n",
            "535 5.7.8 Bad credentials\r\n",
        ])
        .await;

        let mut client = SmtpClient::connect(&addr, "localhost").await.unwrap();
        client.read_greeting().await.unwrap();
        client.ehlo("client").await.unwrap();
        assert_eq!(client.preferred_auth(), AuthMechanism::Login);

        let err = client.authenticate("user", "wrong").await.unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationFailed { code: 535, .. }));

        let received = server.await.unwrap();
        assert_eq!(received[2], STANDARD.encode("user"));
        assert_eq!(received[3], STANDARD.encode("wrong"));
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut client = SmtpClient::connect(&addr, "localhost").await.unwrap();
        assert!(matches!(
            client.read_greeting().await,
            Err(ClientError::ConnectionClosed | ClientError::Io(_))
        ));
    }
}
