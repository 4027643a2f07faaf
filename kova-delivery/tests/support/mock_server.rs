//! Mock SMTP relay for connection and dispatch tests
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! The server speaks plain SMTP on a random local port and can:
//! - Accept or refuse AUTH (PLAIN and LOGIN)
//! - Return configured replies per command
//! - Delay replies, drop connections after N commands or N messages
//! - Record commands and message bodies for verification
//! - Count connections and the peak number of concurrent transactions
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_auth_response(535, "5.7.8 Authentication credentials invalid")
//!     .build()
//!     .await?;
//!
//! // Point a MailerConfig at server.port() with TLS disabled
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{ReadHalf, WriteHalf},
    },
    sync::RwLock,
    time::timeout,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    /// AUTH with its mechanism; credentials are not kept
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA)
    MessageContent(Vec<u8>),
    Rset,
    Noop,
    Quit,
    StartTls,
    Other(String),
}

/// Response configuration for SMTP commands
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    capabilities: Vec<String>,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    /// Per-recipient overrides, matched by substring
    rcpt_overrides: Vec<(String, SmtpResponse)>,
    data_end_response: SmtpResponse,

    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
    /// Close the connection instead of answering the Nth message's end of data
    drop_after_messages: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            capabilities: vec![
                "localhost".to_string(),
                "AUTH PLAIN LOGIN".to_string(),
                "SIZE 10000000".to_string(),
            ],
            auth_response: SmtpResponse::new(235, "2.7.0 Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_overrides: Vec::new(),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            response_delay: None,
            drop_after_commands: None,
            drop_after_messages: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    commands: AtomicUsize,
    messages: AtomicUsize,
    active_transactions: AtomicUsize,
    peak_transactions: AtomicUsize,
}

impl Counters {
    fn begin_transaction(&self) {
        let now = self.active_transactions.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_transactions.fetch_max(now, Ordering::SeqCst);
    }

    fn end_transaction(&self) {
        self.active_transactions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Bodies of every message accepted so far
    pub async fn messages(&self) -> Vec<String> {
        self.commands_received
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => {
                    Some(String::from_utf8_lossy(content).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.counters.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.counters.commands.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.counters.messages.load(Ordering::SeqCst)
    }

    /// Highest number of MAIL..end-of-data transactions seen at once
    #[must_use]
    pub fn peak_transactions(&self) -> usize {
        self.counters.peak_transactions.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
        counters: Arc<Counters>,
    ) -> Result<(), BoxError> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut in_transaction = false;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        let result = Self::converse(
            &mut reader,
            &mut writer,
            &config,
            &commands,
            &counters,
            &mut in_transaction,
        )
        .await;

        if in_transaction {
            counters.end_transaction();
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn converse(
        reader: &mut BufReader<ReadHalf<'_>>,
        writer: &mut WriteHalf<'_>,
        config: &MockServerConfig,
        commands: &RwLock<Vec<SmtpCommand>>,
        counters: &Counters,
        in_transaction: &mut bool,
    ) -> Result<(), BoxError> {
        let mut line = String::new();
        let mut local_command_count = 0;

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            local_command_count += 1;
            counters.commands.fetch_add(1, Ordering::SeqCst);

            let cmd_line = line.trim().to_string();
            let parts: Vec<&str> = cmd_line.splitn(2, ' ').collect();
            let command = parts[0].to_uppercase();
            let argument = parts.get(1).unwrap_or(&"").to_string();

            let (response, smtp_cmd) = match command.as_str() {
                "EHLO" => (ehlo_bytes(&config.capabilities), SmtpCommand::Ehlo(argument)),
                "HELO" => (
                    SmtpResponse::new(250, "Hello").to_bytes(),
                    SmtpCommand::Helo(argument),
                ),
                "AUTH" => {
                    let mechanism = argument
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_uppercase();
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Auth(mechanism.clone()));

                    if mechanism == "LOGIN" {
                        for prompt in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                            writer
                                .write_all(&SmtpResponse::new(334, prompt).to_bytes())
                                .await?;
                            writer.flush().await?;
                            line.clear();
                            if reader.read_line(&mut line).await? == 0 {
                                return Ok(());
                            }
                        }
                    }

                    writer.write_all(&config.auth_response.to_bytes()).await?;
                    writer.flush().await?;
                    continue;
                }
                "MAIL" => {
                    if !*in_transaction {
                        *in_transaction = true;
                        counters.begin_transaction();
                    }
                    (
                        config.mail_from_response.to_bytes(),
                        SmtpCommand::MailFrom(argument),
                    )
                }
                "RCPT" => {
                    let response = config
                        .rcpt_overrides
                        .iter()
                        .find(|(needle, _)| argument.contains(needle.as_str()))
                        .map_or(&config.rcpt_to_response, |(_, response)| response);
                    (response.to_bytes(), SmtpCommand::RcptTo(argument))
                }
                "DATA" => (
                    SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>")
                        .to_bytes(),
                    SmtpCommand::Data,
                ),
                "RSET" => {
                    if *in_transaction {
                        *in_transaction = false;
                        counters.end_transaction();
                    }
                    (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Rset)
                }
                "NOOP" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Noop),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer
                        .write_all(&SmtpResponse::new(221, "Bye").to_bytes())
                        .await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => (
                    SmtpResponse::new(502, "Command not implemented").to_bytes(),
                    SmtpCommand::StartTls,
                ),
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
            };

            commands.write().await.push(smtp_cmd.clone());

            if matches!(smtp_cmd, SmtpCommand::Data) {
                writer.write_all(&response).await?;
                writer.flush().await?;

                let mut message_content = Vec::new();
                let mut data_line = String::new();
                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line.trim_end_matches(['\r', '\n']) == "." {
                        break;
                    }
                    message_content.extend_from_slice(data_line.as_bytes());
                }

                let nth = counters.messages.load(Ordering::SeqCst) + 1;
                if config.drop_after_messages.is_some_and(|limit| nth > limit) {
                    return Ok(());
                }

                if let Some(delay) = config.response_delay {
                    tokio::time::sleep(delay).await;
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(message_content));
                counters.messages.fetch_add(1, Ordering::SeqCst);
                if *in_transaction {
                    *in_transaction = false;
                    counters.end_transaction();
                }

                writer
                    .write_all(&config.data_end_response.to_bytes())
                    .await?;
                writer.flush().await?;
                continue;
            }

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}

fn ehlo_bytes(capabilities: &[String]) -> Vec<u8> {
    let mut response = String::new();
    let count = capabilities.len();

    for (i, capability) in capabilities.iter().enumerate() {
        let separator = if i + 1 < count { '-' } else { ' ' };
        let _ = write!(&mut response, "250{separator}{capability}\r\n");
    }

    response.into_bytes()
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Replace the EHLO lines after the greeting line
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = std::iter::once("localhost")
            .chain(capabilities.iter().copied())
            .map(str::to_string)
            .collect();
        self
    }

    /// Final reply to AUTH
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply to RCPT TO for addresses containing `needle`
    #[must_use]
    pub fn with_rcpt_override(
        mut self,
        needle: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_overrides
            .push((needle.into(), SmtpResponse::new(code, message)));
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Accept `count` messages in total, then hang up instead of confirming the next one
    #[must_use]
    pub const fn with_network_error_after_messages(mut self, count: usize) -> Self {
        self.config.drop_after_messages = Some(count);
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);
        let counters_clone = Arc::clone(&counters);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    counters_clone.connections.fetch_add(1, Ordering::SeqCst);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);
                    let counters = Arc::clone(&counters_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, commands, counters).await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            counters,
        })
    }
}
