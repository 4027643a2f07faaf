//! Shared fixtures for the kova-delivery integration tests.

pub mod mock_server;

use kova_common::TlsPolicy;
use kova_delivery::MailerConfig;
pub use mock_server::{MockSmtpServer, SmtpCommand};
use secrecy::SecretString;

/// Configuration pointing at a plaintext local relay on `ports`.
#[allow(dead_code)]
pub fn relay_config(ports: &[u16]) -> MailerConfig {
    MailerConfig {
        host: "127.0.0.1".to_string(),
        username: "sender@example.com".to_string(),
        password: SecretString::from("correct horse".to_string()),
        ports: ports.to_vec(),
        tls: TlsPolicy::Disabled,
        connect_retries: 1,
        connect_backoff_ms: 10,
        ..MailerConfig::default()
    }
}

/// A local port with nothing listening on it.
#[allow(dead_code)]
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let port = listener.local_addr().expect("throwaway listener address").port();
    drop(listener);
    port
}
