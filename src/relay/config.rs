//! Configuration structs for the server and client, deserializable from
//! TOML and overridable from the CLI.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::relay::error::{Error, Result};

/// Server-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// `host:port` to bind the relay's WebSocket listener on.
    pub listen_address: SocketAddr,
    /// TLS certificate file. Both this and `tls_key_file` empty means
    /// plaintext `rel://` (dev only).
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    /// TLS private key file.
    #[serde(default)]
    pub tls_key_file: Option<String>,
    /// The canonical URL this relay advertises in `HelloResponse`.
    pub exposed_address: String,
    /// HMAC shared secret used to validate incoming `Hello` tokens.
    pub auth_secret: String,
    /// `host:port` to serve the Prometheus `/metrics` endpoint on.
    #[serde(default)]
    pub metrics_listen_address: Option<SocketAddr>,
    /// Validity window handed to clients that request credentials from
    /// this relay's token-issuing endpoint (not part of the relay
    /// protocol itself, but needed to run `auth::hmac::Generator`).
    #[serde(default = "default_token_validity_secs")]
    pub token_validity_secs: u64,
}

fn default_token_validity_secs() -> u64 {
    24 * 60 * 60
}

impl ServerConfig {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    /// True when neither TLS file is configured — plaintext `rel://` dev
    /// mode.
    pub fn is_plaintext(&self) -> bool {
        self.tls_cert_file.is_none() && self.tls_key_file.is_none()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Client-side configuration. Credential issuance isn't a config field:
/// it's the `fetch` closure passed to [`crate::relay::auth::hmac::TokenStore`]
/// and to [`crate::relay::client::Client::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// The relay URL to dial, e.g. `wss://relay.example.com/relay`.
    pub server_url: String,
    /// This client's local peer identity (e.g. a WireGuard public key).
    pub peer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_minimal_toml() {
        let toml = r#"
            listen_address = "127.0.0.1:33445"
            exposed_address = "rels://relay.example.com:33445"
            auth_secret = "s3cr3t"
        "#;
        let cfg = ServerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.listen_address.port(), 33445);
        assert!(cfg.is_plaintext());
        assert_eq!(cfg.token_validity(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn server_config_rejects_garbage() {
        assert!(ServerConfig::from_toml_str("not valid toml {{{").is_err());
    }
}
