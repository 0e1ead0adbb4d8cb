//! Relay configuration
//!
//! Non-secret settings come from an optional TOML file; key material comes
//! only from the environment.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [crypto]
//! dh_prime_bits = 2048
//! at_rest_nonce_len = 12
//! session_idle_timeout_secs = 300
//! sweep_interval_secs = 30
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crypto_session::{AtRestCipher, CryptoConfigError, MIN_DH_PRIME_BITS, NONCE_SIZE, XNONCE_SIZE};
use serde::{Deserialize, Serialize};
use shared_protocol::DEFAULT_DH_PRIME_BITS;
use tracing::info;

use crate::error::{RelayError, RelayResult};

/// Path of the optional TOML file
pub const CONFIG_PATH_ENV: &str = "CARELINK_CONFIG";
/// Base64 master key for at-rest encryption (32 bytes)
pub const MASTER_KEY_ENV: &str = "CARELINK_MASTER_KEY";
/// Base64 key for keyed hashes
pub const HMAC_KEY_ENV: &str = "CARELINK_HMAC_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub crypto: CryptoSection,

    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSection {
    #[serde(default = "default_prime_bits")]
    pub dh_prime_bits: usize,

    #[serde(default = "default_nonce_len")]
    pub at_rest_nonce_len: usize,

    /// Seconds a session may wait for the peer's key-response
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CryptoSection {
    fn default() -> Self {
        Self {
            dh_prime_bits: default_prime_bits(),
            at_rest_nonce_len: default_nonce_len(),
            session_idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Key material, never serialized or printed
#[derive(Clone, Default)]
pub struct Secrets {
    pub master_key: Option<String>,
    pub hmac_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("hmac_key", &self.hmac_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_prime_bits() -> usize {
    DEFAULT_DH_PRIME_BITS
}

fn default_nonce_len() -> usize {
    NONCE_SIZE
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

impl RelayConfig {
    /// Parse the TOML form
    pub fn from_toml_str(content: &str) -> RelayResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the file at `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let content = std::fs::read_to_string(path)?;
                Self::from_toml_str(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Load file and secrets from the environment, then validate
    pub fn from_env() -> RelayResult<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV);
        let config = Self::load(path.as_deref().map(Path::new))?.with_secrets(
            std::env::var(MASTER_KEY_ENV).ok(),
            std::env::var(HMAC_KEY_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn with_secrets(mut self, master_key: Option<String>, hmac_key: Option<String>) -> Self {
        self.secrets = Secrets {
            master_key,
            hmac_key,
        };
        self
    }

    /// Reject configurations the crypto layer cannot run safely with
    pub fn validate(&self) -> RelayResult<()> {
        if self.crypto.dh_prime_bits < MIN_DH_PRIME_BITS {
            return Err(RelayError::Config(format!(
                "dh_prime_bits must be at least {}, got {}",
                MIN_DH_PRIME_BITS, self.crypto.dh_prime_bits
            )));
        }
        if self.crypto.at_rest_nonce_len != NONCE_SIZE && self.crypto.at_rest_nonce_len != XNONCE_SIZE
        {
            return Err(CryptoConfigError::UnsupportedNonceLength(self.crypto.at_rest_nonce_len).into());
        }
        if self.crypto.session_idle_timeout_secs == 0 || self.crypto.sweep_interval_secs == 0 {
            return Err(RelayError::Config(
                "session_idle_timeout_secs and sweep_interval_secs must be positive".into(),
            ));
        }
        if is_blank(&self.secrets.master_key) {
            return Err(CryptoConfigError::MissingMasterKey.into());
        }
        if is_blank(&self.secrets.hmac_key) {
            return Err(CryptoConfigError::MissingHmacKey.into());
        }
        Ok(())
    }

    /// At-rest cipher built from the configured secrets
    pub fn build_cipher(&self) -> RelayResult<AtRestCipher> {
        if is_blank(&self.secrets.hmac_key) {
            return Err(CryptoConfigError::MissingHmacKey.into());
        }
        Ok(AtRestCipher::from_base64(
            self.secrets.master_key.as_deref(),
            self.secrets.hmac_key.as_deref(),
            self.crypto.at_rest_nonce_len,
        )?)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.crypto.sweep_interval_secs)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).is_none_or(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    const HMAC: &str = "aG1hYy1rZXk=";

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.crypto.dh_prime_bits, 2048);
        assert_eq!(config.crypto.at_rest_nonce_len, NONCE_SIZE);
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_sections() {
        let config = RelayConfig::from_toml_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [crypto]
            dh_prime_bits = 1024
            at_rest_nonce_len = 24
            session_idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.crypto.dh_prime_bits, 1024);
        assert_eq!(config.crypto.at_rest_nonce_len, XNONCE_SIZE);
        assert_eq!(config.crypto.sweep_interval_secs, 30);
    }

    #[test]
    fn test_missing_keys_are_fatal() {
        let config = RelayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(RelayError::CryptoConfig(CryptoConfigError::MissingMasterKey))
        ));

        let config = RelayConfig::default().with_secrets(Some(MASTER.into()), None);
        assert!(matches!(
            config.validate(),
            Err(RelayError::CryptoConfig(CryptoConfigError::MissingHmacKey))
        ));
        assert!(matches!(
            config.build_cipher(),
            Err(RelayError::CryptoConfig(CryptoConfigError::MissingHmacKey))
        ));

        let config = RelayConfig::default().with_secrets(Some(MASTER.into()), Some("  ".into()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_config_builds_cipher() {
        let config = RelayConfig::default().with_secrets(Some(MASTER.into()), Some(HMAC.into()));
        config.validate().unwrap();
        let cipher = config.build_cipher().unwrap();
        assert!(cipher.has_hmac_key());
        assert_eq!(cipher.nonce_len(), NONCE_SIZE);
    }

    #[test]
    fn test_weak_parameters_rejected() {
        let mut config =
            RelayConfig::default().with_secrets(Some(MASTER.into()), Some(HMAC.into()));
        config.crypto.dh_prime_bits = 128;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        config.crypto.dh_prime_bits = 2048;
        config.crypto.at_rest_nonce_len = 16;
        assert!(matches!(
            config.validate(),
            Err(RelayError::CryptoConfig(CryptoConfigError::UnsupportedNonceLength(16)))
        ));
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = RelayConfig::default().with_secrets(Some(MASTER.into()), Some(HMAC.into()));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(MASTER));
        assert!(!rendered.contains(HMAC));
    }
}
