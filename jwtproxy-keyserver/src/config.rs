use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use jwtproxy_slo::{errors, Result};

/// A pluggable component: the registered type name plus its own options.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistrableComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_options")]
    pub options: toml::Value,
}

impl RegistrableComponentConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: empty_options(),
        }
    }

    pub fn with_options(mut self, options: toml::Value) -> Self {
        self.options = options;
        self
    }

    /// Decodes the options table into the component's own config type.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        self.options
            .clone()
            .try_into()
            .map_err(|err| errors::config(&err))
    }
}

fn empty_options() -> toml::Value {
    toml::Value::Table(toml::Table::new())
}

/// Token signing parameters shared by every signer component.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SignerParams {
    pub issuer: String,
    #[serde(with = "humantime_serde", default = "default_expiration_time")]
    pub expiration_time: Duration,
    #[serde(with = "humantime_serde", default = "default_max_skew")]
    pub max_skew: Duration,
    #[serde(default = "default_nonce_length")]
    pub nonce_length: usize,
}

impl SignerParams {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            expiration_time: default_expiration_time(),
            max_skew: default_max_skew(),
            nonce_length: default_nonce_length(),
        }
    }
}

fn default_expiration_time() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_skew() -> Duration {
    Duration::from_secs(60)
}

fn default_nonce_length() -> usize {
    32
}
