mod config;
mod key;
mod publication;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use serde::Serialize;

use jwtproxy_slo::{errors, Result};

pub use config::{RegistrableComponentConfig, SignerParams};
pub use key::{thumbprint, PublicKey, SigningKey};
pub use publication::{CancelHandle, Publication, Publisher};

/// Client of the trust authority that tracks which public keys are valid.
#[automock]
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Fails with a `NotFound` or `Expired` code when the key is unknown or
    /// past its expiration.
    async fn verify_public_key(&self, key_id: &str) -> Result<()>;

    /// Starts publishing `public_key`, signed by `signer`.
    fn publish_public_key(
        &self,
        public_key: &PublicKey,
        policy: &KeyPolicy,
        signer: &SigningKey,
    ) -> Publication;

    async fn delete_public_key(&self, key: &SigningKey) -> Result<()>;
}

/// Lifetime rules attached to a published key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KeyPolicy {
    pub expiration: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub rotation_policy: Option<Duration>,
}

impl KeyPolicy {
    /// A key rotated every `rotate_every` expires after two intervals, so a
    /// late rotation does not race the expiry. Zero disables both fields.
    pub fn new(rotate_every: Duration, now: DateTime<Utc>) -> Result<Self> {
        if rotate_every.is_zero() {
            return Ok(Self::default());
        }
        let lifetime = chrono::Duration::from_std(rotate_every * 2)
            .map_err(|err| errors::config(&err))?;
        let expiration = now
            .checked_add_signed(lifetime)
            .ok_or_else(|| errors::config("rotation interval is too large"))?;
        Ok(Self {
            expiration: Some(expiration),
            rotation_policy: Some(rotate_every),
        })
    }
}

/// Builds a key server from its component config.
pub trait Constructor: Send + Sync {
    fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
    ) -> Result<Arc<dyn KeyServer>>;
}

impl<F> Constructor for F
where
    F: Fn(&RegistrableComponentConfig, &SignerParams) -> Result<Arc<dyn KeyServer>>
        + Send
        + Sync,
{
    fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
    ) -> Result<Arc<dyn KeyServer>> {
        (self)(config, params)
    }
}

/// Key server constructors by type name.
#[derive(Default)]
pub struct Registry {
    constructors: HashMap<String, Box<dyn Constructor>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("constructors", &self.constructors.keys())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(&mut self, name: &str, constructor: C) -> Result<()>
    where
        C: Constructor + 'static,
    {
        if self.constructors.contains_key(name) {
            return Err(errors::config(&format!(
                "key server {name} is already registered"
            )));
        }
        self.constructors
            .insert(name.to_owned(), Box::new(constructor));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
    ) -> Result<Arc<dyn KeyServer>> {
        let constructor =
            self.constructors.get(&config.kind).ok_or_else(|| {
                errors::config(&format!(
                    "unknown key server type {}",
                    config.kind
                ))
            })?;
        constructor.build(config, params)
    }
}
