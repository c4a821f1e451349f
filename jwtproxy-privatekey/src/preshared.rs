use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use jwtproxy_keyserver::{
    self as keyserver, RegistrableComponentConfig, SignerParams, SigningKey,
};
use jwtproxy_slo::Result;

use crate::{file, Done, PrivateKey};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub key_path: PathBuf,
}

/// A fixed key read from disk, never rotated nor published.
#[derive(Debug)]
pub struct Preshared {
    key: Arc<SigningKey>,
}

impl Preshared {
    pub async fn load(config: &Config) -> Result<Self> {
        let key = file::load_private_key(&config.key_path).await?;
        debug!(
            "Loaded preshared key {} from: {}",
            key.short_id(),
            config.key_path.display()
        );
        Ok(Self { key: Arc::new(key) })
    }
}

#[async_trait]
impl PrivateKey for Preshared {
    fn private_key(&self) -> Result<Arc<SigningKey>> {
        Ok(Arc::clone(&self.key))
    }

    async fn stop(&self) -> Done {
        Done::ready()
    }
}

/// Builds [`Preshared`] from its component config.
#[derive(Debug, Clone, Copy, Default)]
pub struct Factory;

#[async_trait]
impl crate::Constructor for Factory {
    async fn build(
        &self,
        config: &RegistrableComponentConfig,
        _params: &SignerParams,
        _key_servers: &keyserver::Registry,
    ) -> Result<Arc<dyn PrivateKey>> {
        let config: Config = config.options()?;
        Ok(Arc::new(Preshared::load(&config).await?))
    }
}
