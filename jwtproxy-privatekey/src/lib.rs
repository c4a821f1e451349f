pub mod autogenerated;
mod background;
mod file;
pub mod preshared;
mod store;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::error;

use jwtproxy_keyserver::{
    self as keyserver, RegistrableComponentConfig, SignerParams, SigningKey,
};
use jwtproxy_slo::{errors, Result};

pub use autogenerated::Autogenerated;
pub use file::{key_path, load_private_key, save_private_key};
pub use preshared::Preshared;
pub use store::KeyStore;

/// Source of the key the proxy signs its tokens with.
#[async_trait]
pub trait PrivateKey: fmt::Debug + Send + Sync {
    /// Fails with `NoActiveKey` until a first key is confirmed; callers
    /// retry rather than wait.
    fn private_key(&self) -> Result<Arc<SigningKey>>;

    /// Stops any background work. Call at most once.
    async fn stop(&self) -> Done;
}

/// Completion signal returned by [`PrivateKey::stop`].
#[derive(Debug)]
pub struct Done {
    handle: Option<JoinHandle<()>>,
}

impl Done {
    pub fn ready() -> Self {
        Self { handle: None }
    }

    pub(crate) fn new(handle: Option<JoinHandle<()>>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Resolves once the background loop has exited. Detached revocations
    /// and saves are not waited for.
    pub async fn wait(self) {
        if let Some(handle) = self.handle {
            if let Err(err) = handle.await {
                error!("Key publisher terminated abnormally: {}", err);
            }
        }
    }
}

/// Builds a [`PrivateKey`] provider from its component config.
#[async_trait]
pub trait Constructor: Send + Sync {
    async fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
        key_servers: &keyserver::Registry,
    ) -> Result<Arc<dyn PrivateKey>>;
}

/// Private key providers by type name.
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

    /// `autogenerated` and `preshared`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .constructors
            .insert("autogenerated".to_owned(), Box::new(autogenerated::Factory));
        registry
            .constructors
            .insert("preshared".to_owned(), Box::new(preshared::Factory));
        registry
    }

    pub fn register<C>(&mut self, name: &str, constructor: C) -> Result<()>
    where
        C: Constructor + 'static,
    {
        if self.constructors.contains_key(name) {
            return Err(errors::config(&format!(
                "private key type {name} is already registered"
            )));
        }
        self.constructors
            .insert(name.to_owned(), Box::new(constructor));
        Ok(())
    }

    pub async fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
        key_servers: &keyserver::Registry,
    ) -> Result<Arc<dyn PrivateKey>> {
        let constructor =
            self.constructors.get(&config.kind).ok_or_else(|| {
                errors::config(&format!(
                    "unknown private key type {}",
                    config.kind
                ))
            })?;
        constructor.build(config, params, key_servers).await
    }
}
