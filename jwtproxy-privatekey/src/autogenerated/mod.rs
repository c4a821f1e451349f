mod rotator;

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info_span, warn, Span};

use jwtproxy_keyserver::{
    self as keyserver, KeyPolicy, KeyServer, Publication,
    RegistrableComponentConfig, SignerParams, SigningKey,
};
use jwtproxy_slo::{errors, errors::WithBacktrace, Result};

use crate::{background::Background, file, store::KeyStore, Done, PrivateKey};

/// Concurrent revocations and saves allowed in the background.
const BACKGROUND_TASKS: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Zero disables rotation.
    #[serde(with = "humantime_serde", default = "default_rotate_every")]
    pub rotate_every: Duration,
    pub key_server: RegistrableComponentConfig,
    #[serde(default)]
    pub key_folder: Option<PathBuf>,
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

impl Config {
    pub fn new(key_server: RegistrableComponentConfig) -> Self {
        Self {
            rotate_every: default_rotate_every(),
            key_server,
            key_folder: None,
            key_bits: default_key_bits(),
        }
    }
}

fn default_rotate_every() -> Duration {
    Duration::from_secs(12 * 60 * 60)
}

fn default_key_bits() -> usize {
    2048
}

/// Called when the key can no longer be rotated.
pub type FatalHook = Arc<dyn Fn(&WithBacktrace) + Send + Sync>;

/// Default [`FatalHook`]: a key that cannot be rotated will eventually
/// expire, so the process exits.
pub fn exit_process(err: &WithBacktrace) {
    error!("Unable to rotate the signing key, exiting: {}", err);
    std::process::exit(1);
}

/// A signing key generated locally, published to the key server and rotated
/// on a schedule.
pub struct Autogenerated {
    inner: Arc<Inner>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    store: KeyStore,
    key_server: Arc<dyn KeyServer>,
    background: Background,
    key_path: PathBuf,
    rotate_every: Duration,
    key_bits: usize,
    on_fatal: FatalHook,
}

impl fmt::Debug for Autogenerated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autogenerated")
            .field("store", &self.inner.store)
            .field("key_path", &self.inner.key_path)
            .field("rotate_every", &self.inner.rotate_every)
            .finish_non_exhaustive()
    }
}

impl Autogenerated {
    pub async fn start(
        config: Config,
        params: &SignerParams,
        key_server: Arc<dyn KeyServer>,
    ) -> Result<Self> {
        Self::start_with_hook(config, params, key_server, Arc::new(exit_process))
            .await
    }

    /// Loads and verifies the stored key, publishes a first key when there
    /// is none, then starts rotating in the background.
    pub async fn start_with_hook(
        config: Config,
        params: &SignerParams,
        key_server: Arc<dyn KeyServer>,
        on_fatal: FatalHook,
    ) -> Result<Self> {
        let key_path = file::key_path(config.key_folder.as_deref(), &params.issuer)?;

        let mut active = None;
        match file::load_private_key(&key_path).await {
            Ok(stored) => match key_server.verify_public_key(stored.id()).await {
                Ok(()) => {
                    debug!(
                        "Successfully loaded and verified private key at path: {}",
                        key_path.display()
                    );
                    active = Some(Arc::new(stored));
                }
                Err(err) if err.eq(&errors::not_found("")) => {
                    debug!("Public key not found - generating a new key");
                }
                Err(err) if err.eq(&errors::expired("")) => {
                    error!("Public key has expired; delete or renew it: {}", err);
                    return Err(err);
                }
                Err(err) => {
                    error!("Unable to verify stored key: {}", err);
                    return Err(err);
                }
            },
            Err(err) => debug!("Unable to load private key: {}", err),
        }

        let bootstrap = active.is_none();
        let inner = Arc::new(Inner {
            store: KeyStore::new(active),
            key_server,
            background: Background::new(BACKGROUND_TASKS),
            key_path,
            rotate_every: config.rotate_every,
            key_bits: config.key_bits,
            on_fatal,
        });

        let publication = if bootstrap {
            debug!("Bootstrapping publication with a new key");
            inner.attempt_publish(None).await
        } else {
            Publication::never()
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle =
            tokio::spawn(Arc::clone(&inner).publish_and_rotate(publication, stop_rx));

        Ok(Self {
            inner,
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn key_path(&self) -> &std::path::Path {
        &self.inner.key_path
    }

    /// The candidate key awaiting confirmation, if a publish is in flight.
    pub fn pending_key(&self) -> Option<Arc<SigningKey>> {
        self.inner.store.pending()
    }
}

#[async_trait]
impl PrivateKey for Autogenerated {
    fn private_key(&self) -> Result<Arc<SigningKey>> {
        self.inner.store.active()
    }

    /// Stops rotating and revokes the pending key, if any. Only the first
    /// call has an effect.
    async fn stop(&self) -> Done {
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stop) = stop else {
            return Done::ready();
        };
        let _ = stop.send(());

        if let Some(pending) = self.inner.store.close() {
            let _ = self.inner.revoke_key(&pending).await;
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Done::new(handle)
    }
}

impl Inner {
    /// Log span carrying the current key ID prefixes.
    fn span(&self) -> Span {
        let (active, pending) = self.store.short_ids();
        info_span!(
            "autogenerated",
            active_key = active.as_deref(),
            pending_key = pending.as_deref()
        )
    }

    /// Generates a candidate, parks it as pending and starts publishing it.
    /// Without a `signer` the candidate signs its own publication.
    async fn attempt_publish(
        self: &Arc<Self>,
        signer: Option<Arc<SigningKey>>,
    ) -> Publication {
        // generation is slow, keep it off the runtime and outside the lock
        let bits = self.key_bits;
        let candidate =
            match tokio::task::spawn_blocking(move || SigningKey::generate(bits))
                .await
            {
                Ok(Ok(key)) => Arc::new(key),
                Ok(Err(err)) => return Publication::ready(Err(err)),
                Err(err) => {
                    return Publication::ready(Err(errors::generate(&err)))
                }
            };

        let public_key = match candidate.public_key() {
            Ok(public_key) => public_key,
            Err(err) => return Publication::ready(Err(err)),
        };
        let policy = match KeyPolicy::new(self.rotate_every, Utc::now()) {
            Ok(policy) => policy,
            Err(err) => return Publication::ready(Err(err)),
        };
        if let Some(rotation) = policy.rotation_policy {
            debug!("Adding rotation policy: {:?}", rotation);
        }

        match self.store.set_pending(Arc::clone(&candidate)) {
            Ok(Some(superseded)) => {
                debug!("Best effort revoking unapproved key due to rotation");
                self.revoke_in_background(superseded);
            }
            Ok(None) => {}
            Err(err) => {
                debug!("Discarding candidate key: {}", err);
                return Publication::never();
            }
        }

        let signer = signer.unwrap_or_else(|| Arc::clone(&candidate));
        self.key_server
            .publish_public_key(&public_key, &policy, &signer)
    }

    async fn revoke_key(&self, key: &SigningKey) -> Result<()> {
        match self.key_server.delete_public_key(key).await {
            Ok(()) => {
                debug!("Successfully revoked pending key {}", key.short_id());
                Ok(())
            }
            Err(err) => {
                error!("Unable to revoke pending key {}: {}", key.short_id(), err);
                Err(errors::revoke(&err))
            }
        }
    }

    fn revoke_in_background(self: &Arc<Self>, key: Arc<SigningKey>) {
        let inner = Arc::clone(self);
        self.background.spawn(async move {
            let _ = inner.revoke_key(&key).await;
        });
    }

    fn save_in_background(&self, key: Arc<SigningKey>) {
        let key_path = self.key_path.clone();
        self.background.spawn(async move {
            if let Err(err) = file::save_private_key(&key, &key_path).await {
                warn!("Unable to save private key: {}", err);
            }
        });
    }
}

/// Builds [`Autogenerated`] from its component config.
#[derive(Debug, Clone, Copy, Default)]
pub struct Factory;

#[async_trait]
impl crate::Constructor for Factory {
    async fn build(
        &self,
        config: &RegistrableComponentConfig,
        params: &SignerParams,
        key_servers: &keyserver::Registry,
    ) -> Result<Arc<dyn PrivateKey>> {
        let config: Config = config.options()?;
        let key_server = key_servers.build(&config.key_server, params)?;
        let manager = Autogenerated::start(config, params, key_server).await?;
        Ok(Arc::new(manager))
    }
}

#[cfg(test)]
mod tests;
