use std::{path::Path, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use jwtproxy_keyserver::{
    KeyPolicy, MockKeyServer, Publication, Publisher, RegistrableComponentConfig,
    SignerParams, SigningKey,
};
use jwtproxy_slo::{errors, errors::WithBacktrace, Result};

use super::{Autogenerated, Config, FatalHook};
use crate::{file, PrivateKey};

const ISSUER: &str = "jwtproxy";
const HOUR: Duration = Duration::from_secs(60 * 60);

struct Published {
    key_id: String,
    signer_id: String,
    policy: KeyPolicy,
    publisher: Publisher,
}

struct Calls {
    published: mpsc::UnboundedReceiver<Published>,
    revoked: mpsc::UnboundedReceiver<String>,
}

fn key_server<V>(verify: V) -> (Arc<MockKeyServer>, Calls)
where
    V: Fn(&str) -> Result<()> + Send + 'static,
{
    let mut server = MockKeyServer::new();
    server
        .expect_verify_public_key()
        .returning(move |key_id| verify(key_id));

    let (published_tx, published) = mpsc::unbounded_channel();
    server
        .expect_publish_public_key()
        .returning(move |public_key, policy, signer| {
            let (publication, publisher) = Publication::pending();
            let _ = published_tx.send(Published {
                key_id: public_key.id().unwrap_or_default().to_owned(),
                signer_id: signer.id().to_owned(),
                policy: *policy,
                publisher,
            });
            publication
        });

    let (revoked_tx, revoked) = mpsc::unbounded_channel();
    server.expect_delete_public_key().returning(move |key| {
        let _ = revoked_tx.send(key.id().to_owned());
        Ok(())
    });

    (Arc::new(server), Calls { published, revoked })
}

fn config(dir: &Path, rotate_every: Duration) -> Config {
    Config {
        rotate_every,
        key_folder: Some(dir.to_path_buf()),
        key_bits: 512,
        ..Config::new(RegistrableComponentConfig::new("mock"))
    }
}

fn fatal_recorder() -> (FatalHook, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: FatalHook = Arc::new(move |err: &WithBacktrace| {
        let _ = tx.send(err.to_string());
    });
    (hook, rx)
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(
    config: Config,
    server: Arc<MockKeyServer>,
) -> Result<Autogenerated> {
    init_logging();
    let (hook, _) = fatal_recorder();
    Autogenerated::start_with_hook(config, &SignerParams::new(ISSUER), server, hook)
        .await
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn stored_key(dir: &Path) -> SigningKey {
    let key = SigningKey::generate(512).unwrap();
    let path = file::key_path(Some(dir), ISSUER).unwrap();
    file::save_private_key(&key, &path).await.unwrap();
    key
}

#[test]
fn config_defaults() {
    let config: Config = toml::from_str(
        r#"
        [key_server]
        type = "keyregistry"
        "#,
    )
    .unwrap();
    assert_eq!(config.rotate_every, Duration::from_secs(12 * 60 * 60));
    assert_eq!(config.key_bits, 2048);
    assert!(config.key_folder.is_none());
    assert_eq!(config.key_server.kind, "keyregistry");

    let config: Config = toml::from_str(
        r#"
        rotate_every = "0s"
        key_folder = "/var/lib/jwtproxy"

        [key_server]
        type = "keyregistry"
        "#,
    )
    .unwrap();
    assert!(config.rotate_every.is_zero());
    assert_eq!(
        config.key_folder.as_deref(),
        Some(Path::new("/var/lib/jwtproxy"))
    );
}

#[tokio::test]
async fn bootstrap_self_signs_once_without_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) =
        key_server(|_| panic!("nothing stored, nothing to verify"));

    let manager = start(config(dir.path(), Duration::ZERO), server)
        .await
        .unwrap();
    assert_eq!(manager.private_key().unwrap_err(), errors::no_active_key());

    let first = calls.published.recv().await.unwrap();
    assert_eq!(first.signer_id, first.key_id);
    assert_eq!(first.policy, KeyPolicy::default());
    assert_eq!(manager.pending_key().unwrap().id(), first.key_id);

    first.publisher.resolve(Ok(()));
    eventually(|| manager.private_key().is_ok()).await;
    assert_eq!(manager.private_key().unwrap().id(), first.key_id);
    assert!(manager.pending_key().is_none());

    let key_path = manager.key_path().to_path_buf();
    for _ in 0..500 {
        if let Ok(saved) = file::load_private_key(&key_path).await {
            assert_eq!(saved.id(), first.key_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(key_path.exists());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.published.try_recv().is_err());

    manager.stop().await.wait().await;
    assert!(calls.revoked.try_recv().is_err());
}

#[tokio::test]
async fn verified_stored_key_is_active() {
    let dir = tempfile::tempdir().unwrap();
    let stored = stored_key(dir.path()).await;
    let expected = stored.id().to_owned();
    let (server, mut calls) = key_server(move |key_id| {
        assert_eq!(key_id, expected);
        Ok(())
    });

    let manager = start(config(dir.path(), HOUR), server).await.unwrap();
    assert_eq!(manager.private_key().unwrap().id(), stored.id());
    assert!(manager.pending_key().is_none());
    assert!(calls.published.try_recv().is_err());

    manager.stop().await.wait().await;
}

#[tokio::test]
async fn unknown_stored_key_bootstraps() {
    let dir = tempfile::tempdir().unwrap();
    let stored = stored_key(dir.path()).await;
    let (server, mut calls) =
        key_server(|_| Err(errors::not_found("unknown key")));

    let manager = start(config(dir.path(), Duration::ZERO), server)
        .await
        .unwrap();

    let first = calls.published.recv().await.unwrap();
    assert_ne!(first.key_id, stored.id());
    assert_eq!(first.signer_id, first.key_id);

    // the stale file stays until a new key replaces it
    let on_disk = file::load_private_key(manager.key_path()).await.unwrap();
    assert_eq!(on_disk.id(), stored.id());

    manager.stop().await.wait().await;
}

#[tokio::test]
async fn expired_stored_key_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    stored_key(dir.path()).await;
    let (server, mut calls) =
        key_server(|_| Err(errors::expired("expired yesterday")));

    let err = start(config(dir.path(), HOUR), server).await.unwrap_err();
    assert_eq!(err, errors::expired(""));
    assert!(calls.published.try_recv().is_err());
}

#[tokio::test]
async fn failed_verification_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    stored_key(dir.path()).await;
    let (server, mut calls) = key_server(|_| {
        Err(errors::anyhow(anyhow::anyhow!("key server unavailable")))
    });

    assert!(start(config(dir.path(), HOUR), server).await.is_err());
    assert!(calls.published.try_recv().is_err());
}

#[tokio::test]
async fn unreadable_stored_key_bootstraps() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = file::key_path(Some(dir.path()), ISSUER).unwrap();
    std::fs::write(&key_path, b"not a key").unwrap();
    let (server, mut calls) = key_server(|_| panic!("unreadable key verified"));

    let manager = start(config(dir.path(), Duration::ZERO), server)
        .await
        .unwrap();
    let first = calls.published.recv().await.unwrap();
    assert_eq!(first.signer_id, first.key_id);

    manager.stop().await.wait().await;
}

#[tokio::test]
async fn publish_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) = key_server(|_| Ok(()));
    let (hook, mut fatal) = fatal_recorder();

    let manager = Autogenerated::start_with_hook(
        config(dir.path(), Duration::ZERO),
        &SignerParams::new(ISSUER),
        server,
        hook,
    )
    .await
    .unwrap();

    let first = calls.published.recv().await.unwrap();
    first.publisher.resolve(Err(errors::publish("signature rejected")));

    let reason = fatal.recv().await.unwrap();
    assert!(reason.contains("signature rejected"));
    assert_eq!(manager.private_key().unwrap_err(), errors::no_active_key());

    manager.stop().await.wait().await;
}

#[tokio::test]
async fn stop_revokes_pending_key_once() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) = key_server(|_| Ok(()));

    let manager = start(config(dir.path(), Duration::ZERO), server)
        .await
        .unwrap();
    let first = calls.published.recv().await.unwrap();

    let done = manager.stop().await;
    // revoked before stop returned
    assert_eq!(calls.revoked.try_recv().unwrap(), first.key_id);
    assert!(manager.pending_key().is_none());

    done.wait().await;
    assert!(first.publisher.is_canceled());
    assert!(calls.revoked.try_recv().is_err());

    // a late confirmation changes nothing
    first.publisher.resolve(Ok(()));
    assert_eq!(manager.private_key().unwrap_err(), errors::no_active_key());
    assert!(manager.stop().await.is_finished());
}

#[tokio::test(start_paused = true)]
async fn rotation_supersedes_unconfirmed_key() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) = key_server(|_| Ok(()));

    let manager = start(config(dir.path(), HOUR), server).await.unwrap();
    let first = calls.published.recv().await.unwrap();
    assert_eq!(first.policy.rotation_policy, Some(HOUR));
    assert!(first.policy.expiration.is_some());

    // the clock advances to the next tick while nothing else is runnable
    let second = calls.published.recv().await.unwrap();
    assert!(first.publisher.is_canceled());
    assert_ne!(second.key_id, first.key_id);
    // still no active key, so the candidate signs itself
    assert_eq!(second.signer_id, second.key_id);
    assert_eq!(manager.pending_key().unwrap().id(), second.key_id);
    assert_eq!(calls.revoked.recv().await.unwrap(), first.key_id);

    // a late confirmation of the superseded key is dropped
    first.publisher.resolve(Ok(()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.private_key().unwrap_err(), errors::no_active_key());
    assert_eq!(manager.pending_key().unwrap().id(), second.key_id);

    second.publisher.resolve(Ok(()));
    eventually(|| manager.private_key().is_ok()).await;
    assert_eq!(manager.private_key().unwrap().id(), second.key_id);

    manager.stop().await.wait().await;
    assert!(calls.revoked.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn rotation_after_stop_publishes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) = key_server(|_| Ok(()));

    let manager = start(config(dir.path(), HOUR), server).await.unwrap();
    let first = calls.published.recv().await.unwrap();

    manager.stop().await.wait().await;
    assert_eq!(calls.revoked.try_recv().unwrap(), first.key_id);

    // a tick that lands once the store is closed
    let mut publication = manager.inner.attempt_publish(None).await;
    assert!(
        tokio::time::timeout(HOUR, publication.result())
            .await
            .is_err()
    );
    assert!(calls.published.try_recv().is_err());
    assert!(manager.pending_key().is_none());
    assert!(calls.revoked.try_recv().is_err());
    assert_eq!(manager.private_key().unwrap_err(), errors::no_active_key());
}

#[tokio::test(start_paused = true)]
async fn rotation_is_signed_by_active_key() {
    let dir = tempfile::tempdir().unwrap();
    let (server, mut calls) = key_server(|_| Ok(()));

    let manager = start(config(dir.path(), HOUR), server).await.unwrap();
    let first = calls.published.recv().await.unwrap();
    first.publisher.resolve(Ok(()));
    eventually(|| manager.private_key().is_ok()).await;

    let second = calls.published.recv().await.unwrap();
    assert_eq!(second.signer_id, first.key_id);
    assert_eq!(manager.private_key().unwrap().id(), first.key_id);

    second.publisher.resolve(Ok(()));
    eventually(|| {
        manager
            .private_key()
            .map(|key| key.id() == second.key_id)
            .unwrap_or(false)
    })
    .await;
    assert!(manager.pending_key().is_none());
    assert!(calls.revoked.try_recv().is_err());

    manager.stop().await.wait().await;
}
