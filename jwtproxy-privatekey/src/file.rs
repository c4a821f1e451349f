use std::path::{Path, PathBuf};

use jsonwebkey as jwk;
use rsa::{BigUint, RsaPrivateKey};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use jwtproxy_keyserver::SigningKey;
use jwtproxy_slo::{errors, Result};

const KEY_FOLDER: &str = "jwtproxy";
const RSA_EXPONENT: u32 = 65537;

/// `<folder>/<issuer>.jwk`, the folder defaulting to the user's config dir.
pub fn key_path(folder: Option<&Path>, issuer: &str) -> Result<PathBuf> {
    if issuer.is_empty() {
        return Err(errors::config("issuer must not be empty"));
    }
    let folder = match folder {
        Some(folder) => folder.to_path_buf(),
        None => dirs::config_dir()
            .ok_or_else(|| {
                errors::config("unable to determine the config directory")
            })?
            .join(KEY_FOLDER),
    };
    let name = issuer.replace(['/', '\\'], "_");
    Ok(folder.join(format!("{name}.jwk")))
}

pub async fn load_private_key(path: &Path) -> Result<SigningKey> {
    let content = fs::read(path).await.map_err(|err| errors::key_load(&err))?;
    let jwk: jwk::JsonWebKey =
        serde_json::from_slice(&content).map_err(|err| errors::key_load(&err))?;
    let key_id = jwk
        .key_id
        .clone()
        .ok_or_else(|| errors::key_load("key file has no key ID"))?;

    let mut private_key = match &*jwk.key {
        jwk::Key::RSA {
            public,
            private: Some(private),
        } => {
            let (Some(p), Some(q)) = (&private.p, &private.q) else {
                return Err(errors::key_load("key file has no prime factors"));
            };
            RsaPrivateKey::from_components(
                BigUint::from_bytes_be(&public.n),
                BigUint::from(RSA_EXPONENT),
                BigUint::from_bytes_be(&private.d),
                vec![BigUint::from_bytes_be(p), BigUint::from_bytes_be(q)],
            )
            .map_err(|err| errors::key_load(&err))?
        }
        _ => return Err(errors::key_load("key file is not an RSA private key")),
    };
    private_key
        .validate()
        .map_err(|err| errors::key_load(&err))?;
    private_key
        .precompute()
        .map_err(|err| errors::key_load(&err))?;

    Ok(SigningKey::with_key_id(key_id, private_key))
}

/// Writes the key readable by the owner only, creating parent directories.
pub async fn save_private_key(key: &SigningKey, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| errors::persist(&err))?;
    }

    let content =
        serde_json::to_vec(&key.to_jwk()?).map_err(|err| errors::persist(&err))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .map_err(|err| errors::persist(&err))?;

    // mode only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|err| errors::persist(&err))?;
    }

    file.write_all(&content)
        .await
        .map_err(|err| errors::persist(&err))?;
    file.flush().await.map_err(|err| errors::persist(&err))?;
    debug!("Successfully saved private key to: {}", path.display());
    Ok(())
}
