use std::fmt;

use base64::engine::{general_purpose, Engine};
use jsonwebkey as jwk;
use rsa::{
    traits::{PrivateKeyParts, PublicKeyParts},
    RsaPrivateKey,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use jwtproxy_slo::{errors, Result};

/// Length of the key ID prefix used in log fields.
const SHORT_ID_LEN: usize = 10;

/// An RSA private key together with its key ID.
///
/// The key ID is the RFC 7638 thumbprint of the public half, so two
/// `SigningKey`s with the same ID share the same modulus.
#[derive(Clone, PartialEq)]
pub struct SigningKey {
    key_id: String,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generates a fresh key of `bits` modulus size. CPU heavy, callers in
    /// async code should run it on the blocking pool.
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|err| errors::generate(&err))?;
        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self {
            key_id: thumbprint(&private_key),
            private_key,
        }
    }

    /// Keeps a stored key ID as is, used when reading persisted keys.
    pub fn with_key_id(key_id: String, private_key: RsaPrivateKey) -> Self {
        Self {
            key_id,
            private_key,
        }
    }

    pub fn id(&self) -> &str {
        &self.key_id
    }

    pub fn short_id(&self) -> &str {
        self.key_id.get(..SHORT_ID_LEN).unwrap_or(&self.key_id)
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Full JWK, private parameters included.
    pub fn to_jwk(&self) -> Result<jwk::JsonWebKey> {
        let private_key = &self.private_key;
        let mut p = None;
        let mut q = None;
        let primes = private_key.primes();
        match primes.len() {
            1 => {
                p = Some(primes[0].to_bytes_be().into());
            }
            2 => {
                p = Some(primes[0].to_bytes_be().into());
                q = Some(primes[1].to_bytes_be().into());
            }
            _ => {}
        }
        let key = jwk::Key::RSA {
            public: jwk::RsaPublic {
                e: jwk::PublicExponent,
                n: private_key.n().to_bytes_be().into(),
            },
            private: Some(jwk::RsaPrivate {
                d: private_key.d().to_bytes_be().into(),
                p,
                q,
                dp: private_key.dp().map(|v| v.to_bytes_be().into()),
                dq: private_key.dq().map(|v| v.to_bytes_be().into()),
                qi: private_key
                    .qinv()
                    .and_then(|v| v.to_biguint())
                    .map(|v| v.to_bytes_be().into()),
            }),
        };

        let mut signing_key = jwk::JsonWebKey::new(key);
        signing_key
            .set_algorithm(jwk::Algorithm::RS256)
            .map_err(errors::any)?;
        signing_key.key_use = Some(jwk::KeyUse::Signing);
        signing_key.key_id = Some(self.key_id.clone());
        Ok(signing_key)
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        let mut jwk = self.to_jwk()?;
        jwk.key = Box::new(match &*jwk.key {
            jwk::Key::RSA { public, .. } => jwk::Key::RSA {
                public: public.clone(),
                private: None,
            },
            _ => return Err(errors::generate("signing key is not an RSA key")),
        });
        Ok(PublicKey { jwk })
    }
}

/// Public half of a [`SigningKey`], as handed to the key server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PublicKey {
    jwk: jwk::JsonWebKey,
}

impl PublicKey {
    pub fn id(&self) -> Option<&str> {
        self.jwk.key_id.as_deref()
    }

    pub fn jwk(&self) -> &jwk::JsonWebKey {
        &self.jwk
    }
}

/// RFC 7638 thumbprint: SHA-256 over the lexicographically ordered
/// `e`, `kty`, `n` members, base64url encoded.
pub fn thumbprint<K: PublicKeyParts>(key: &K) -> String {
    let canonical = format!(
        r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
        general_purpose::URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        general_purpose::URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
    );
    general_purpose::URL_SAFE.encode(Sha256::digest(canonical.as_bytes()))
}
