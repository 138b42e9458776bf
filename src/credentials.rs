//! Per-user credential storage backing the SASL mechanisms.
//!
//! Credentials are deliberately config-driven rather than backed by a
//! database -- there is no persisted state beyond the PID file -- so they
//! live in the same INI file as everything else: a `[users]` section holds
//! one argon2 PHC hash per user for `PLAIN`, and an optional `[scram]`
//! section holds precomputed SCRAM-SHA-256 parameters for users who have
//! provisioned that mechanism.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::config::Ini;
use crate::error::ArcError;

/// Precomputed SCRAM-SHA-256 parameters for one user (RFC 5802 terms).
#[derive(Debug, Clone)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    plain_hashes: HashMap<String, String>,
    scram: HashMap<String, ScramCredentials>,
}

impl CredentialStore {
    pub fn from_ini(ini: &Ini) -> Result<Self, ArcError> {
        let plain_hashes = ini
            .section("users")
            .cloned()
            .unwrap_or_default();

        let mut scram = HashMap::new();
        if let Some(section) = ini.section("scram") {
            for (user, value) in section {
                scram.insert(user.clone(), parse_scram_entry(value)?);
            }
        }

        Ok(Self { plain_hashes, scram })
    }

    #[must_use]
    pub fn plain_hash(&self, user: &str) -> Option<&str> {
        self.plain_hashes.get(user).map(String::as_str)
    }

    #[must_use]
    pub fn scram(&self, user: &str) -> Option<&ScramCredentials> {
        self.scram.get(user)
    }
}

/// Parses `base64(salt):iterations:base64(stored_key):base64(server_key)`.
fn parse_scram_entry(value: &str) -> Result<ScramCredentials, ArcError> {
    let mut parts = value.split(':');
    let bad = || ArcError::Config("malformed [scram] entry".into());

    let salt = BASE64
        .decode(parts.next().ok_or_else(bad)?)
        .map_err(|_| bad())?;
    let iterations: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let stored_key: [u8; 32] = BASE64
        .decode(parts.next().ok_or_else(bad)?)
        .map_err(|_| bad())?
        .try_into()
        .map_err(|_| bad())?;
    let server_key: [u8; 32] = BASE64
        .decode(parts.next().ok_or_else(bad)?)
        .map_err(|_| bad())?
        .try_into()
        .map_err(|_| bad())?;

    Ok(ScramCredentials {
        salt,
        iterations,
        stored_key,
        server_key,
    })
}

/// Derives the `[scram]` config line for a plaintext password, for
/// operators provisioning a new user. Not wired to any CLI surface -- the
/// spec treats user provisioning as out of scope -- but kept here since the
/// derivation and the verification in `sasl::scram` must agree bit-for-bit.
#[must_use]
pub fn derive_scram_credentials(password: &[u8], salt: &[u8], iterations: u32) -> ScramCredentials {
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    let mut salted_password = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut salted_password);

    let mut client_key_mac =
        Hmac::<Sha256>::new_from_slice(&salted_password).expect("hmac accepts any key length");
    client_key_mac.update(b"Client Key");
    let client_key = client_key_mac.finalize().into_bytes();

    let stored_key: [u8; 32] = Sha256::digest(client_key).into();

    let mut server_key_mac =
        Hmac::<Sha256>::new_from_slice(&salted_password).expect("hmac accepts any key length");
    server_key_mac.update(b"Server Key");
    let server_key: [u8; 32] = server_key_mac.finalize().into_bytes().into();

    ScramCredentials {
        salt: salt.to_vec(),
        iterations,
        stored_key,
        server_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_scram_entry() {
        let creds = derive_scram_credentials(b"hunter2", b"some-salt", 4096);
        let encoded = format!(
            "{}:{}:{}:{}",
            BASE64.encode(&creds.salt),
            creds.iterations,
            BASE64.encode(creds.stored_key),
            BASE64.encode(creds.server_key),
        );
        let parsed = parse_scram_entry(&encoded).unwrap();
        assert_eq!(parsed.stored_key, creds.stored_key);
        assert_eq!(parsed.server_key, creds.server_key);
        assert_eq!(parsed.iterations, 4096);
    }
}
