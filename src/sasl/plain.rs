//! The `PLAIN` SASL mechanism: a single `\0authzid\0authcid\0password`
//! message, verified against an argon2 PHC hash pulled from `[users]` in the
//! server config.

use argon2::Argon2;
use password_hash::{PasswordHash, PasswordVerifier};

use crate::credentials::CredentialStore;
use crate::error::ArcError;

/// `PLAIN` negotiates no confidentiality/integrity layer, so authentication
/// is single-round: one client message, one server verdict.
pub fn verify_server(message: &[u8], store: &CredentialStore) -> Result<String, ArcError> {
    let mut fields = message.splitn(3, |&b| b == 0);
    let (Some(authzid), Some(authcid), Some(password)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(ArcError::Auth("malformed PLAIN message".into()));
    };

    if !authzid.is_empty() && authzid != authcid {
        return Err(ArcError::Auth("authzid/authcid mismatch".into()));
    }

    let username =
        std::str::from_utf8(authcid).map_err(|_| ArcError::Auth("authcid is not UTF-8".into()))?;

    let hash = store
        .plain_hash(username)
        .ok_or_else(|| ArcError::Auth(format!("no such user {username:?}")))?;
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| ArcError::Internal(format!("bad stored hash: {e}")))?;

    Argon2::default()
        .verify_password(password, &parsed_hash)
        .map_err(|_| ArcError::Auth("bad password".into()))?;

    Ok(username.to_string())
}

/// Builds the client's single `PLAIN` message.
#[must_use]
pub fn client_message(authzid: &str, authcid: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(authzid.len() + authcid.len() + password.len() + 2);
    buf.extend_from_slice(authzid.as_bytes());
    buf.push(0);
    buf.extend_from_slice(authcid.as_bytes());
    buf.push(0);
    buf.extend_from_slice(password.as_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{password_hash::SaltString, PasswordHasher};
    use rand_core::OsRng;

    fn store_with(user: &str, password: &str) -> CredentialStore {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string();
        let ini = crate::config::Ini::parse(&format!("[users]\n{user} = {hash}\n")).unwrap();
        CredentialStore::from_ini(&ini).unwrap()
    }

    #[test]
    fn accepts_the_right_password() {
        let store = store_with("alice", "hunter2");
        let msg = client_message("alice", "alice", "hunter2");
        assert_eq!(verify_server(&msg, &store).unwrap(), "alice");
    }

    #[test]
    fn rejects_the_wrong_password() {
        let store = store_with("alice", "hunter2");
        let msg = client_message("alice", "alice", "wrong");
        assert!(verify_server(&msg, &store).is_err());
    }

    #[test]
    fn rejects_identity_mismatch() {
        let store = store_with("alice", "hunter2");
        let msg = client_message("bob", "alice", "hunter2");
        assert!(verify_server(&msg, &store).is_err());
    }
}
