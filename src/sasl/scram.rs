//! `SCRAM-SHA-256` (RFC 5802), hand-implemented over `sha2`/`hmac`/`pbkdf2`/
//! `getrandom` rather than pulling in a higher-level SASL/SCRAM crate of
//! uncertain shape.
//!
//! This is a minimal SCRAM: no channel binding, no authzid, a fixed GS2
//! header of `n,,`. It provides authentication only -- it negotiates no
//! confidentiality/integrity layer, so `wrap`/`unwrap` stay identity
//! passthroughs once it completes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::credentials::{CredentialStore, ScramCredentials};
use crate::error::ArcError;

const GS2_HEADER: &str = "n,,";

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn random_nonce() -> Result<String, ArcError> {
    let mut bytes = [0u8; 18];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| ArcError::Internal(format!("failed to read randomness: {e}")))?;
    Ok(BASE64.encode(bytes))
}

fn parse_fields(message: &str) -> std::collections::HashMap<char, String> {
    message
        .split(',')
        .filter_map(|field| {
            let mut parts = field.splitn(2, '=');
            let key = parts.next()?.chars().next()?;
            let value = parts.next()?.to_string();
            Some((key, value))
        })
        .collect()
}

/// The server half of the exchange, driven one `step()` per round.
pub struct ScramServer<'a> {
    store: &'a CredentialStore,
    state: ServerState,
}

enum ServerState {
    AwaitClientFirst,
    AwaitClientFinal {
        username: String,
        auth_message_prefix: String,
        server_nonce: String,
        creds: ScramCredentials,
    },
    Done,
}

impl<'a> ScramServer<'a> {
    #[must_use]
    pub fn new(store: &'a CredentialStore) -> Self {
        Self {
            store,
            state: ServerState::AwaitClientFirst,
        }
    }

    /// Advances the exchange by one round. Returns `(response, done)`; once
    /// `done` is true the returned `username` accompanies the final
    /// response and authentication has succeeded.
    pub fn step(&mut self, input: &[u8]) -> Result<(Vec<u8>, bool, Option<String>), ArcError> {
        match std::mem::replace(&mut self.state, ServerState::Done) {
            ServerState::AwaitClientFirst => {
                let message = std::str::from_utf8(input)
                    .map_err(|_| ArcError::Auth("client-first is not UTF-8".into()))?;
                let bare = message
                    .strip_prefix(GS2_HEADER)
                    .ok_or_else(|| ArcError::Auth("unsupported GS2 header".into()))?;
                let fields = parse_fields(bare);
                let username = fields
                    .get(&'n')
                    .ok_or_else(|| ArcError::Auth("client-first missing username".into()))?
                    .clone();
                let client_nonce = fields
                    .get(&'r')
                    .ok_or_else(|| ArcError::Auth("client-first missing nonce".into()))?
                    .clone();

                let creds = self
                    .store
                    .scram(&username)
                    .ok_or_else(|| ArcError::Auth(format!("no such user {username:?}")))?
                    .clone();

                let server_nonce = format!("{client_nonce}{}", random_nonce()?);
                let server_first = format!(
                    "r={server_nonce},s={},i={}",
                    BASE64.encode(&creds.salt),
                    creds.iterations
                );

                let auth_message_prefix = format!("{bare},{server_first},");

                self.state = ServerState::AwaitClientFinal {
                    username,
                    auth_message_prefix,
                    server_nonce,
                    creds,
                };

                Ok((server_first.into_bytes(), false, None))
            }
            ServerState::AwaitClientFinal {
                username,
                auth_message_prefix,
                server_nonce,
                creds,
            } => {
                let message = std::str::from_utf8(input)
                    .map_err(|_| ArcError::Auth("client-final is not UTF-8".into()))?;
                let fields = parse_fields(message);
                let nonce = fields
                    .get(&'r')
                    .ok_or_else(|| ArcError::Auth("client-final missing nonce".into()))?;
                if *nonce != server_nonce {
                    return Err(ArcError::Auth("nonce mismatch".into()));
                }
                let proof_b64 = fields
                    .get(&'p')
                    .ok_or_else(|| ArcError::Auth("client-final missing proof".into()))?;
                let proof: [u8; 32] = BASE64
                    .decode(proof_b64)
                    .map_err(|_| ArcError::Auth("malformed proof".into()))?
                    .try_into()
                    .map_err(|_| ArcError::Auth("proof has the wrong length".into()))?;

                let without_proof_end = message
                    .rfind(",p=")
                    .ok_or_else(|| ArcError::Auth("client-final missing proof field".into()))?;
                let client_final_without_proof = &message[..without_proof_end];
                let auth_message =
                    format!("{auth_message_prefix}{client_final_without_proof}");

                let client_signature = hmac_sha256(&creds.stored_key, auth_message.as_bytes());
                let recovered_client_key = xor(&proof, &client_signature);
                let recovered_stored_key: [u8; 32] =
                    Sha256::digest(recovered_client_key).into();

                if recovered_stored_key != creds.stored_key {
                    return Err(ArcError::Auth("SCRAM verification failed".into()));
                }

                let server_signature = hmac_sha256(&creds.server_key, auth_message.as_bytes());
                let server_final = format!("v={}", BASE64.encode(server_signature));

                self.state = ServerState::Done;
                Ok((server_final.into_bytes(), true, Some(username)))
            }
            ServerState::Done => Err(ArcError::Internal("SCRAM exchange already complete".into())),
        }
    }
}

/// The client half of the exchange.
pub struct ScramClient {
    username: String,
    password: Vec<u8>,
    client_nonce: String,
    state: ClientState,
}

enum ClientState {
    Initial,
    AwaitServerFirst { client_first_bare: String },
    AwaitServerFinal { server_signature: [u8; 32] },
    Done,
}

impl ScramClient {
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Result<Self, ArcError> {
        Ok(Self {
            username: username.into(),
            password: password.into(),
            client_nonce: random_nonce()?,
            state: ClientState::Initial,
        })
    }

    /// Produces the client-first message that kicks off the exchange.
    pub fn first_message(&mut self) -> Vec<u8> {
        let bare = format!("n={},r={}", self.username, self.client_nonce);
        self.state = ClientState::AwaitServerFirst {
            client_first_bare: bare.clone(),
        };
        format!("{GS2_HEADER}{bare}").into_bytes()
    }

    /// Feeds in the server's response and returns the client's next
    /// message plus whether the exchange is now complete.
    pub fn step(&mut self, input: &[u8]) -> Result<(Vec<u8>, bool), ArcError> {
        match std::mem::replace(&mut self.state, ClientState::Done) {
            ClientState::AwaitServerFirst { client_first_bare } => {
                let server_first = std::str::from_utf8(input)
                    .map_err(|_| ArcError::Auth("server-first is not UTF-8".into()))?
                    .to_string();
                let fields = parse_fields(&server_first);
                let nonce = fields
                    .get(&'r')
                    .ok_or_else(|| ArcError::Auth("server-first missing nonce".into()))?;
                if !nonce.starts_with(&self.client_nonce) {
                    return Err(ArcError::Auth("server nonce does not extend ours".into()));
                }
                let salt = BASE64
                    .decode(
                        fields
                            .get(&'s')
                            .ok_or_else(|| ArcError::Auth("server-first missing salt".into()))?,
                    )
                    .map_err(|_| ArcError::Auth("malformed salt".into()))?;
                let iterations: u32 = fields
                    .get(&'i')
                    .ok_or_else(|| ArcError::Auth("server-first missing iteration count".into()))?
                    .parse()
                    .map_err(|_| ArcError::Auth("malformed iteration count".into()))?;

                let mut salted_password = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(&self.password, &salt, iterations, &mut salted_password);

                let client_key = hmac_sha256(&salted_password, b"Client Key");
                let stored_key: [u8; 32] = Sha256::digest(client_key).into();
                let server_key = hmac_sha256(&salted_password, b"Server Key");

                let client_final_without_proof = format!("c={},r={nonce}", BASE64.encode("n,,"));
                let auth_message =
                    format!("{client_first_bare},{server_first},{client_final_without_proof}");

                let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
                let proof = xor(&client_key, &client_signature);
                let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

                let client_final =
                    format!("{client_final_without_proof},p={}", BASE64.encode(proof));

                self.state = ClientState::AwaitServerFinal { server_signature };
                Ok((client_final.into_bytes(), false))
            }
            ClientState::AwaitServerFinal { server_signature } => {
                let server_final = std::str::from_utf8(input)
                    .map_err(|_| ArcError::Auth("server-final is not UTF-8".into()))?;
                let fields = parse_fields(server_final);
                let v = fields
                    .get(&'v')
                    .ok_or_else(|| ArcError::Auth("server-final missing verifier".into()))?;
                let given: [u8; 32] = BASE64
                    .decode(v)
                    .map_err(|_| ArcError::Auth("malformed server verifier".into()))?
                    .try_into()
                    .map_err(|_| ArcError::Auth("server verifier has the wrong length".into()))?;
                if given != server_signature {
                    return Err(ArcError::Auth("server signature mismatch".into()));
                }
                self.state = ClientState::Done;
                Ok((Vec::new(), true))
            }
            ClientState::Initial | ClientState::Done => {
                Err(ArcError::Internal("SCRAM client stepped out of order".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::derive_scram_credentials;

    fn store_with(user: &str, password: &str) -> CredentialStore {
        let creds = derive_scram_credentials(password.as_bytes(), b"fixed-test-salt", 4096);
        let ini = crate::config::Ini::parse(&format!(
            "[scram]\n{user} = {}:{}:{}:{}\n",
            BASE64.encode(&creds.salt),
            creds.iterations,
            BASE64.encode(creds.stored_key),
            BASE64.encode(creds.server_key),
        ))
        .unwrap();
        CredentialStore::from_ini(&ini).unwrap()
    }

    #[test]
    fn full_exchange_succeeds_with_the_right_password() {
        let store = store_with("alice", "hunter2");
        let mut server = ScramServer::new(&store);
        let mut client = ScramClient::new("alice", "hunter2").unwrap();

        let first = client.first_message();
        let (server_first, done, _) = server.step(&first).unwrap();
        assert!(!done);

        let (client_final, done) = client.step(&server_first).unwrap();
        assert!(!done);

        let (server_final, done, username) = server.step(&client_final).unwrap();
        assert!(done);
        assert_eq!(username.as_deref(), Some("alice"));

        let (_, done) = client.step(&server_final).unwrap();
        assert!(done);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let store = store_with("alice", "hunter2");
        let mut server = ScramServer::new(&store);
        let mut client = ScramClient::new("alice", "wrong-password").unwrap();

        let first = client.first_message();
        let (server_first, _, _) = server.step(&first).unwrap();
        let (client_final, _) = client.step(&server_first).unwrap();

        assert!(server.step(&client_final).is_err());
    }
}
