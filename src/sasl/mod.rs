//! The SASL adapter: mechanism negotiation plus the wrap/unwrap hook that
//! every authenticated byte passes through.

pub mod plain;
pub mod scram;

use crate::credentials::CredentialStore;
use crate::error::ArcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha256,
}

impl Mechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
        }
    }
}

impl std::str::FromStr for Mechanism {
    type Err = ArcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            other => Err(ArcError::Auth(format!("unsupported mechanism {other:?}"))),
        }
    }
}

/// Picks the first mechanism in `offered` (the client's `AUTH` payload,
/// comma-separated) that the server also allows, per `allowed` (config's
/// `sasl_mechanisms`). Deterministic on the client's stated preference
/// order.
pub fn negotiate(offered: &str, allowed: &[String]) -> Result<Mechanism, ArcError> {
    for candidate in offered.split(',').map(str::trim) {
        if allowed.iter().any(|m| m.eq_ignore_ascii_case(candidate)) {
            if let Ok(mechanism) = candidate.parse() {
                return Ok(mechanism);
            }
        }
    }
    Err(ArcError::Auth(format!(
        "no mutually supported mechanism in {offered:?}"
    )))
}

/// The server-side state machine driving one mechanism's exchange to
/// completion, advanced one `SASL` round at a time.
pub enum ServerExchange<'a> {
    Plain,
    Scram(scram::ScramServer<'a>),
}

impl<'a> ServerExchange<'a> {
    #[must_use]
    pub fn new(mechanism: Mechanism, store: &'a CredentialStore) -> Self {
        match mechanism {
            Mechanism::Plain => Self::Plain,
            Mechanism::ScramSha256 => Self::Scram(scram::ScramServer::new(store)),
        }
    }

    /// Advances the exchange. `PLAIN` completes in a single round; `SCRAM`
    /// needs two. Returns `(response, done, identity)`; `identity` is only
    /// ever set on the completing round.
    pub fn step(
        &mut self,
        input: &[u8],
        store: &CredentialStore,
    ) -> Result<(Vec<u8>, bool, Option<String>), ArcError> {
        match self {
            Self::Plain => {
                let username = plain::verify_server(input, store)?;
                Ok((Vec::new(), true, Some(username)))
            }
            Self::Scram(state) => state.step(input),
        }
    }
}

/// `wrap`/`unwrap` apply the mechanism's negotiated confidentiality layer.
/// Neither `PLAIN` nor this crate's `SCRAM-SHA-256` negotiates one -- both
/// provide authentication only -- so both are identity passthroughs. A
/// mechanism that *did* negotiate a privacy layer would replace these with
/// real encrypt/decrypt calls without changing any caller.
#[must_use]
pub fn wrap(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

#[must_use]
pub fn unwrap(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips() {
        let data = b"some command output bytes, including \0 nul".to_vec();
        assert_eq!(unwrap(&wrap(&data)), data);
    }

    #[test]
    fn negotiate_picks_the_first_mutually_allowed_mechanism() {
        let allowed = vec!["SCRAM-SHA-256".to_string(), "PLAIN".to_string()];
        assert_eq!(negotiate("PLAIN,SCRAM-SHA-256", &allowed).unwrap(), Mechanism::Plain);
        assert_eq!(negotiate("SCRAM-SHA-256", &allowed).unwrap(), Mechanism::ScramSha256);
    }

    #[test]
    fn negotiate_fails_with_no_overlap() {
        let allowed = vec!["SCRAM-SHA-256".to_string()];
        assert!(negotiate("PLAIN", &allowed).is_err());
    }
}
