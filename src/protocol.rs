//! The shared ARC verb vocabulary and expected-next gating.
//!
//! Verbs are dispatched through a static table rather than constructing and
//! evaluating a method name at runtime, and the permitted-next-verb set is a
//! `bitflags!` type for the same reason the log facility mask is: it is a
//! small, fixed, closed vocabulary.

use bitflags::bitflags;

/// The two protocol versions this crate negotiates. They differ only in
/// whether `CMDPORT` (client-listens data channel mode) is accepted;
/// `ARC/2.1` is the richer vocabulary.
///
/// Whether a future `ARC/2.2` adds channel binding is left undecided here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Arc2_0,
    Arc2_1,
}

impl ProtocolVersion {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arc2_0 => "ARC/2.0",
            Self::Arc2_1 => "ARC/2.1",
        }
    }

    #[must_use]
    pub fn supports_cmdport(self) -> bool {
        matches!(self, Self::Arc2_1)
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = crate::error::ArcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARC/2.0" => Ok(Self::Arc2_0),
            "ARC/2.1" => Ok(Self::Arc2_1),
            other => Err(crate::error::ArcError::Protocol(format!(
                "unsupported protocol version {other:?}"
            ))),
        }
    }
}

bitflags! {
    /// The set of verbs a peer is permitted to send as its very next control
    /// message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExpectedNext: u32 {
        const AUTH    = 0b0000_0000_0001;
        const SASL    = 0b0000_0000_0010;
        const OK      = 0b0000_0000_0100;
        const ERR     = 0b0000_0000_1000;
        const CMD     = 0b0000_0001_0000;
        const CMDPASV = 0b0000_0010_0000;
        const CMDPORT = 0b0000_0100_0000;
        const DATA    = 0b0000_1000_0000;
        const EXIT    = 0b0001_0000_0000;
        const QUIT    = 0b0010_0000_0000;
    }
}

/// One ARC control-line verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Auth,
    Sasl,
    Ok,
    Err,
    Cmd,
    CmdPasv,
    CmdPort,
    Data,
    Exit,
    Quit,
}

impl Verb {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::Sasl => "SASL",
            Self::Ok => "OK",
            Self::Err => "ERR",
            Self::Cmd => "CMD",
            Self::CmdPasv => "CMDPASV",
            Self::CmdPort => "CMDPORT",
            Self::Data => "DATA",
            Self::Exit => "EXIT",
            Self::Quit => "QUIT",
        }
    }

    #[must_use]
    pub const fn expected_flag(self) -> ExpectedNext {
        match self {
            Self::Auth => ExpectedNext::AUTH,
            Self::Sasl => ExpectedNext::SASL,
            Self::Ok => ExpectedNext::OK,
            Self::Err => ExpectedNext::ERR,
            Self::Cmd => ExpectedNext::CMD,
            Self::CmdPasv => ExpectedNext::CMDPASV,
            Self::CmdPort => ExpectedNext::CMDPORT,
            Self::Data => ExpectedNext::DATA,
            Self::Exit => ExpectedNext::EXIT,
            Self::Quit => ExpectedNext::QUIT,
        }
    }
}

impl std::str::FromStr for Verb {
    type Err = crate::error::ArcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "AUTH" => Self::Auth,
            "SASL" => Self::Sasl,
            "OK" => Self::Ok,
            "ERR" => Self::Err,
            "CMD" => Self::Cmd,
            "CMDPASV" => Self::CmdPasv,
            "CMDPORT" => Self::CmdPort,
            "DATA" => Self::Data,
            "EXIT" => Self::Exit,
            "QUIT" => Self::Quit,
            other => {
                return Err(crate::error::ArcError::Protocol(format!(
                    "unrecognised verb {other:?}"
                )))
            }
        })
    }
}

/// A single decoded control line: a verb plus its optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    pub verb: Verb,
    pub payload: Option<String>,
}

impl ControlLine {
    #[must_use]
    pub fn new(verb: Verb, payload: Option<impl Into<String>>) -> Self {
        Self {
            verb,
            payload: payload.map(Into::into),
        }
    }

    /// Parses `VERB[ SPACE payload]` (CRLF already stripped by the codec).
    pub fn parse(line: &str, version: ProtocolVersion) -> Result<Self, crate::error::ArcError> {
        let (verb_str, payload) = match line.split_once(' ') {
            Some((v, p)) => (v, Some(p.to_string())),
            None => (line, None),
        };

        let verb: Verb = verb_str.parse()?;
        if verb == Verb::CmdPort && !version.supports_cmdport() {
            return Err(crate::error::ArcError::Protocol(format!(
                "CMDPORT is not in the {} vocabulary",
                version.as_str()
            )));
        }

        Ok(Self { verb, payload })
    }

    /// Renders back to `VERB[ SPACE payload]`, without the trailing CRLF
    /// (the codec appends that).
    #[must_use]
    pub fn render(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{} {payload}", self.verb.as_str()),
            None => self.verb.as_str().to_string(),
        }
    }

    /// Checks `self.verb` against the currently permitted set,
    /// short-circuiting to failure on a mismatch.
    pub fn check_expected(&self, expected: ExpectedNext) -> Result<(), crate::error::ArcError> {
        if expected.contains(self.verb.expected_flag()) {
            Ok(())
        } else {
            Err(crate::error::ArcError::Protocol(format!(
                "unexpected verb {} (expected one of {expected:?})",
                self.verb.as_str()
            )))
        }
    }
}
