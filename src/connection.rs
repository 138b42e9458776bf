//! The shared connection state machine.
//!
//! A single concrete `Connection` parameterized by a `Role` tag rather than
//! a client/server class hierarchy: no runtime type introspection, just a
//! tag plus whichever role-specific driver (`client.rs` / `server::mod`)
//! the caller invokes methods from.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::LineCodec;
use crate::data_channel::DataChannel;
use crate::error::{ArcError, ErrorCarrier};
use crate::log::{emit, Facility};
use crate::protocol::{ControlLine, ExpectedNext, ProtocolVersion, Verb};
use crate::sasl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The connection-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Negotiating,
    Authed,
    DataSetup,
    Relay,
    Closed,
}

/// Wraps the raw CRLF-framed socket with the post-authentication
/// SASL-wrap + base64 step. Control lines use base64 to remain line-safe.
pub struct ControlChannel {
    framed: Framed<TcpStream, LineCodec>,
    wrapped: bool,
}

impl ControlChannel {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, LineCodec),
            wrapped: false,
        }
    }

    /// Authentication has completed: every subsequent line is
    /// SASL-wrapped then base64-encoded (and the reverse on receive).
    pub fn mark_authenticated(&mut self) {
        self.wrapped = true;
    }

    pub async fn recv_line(&mut self, timeout_seconds: u64) -> Result<Option<String>, ArcError> {
        use futures::StreamExt;

        let fut = self.framed.next();
        let result = timeout(Duration::from_secs(timeout_seconds), fut)
            .await
            .map_err(|_| ArcError::Timeout(timeout_seconds))?;

        match result {
            None => Ok(None),
            Some(Ok(line)) if self.wrapped => {
                let decoded = BASE64
                    .decode(line)
                    .map_err(|e| ArcError::Protocol(format!("bad base64 on wire: {e}")))?;
                let unwrapped = sasl::unwrap(&decoded);
                String::from_utf8(unwrapped)
                    .map(Some)
                    .map_err(|e| ArcError::Protocol(format!("non-UTF8 line: {e}")))
            }
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ArcError::PeerClosed)
            }
            Some(Err(e)) => Err(ArcError::Protocol(e.to_string())),
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), ArcError> {
        use futures::SinkExt;

        let wire = if self.wrapped {
            BASE64.encode(sasl::wrap(line.as_bytes()))
        } else {
            line.to_string()
        };

        self.framed
            .send(wire)
            .await
            .map_err(|e| ArcError::Protocol(e.to_string()))
    }

    pub fn into_inner(self) -> TcpStream {
        self.framed.into_inner()
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.framed.get_ref().peer_addr()
    }
}

/// One authenticated session, shared by both roles.
pub struct Connection {
    pub protocol_version: ProtocolVersion,
    pub role: Role,
    pub control: ControlChannel,
    pub data: Option<DataChannel>,
    pub authenticated: bool,
    pub connected: bool,
    pub peer_identity: String,
    pub expected_next: ExpectedNext,
    pub command_param: Option<String>,
    pub timeout_seconds: u64,
    pub state: State,
    pub error: ErrorCarrier,
}

impl Connection {
    #[must_use]
    pub fn new(role: Role, stream: TcpStream, timeout_seconds: u64) -> Self {
        let expected_next = match role {
            Role::Server => ExpectedNext::AUTH,
            Role::Client => ExpectedNext::OK | ExpectedNext::ERR,
        };

        Self {
            protocol_version: ProtocolVersion::Arc2_1,
            role,
            control: ControlChannel::new(stream),
            data: None,
            authenticated: false,
            connected: true,
            peer_identity: "anonymous".to_string(),
            expected_next,
            command_param: None,
            timeout_seconds,
            state: State::Init,
            error: ErrorCarrier::new(),
        }
    }

    /// Receives and gates the next control line against `expected_next`.
    /// On a gating failure the connection transitions to `Closed`.
    pub async fn recv_expected(&mut self) -> Result<ControlLine, ArcError> {
        let Some(raw) = self.control.recv_line(self.timeout_seconds).await? else {
            self.state = State::Closed;
            self.connected = false;
            return Err(ArcError::PeerClosed);
        };

        let line = match ControlLine::parse(&raw, self.protocol_version) {
            Ok(line) => line,
            Err(e) => {
                self.state = State::Closed;
                self.error.set_error(e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = line.check_expected(self.expected_next) {
            self.state = State::Closed;
            self.error.set_error(e.to_string());
            emit(Facility::ERR, &["protocol violation:", &e.to_string()]);
            return Err(e);
        }

        Ok(line)
    }

    pub async fn send_verb(&mut self, verb: Verb, payload: Option<&str>) -> Result<(), ArcError> {
        let line = ControlLine::new(verb, payload);
        self.control.send_line(&line.render()).await
    }

    /// Marks authentication successful for `identity`: the server never
    /// dispatches a command until `authenticated = true`.
    pub fn complete_authentication(&mut self, identity: String) {
        self.peer_identity = identity;
        self.authenticated = true;
        self.control.mark_authenticated();
        self.state = State::Authed;
        self.expected_next = match self.role {
            Role::Server => ExpectedNext::CMD | ExpectedNext::QUIT,
            Role::Client => ExpectedNext::OK | ExpectedNext::ERR,
        };
        emit(
            Facility::AUTH,
            &["authenticated", &self.peer_identity, "on", self.protocol_version.as_str()],
        );
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.control.peer_addr()
    }

    /// Tears the connection down, closing the data channel first.
    pub fn close(&mut self) {
        self.data = None;
        self.connected = false;
        self.state = State::Closed;
        self.expected_next = ExpectedNext::empty();
    }
}

/// A minimal pipe-like pair used to hand a relay two independent
/// `AsyncRead`/`AsyncWrite` halves regardless of whether they come from a
/// child process's stdio or the process's own stdin/stdout.
pub trait Stdio: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stdio for T {}
