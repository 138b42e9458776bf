//! The client role: connect, authenticate, run one command per invocation,
//! relay its data channel against the local process's stdio, then `QUIT`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::net::TcpStream;

use crate::connection::{Connection, Role};
use crate::data_channel::DataChannel;
use crate::error::ArcError;
use crate::protocol::{ExpectedNext, ProtocolVersion, Verb};
use crate::sasl::{plain, scram::ScramClient, Mechanism};

pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub mechanism: Mechanism,
    pub authzid: String,
    pub username: String,
    pub password: String,
    pub timeout_seconds: u64,
    pub protocol_version: ProtocolVersion,
    /// Use `CMDPORT` (client listens, server connects back) instead of the
    /// default `CMDPASV` (server listens) for the data channel. Only valid
    /// under `ARC/2.1`.
    pub use_cmdport: bool,
}

/// Connects, authenticates, and runs `command` to completion against
/// `local` (the process's own stdin/stdout, in the CLI binary).
pub async fn run_command<L>(
    config: &ClientConfig,
    command: &str,
    local: L,
) -> Result<i32, ArcError>
where
    L: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| ArcError::Protocol(format!("connect to {}:{} failed: {e}", config.host, config.port)))?;

    let mut conn = Connection::new(Role::Client, stream, config.timeout_seconds);
    conn.protocol_version = config.protocol_version;

    authenticate(&mut conn, config).await?;

    let args = command.split_once(char::is_whitespace).map_or("", |(_, rest)| rest);
    conn.command_param = Some(args.to_string());

    conn.send_verb(Verb::Cmd, Some(command)).await?;
    conn.expected_next = ExpectedNext::OK | ExpectedNext::ERR;
    let reply = conn.recv_expected().await?;
    if reply.verb == Verb::Err {
        return Err(ArcError::Protocol(format!(
            "server rejected command: {}",
            reply.payload.unwrap_or_default()
        )));
    }

    let data = if config.use_cmdport {
        if !conn.protocol_version.supports_cmdport() {
            return Err(ArcError::Protocol(format!(
                "CMDPORT is not in the {} vocabulary",
                conn.protocol_version.as_str()
            )));
        }
        let (listener, port) = DataChannel::listen().await?;
        conn.send_verb(Verb::CmdPort, Some(&port.to_string())).await?;
        DataChannel::accept(listener).await?
    } else {
        conn.send_verb(Verb::CmdPasv, None::<&str>).await?;
        conn.expected_next = ExpectedNext::CMDPASV;
        let setup = conn.recv_expected().await?;
        let port: u16 = setup
            .payload
            .ok_or_else(|| ArcError::Protocol("CMDPASV reply missing port".into()))?
            .parse()
            .map_err(|_| ArcError::Protocol("CMDPASV reply is not a port number".into()))?;
        DataChannel::connect(&config.host, port).await?
    };

    // Per spec.md §4.G: once the data channel is up, announce the start
    // of relaying with `DATA` before exchanging any stdio bytes.
    conn.send_verb(Verb::Data, None::<&str>).await?;

    conn.expected_next = ExpectedNext::EXIT;
    let relay = data.relay(local);
    let exit_line = conn.recv_expected();
    let (relay_result, exit_line) = tokio::join!(relay, exit_line);
    relay_result?;
    let exit_line = exit_line?;

    let code: i32 = exit_line
        .payload
        .ok_or_else(|| ArcError::Protocol("EXIT missing a status code".into()))?
        .parse()
        .map_err(|_| ArcError::Protocol("EXIT payload is not an integer".into()))?;

    conn.send_verb(Verb::Quit, None::<&str>).await?;
    conn.expected_next = ExpectedNext::OK;
    let _ = conn.recv_expected().await;
    conn.close();

    Ok(code)
}

async fn authenticate(conn: &mut Connection, config: &ClientConfig) -> Result<(), ArcError> {
    conn.send_verb(Verb::Auth, Some(config.mechanism.as_str())).await?;
    conn.expected_next = ExpectedNext::SASL | ExpectedNext::ERR;

    let picked = conn.recv_expected().await?;
    if picked.verb == Verb::Err {
        return Err(ArcError::Auth(picked.payload.unwrap_or_default()));
    }

    match config.mechanism {
        Mechanism::Plain => {
            let message = plain::client_message(&config.authzid, &config.username, &config.password);
            conn.send_verb(Verb::Sasl, Some(&BASE64.encode(message))).await?;
            conn.expected_next = ExpectedNext::OK | ExpectedNext::ERR;
            let reply = conn.recv_expected().await?;
            if reply.verb == Verb::Err {
                return Err(ArcError::Auth(reply.payload.unwrap_or_default()));
            }
            conn.complete_authentication(config.username.clone());
            Ok(())
        }
        Mechanism::ScramSha256 => {
            let mut client = ScramClient::new(config.username.clone(), config.password.clone())?;
            let first = client.first_message();
            conn.send_verb(Verb::Sasl, Some(&BASE64.encode(first))).await?;
            conn.expected_next = ExpectedNext::SASL | ExpectedNext::OK | ExpectedNext::ERR;

            loop {
                let line = conn.recv_expected().await?;
                match line.verb {
                    Verb::Err => return Err(ArcError::Auth(line.payload.unwrap_or_default())),
                    Verb::Ok => {
                        conn.complete_authentication(config.username.clone());
                        return Ok(());
                    }
                    Verb::Sasl => {
                        let payload = line
                            .payload
                            .ok_or_else(|| ArcError::Protocol("SASL requires a payload".into()))?;
                        let input = BASE64
                            .decode(payload)
                            .map_err(|e| ArcError::Protocol(format!("bad base64: {e}")))?;
                        let (reply, done) = client.step(&input)?;
                        if !reply.is_empty() {
                            conn.send_verb(Verb::Sasl, Some(&BASE64.encode(reply))).await?;
                        }
                        conn.expected_next = if done {
                            ExpectedNext::OK | ExpectedNext::ERR
                        } else {
                            ExpectedNext::SASL | ExpectedNext::OK | ExpectedNext::ERR
                        };
                    }
                    _ => unreachable!("gated by expected_next"),
                }
            }
        }
    }
}
