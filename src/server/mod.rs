//! The server role: handshake, SASL authentication, ACL-gated command
//! dispatch, and relay against a spawned child process.
//!
//! One `Connection` is driven to completion per accepted socket; the
//! prefork pool (`pool::mod`) is what decides *which* OS process gets to
//! run this function for a given accepted fd.

pub mod acl;
pub mod process;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::config::Config;
use crate::connection::Connection;
use crate::credentials::CredentialStore;
use crate::data_channel::DataChannel;
use crate::error::ArcError;
use crate::log::{emit, Facility};
use crate::protocol::{ExpectedNext, Verb};
use crate::sasl::{self, ServerExchange};

/// Drives one accepted connection from the initial `AUTH` line through to
/// `QUIT` or a fatal protocol/auth error. Never panics on peer input --
/// every error path sends `ERR` (when the channel is still writable) and
/// returns.
pub async fn serve(
    mut conn: Connection,
    config: &Config,
    store: &CredentialStore,
) -> Result<(), ArcError> {
    if let Err(e) = authenticate(&mut conn, config, store).await {
        emit(Facility::AUTH, &["authentication failed:", &e.to_string()]);
        let _ = conn.send_verb(Verb::Err, Some(&e.to_string())).await;
        return Err(e);
    }

    loop {
        let line = match conn.recv_expected().await {
            Ok(line) => line,
            Err(ArcError::PeerClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        match line.verb {
            Verb::Quit => {
                conn.send_verb(Verb::Ok, None::<&str>).await?;
                conn.close();
                return Ok(());
            }
            Verb::Cmd => {
                let payload = line.payload.unwrap_or_default();
                let mut parts = payload.splitn(2, char::is_whitespace);
                let name = parts.next().unwrap_or("").to_string();
                let args = parts.next().unwrap_or("").to_string();
                conn.command_param = Some(args.clone());
                if let Err(e) = dispatch_command(&mut conn, config, &name, &args).await {
                    emit(Facility::ERR, &["command dispatch failed:", &e.to_string()]);
                    conn.send_verb(Verb::Err, Some(&e.to_string())).await?;
                    conn.expected_next = ExpectedNext::CMD | ExpectedNext::QUIT;
                }
            }
            _ => unreachable!("gated by expected_next"),
        }
    }
}

/// Runs the `AUTH` / `SASL` exchange to completion, leaving `conn`
/// authenticated with `expected_next = CMD|QUIT` on success.
async fn authenticate(
    conn: &mut Connection,
    config: &Config,
    store: &CredentialStore,
) -> Result<(), ArcError> {
    let auth_line = conn.recv_expected().await?;
    let offered = auth_line
        .payload
        .ok_or_else(|| ArcError::Protocol("AUTH requires a mechanism list".into()))?;
    let mechanism = sasl::negotiate(&offered, &config.sasl_mechanisms)?;

    conn.send_verb(Verb::Sasl, Some(mechanism.as_str())).await?;
    conn.expected_next = ExpectedNext::SASL;

    let mut exchange = ServerExchange::new(mechanism, store);

    loop {
        let line = conn.recv_expected().await?;
        let payload = line
            .payload
            .ok_or_else(|| ArcError::Protocol("SASL requires a base64 payload".into()))?;
        let input = BASE64
            .decode(payload)
            .map_err(|e| ArcError::Protocol(format!("bad base64 in SASL payload: {e}")))?;

        let (response, done, identity) = exchange.step(&input, store)?;

        if !response.is_empty() {
            conn.send_verb(Verb::Sasl, Some(&BASE64.encode(response))).await?;
        }

        if done {
            let identity = identity
                .ok_or_else(|| ArcError::Internal("SASL completed without an identity".into()))?;
            conn.send_verb(Verb::Ok, Some(&identity)).await?;
            conn.complete_authentication(identity);
            return Ok(());
        }

        conn.expected_next = ExpectedNext::SASL;
    }
}

/// Runs one full `CMD` cycle: ACL check, data channel setup, child spawn,
/// relay, `EXIT`.
async fn dispatch_command(conn: &mut Connection, config: &Config, name: &str, args: &str) -> Result<(), ArcError> {
    acl::check(&config.acl, name, &conn.peer_identity)?;

    let spec = config
        .commands
        .get(name)
        .ok_or_else(|| ArcError::Protocol(format!("no such command {name:?}")))?;

    let (uid, gid) = config
        .identities
        .get(&conn.peer_identity)
        .copied()
        .ok_or_else(|| {
            ArcError::Authorization {
                user: conn.peer_identity.clone(),
                command: name.to_string(),
            }
        })?;

    conn.send_verb(Verb::Ok, None::<&str>).await?;
    conn.expected_next = ExpectedNext::CMDPASV | ExpectedNext::CMDPORT;

    let setup = conn.recv_expected().await?;
    let data_channel = match setup.verb {
        Verb::CmdPasv => {
            let (listener, port) = DataChannel::listen().await?;
            conn.send_verb(Verb::CmdPasv, Some(&port.to_string())).await?;
            DataChannel::accept(listener).await?
        }
        Verb::CmdPort if conn.protocol_version.supports_cmdport() => {
            let port: u16 = setup
                .payload
                .ok_or_else(|| ArcError::Protocol("CMDPORT requires a port".into()))?
                .parse()
                .map_err(|_| ArcError::Protocol("CMDPORT payload is not a port number".into()))?;
            let host = conn
                .peer_addr()
                .map_err(|e| ArcError::Protocol(format!("no peer address: {e}")))?
                .ip()
                .to_string();
            DataChannel::connect(&host, port).await?
        }
        other => {
            return Err(ArcError::Protocol(format!(
                "expected CMDPASV or CMDPORT, got {}",
                other.as_str()
            )))
        }
    };

    // Per spec.md §4.G, the client signals the start of relaying with a
    // `DATA` control line once the data channel is up; the child is not
    // spawned until that arrives.
    conn.expected_next = ExpectedNext::DATA;
    conn.recv_expected().await?;

    let client_args: Vec<String> = args.split_whitespace().map(str::to_string).collect();
    let mut child = process::spawn(spec, &client_args, uid, gid)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ArcError::Internal("child has no stdout pipe".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ArcError::Internal("child has no stdin pipe".into()))?;

    emit(Facility::CMD, &["dispatching", name, args, "for", &conn.peer_identity]);
    data_channel.relay_child(stdout, stdin).await?;

    let status = child
        .wait()
        .await
        .map_err(|e| ArcError::Internal(format!("waiting on child failed: {e}")))?;
    let code = status.code().unwrap_or(-1);

    conn.send_verb(Verb::Exit, Some(&code.to_string())).await?;
    conn.expected_next = ExpectedNext::CMD | ExpectedNext::QUIT;
    Ok(())
}
