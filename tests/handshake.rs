//! End-to-end handshake and command dispatch tests against a real bound
//! socket.

use std::collections::HashMap;

use arcd::config::{CommandSpec, Config, LogDestination};
use arcd::connection::{Connection, Role};
use arcd::credentials::CredentialStore;
use arcd::log::Facility;
use arcd::server;
use tokio::net::TcpListener;

fn test_config(tmp_dir: &std::path::Path) -> (Config, CredentialStore) {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
    use rand_core::OsRng;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(b"hunter2", &salt)
        .unwrap()
        .to_string();

    let mut commands = HashMap::new();
    commands.insert(
        "echo".to_string(),
        CommandSpec {
            name: "echo".to_string(),
            executable: "/bin/echo".to_string(),
            args: vec![],
        },
    );

    let mut acl = HashMap::new();
    acl.insert("echo".to_string(), vec!["alice".to_string()]);

    let mut identities = HashMap::new();
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    identities.insert("alice".to_string(), (uid, gid));

    let config = Config {
        service_name: "arcd-test".into(),
        timeout_seconds: 5,
        log_level: Facility::empty(),
        log_destination: LogDestination::Stderr,
        host: "127.0.0.1".into(),
        ports: vec![0],
        pid_file: tmp_dir.join("arcd.pid").display().to_string(),
        max_requests_per_worker: 1000,
        min_servers: 1,
        max_servers: 1,
        min_spare_servers: 1,
        max_spare_servers: 1,
        sasl_mechanisms: vec!["PLAIN".into(), "SCRAM-SHA-256".into()],
        commands,
        acl,
        identities,
    };

    let ini = arcd::config::Ini::parse(&format!("[users]\nalice = {hash}\n")).unwrap();
    let store = CredentialStore::from_ini(&ini).unwrap();

    (config, store)
}

#[tokio::test]
async fn full_plain_round_trip_runs_a_command() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = test_config(tmp.path());

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        server::serve(conn, &config, &store).await
    });

    let client_config = arcd::client::ClientConfig {
        host: "127.0.0.1".into(),
        port,
        mechanism: arcd::sasl::Mechanism::Plain,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    // The client sends no stdin, so its write half is dropped immediately
    // (signalling EOF to the server's child) while the read half stays
    // open to drain the echoed command output.
    let (local, remote) = tokio::io::duplex(1024);
    let (mut remote_rd, remote_wr) = tokio::io::split(remote);
    drop(remote_wr);

    // S1: the config maps `echo` with no fixed argv; the argument the
    // client supplies on the `CMD` line must reach the child's argv.
    let client_fut = arcd::client::run_command(&client_config, "echo hello", local);
    let drain_fut = async {
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = remote_rd.read_to_end(&mut buf).await;
        buf
    };
    let (exit_code, echoed) = tokio::join!(client_fut, drain_fut);
    let exit_code = exit_code.unwrap();

    assert_eq!(exit_code, 0);
    assert_eq!(echoed, b"hello\n");
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unauthorized_user_is_rejected_by_acl() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut config, store) = test_config(tmp.path());
    config.acl.get_mut("echo").unwrap().clear();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        server::serve(conn, &config, &store).await
    });

    let client_config = arcd::client::ClientConfig {
        host: "127.0.0.1".into(),
        port,
        mechanism: arcd::sasl::Mechanism::Plain,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    let (local, _remote) = tokio::io::duplex(1024);
    let result = arcd::client::run_command(&client_config, "echo", local).await;
    assert!(result.is_err());

    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn unknown_command_is_rejected_without_spawning_anything() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = test_config(tmp.path());

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        server::serve(conn, &config, &store).await
    });

    let client_config = arcd::client::ClientConfig {
        host: "127.0.0.1".into(),
        port,
        mechanism: arcd::sasl::Mechanism::Plain,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    let (local, _remote) = tokio::io::duplex(1024);
    let result = arcd::client::run_command(&client_config, "rm -rf /", local).await;
    assert!(result.is_err());

    // The connection survives an unknown command: the server returns ERR
    // and loops back to AUTHED rather than tearing the session down, then
    // observes the client's drop as a clean peer close.
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn command_before_auth_is_a_protocol_violation() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = test_config(tmp.path());

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        server::serve(conn, &config, &store).await
    });

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = tokio_util::codec::Framed::new(stream, arcd::codec::LineCodec);

    use futures::{SinkExt, StreamExt};
    framed.send("CMD echo hi".to_string()).await.unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    assert!(reply.starts_with("ERR"));

    // The server closes the socket after the violation: a further read
    // observes EOF rather than another reply.
    assert!(framed.next().await.is_none());

    assert!(server_task.await.unwrap().is_err());
}

#[tokio::test]
async fn wrong_password_is_rejected_before_any_command_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = test_config(tmp.path());

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        server::serve(conn, &config, &store).await
    });

    let client_config = arcd::client::ClientConfig {
        host: "127.0.0.1".into(),
        port,
        mechanism: arcd::sasl::Mechanism::Plain,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "wrong-password".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    let (local, _remote) = tokio::io::duplex(1024);
    let result = arcd::client::run_command(&client_config, "echo", local).await;
    assert!(result.is_err());

    assert!(server_task.await.unwrap().is_err());
}
