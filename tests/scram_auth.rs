//! End-to-end `SCRAM-SHA-256` authentication over a real socket, and the
//! `CMDPORT` (client-listens) data channel mode introduced in `ARC/2.1`.

use std::collections::HashMap;

use arcd::config::{CommandSpec, Config, LogDestination};
use arcd::connection::{Connection, Role};
use arcd::credentials::{derive_scram_credentials, CredentialStore};
use arcd::log::Facility;
use arcd::server;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::net::TcpListener;

fn scram_config(tmp_dir: &std::path::Path) -> (Config, CredentialStore) {
    let creds = derive_scram_credentials(b"hunter2", b"integration-test-salt", 4096);
    let ini = arcd::config::Ini::parse(&format!(
        "[scram]\nalice = {}:{}:{}:{}\n",
        BASE64.encode(&creds.salt),
        creds.iterations,
        BASE64.encode(creds.stored_key),
        BASE64.encode(creds.server_key),
    ))
    .unwrap();
    let store = CredentialStore::from_ini(&ini).unwrap();

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
    identities.insert(
        "alice".to_string(),
        (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw()),
    );

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
        sasl_mechanisms: vec!["SCRAM-SHA-256".into()],
        commands,
        acl,
        identities,
    };

    (config, store)
}

#[tokio::test]
async fn scram_authentication_succeeds_and_runs_a_command() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = scram_config(tmp.path());

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
        mechanism: arcd::sasl::Mechanism::ScramSha256,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    let (local, remote) = tokio::io::duplex(1024);
    let (mut remote_rd, remote_wr) = tokio::io::split(remote);
    drop(remote_wr);

    let client_fut = arcd::client::run_command(&client_config, "echo hi", local);
    let drain_fut = async {
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = remote_rd.read_to_end(&mut buf).await;
        buf
    };
    let (exit_code, echoed) = tokio::join!(client_fut, drain_fut);

    assert_eq!(exit_code.unwrap(), 0);
    assert_eq!(echoed, b"hi\n");
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn scram_authentication_fails_with_wrong_password() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = scram_config(tmp.path());

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
        mechanism: arcd::sasl::Mechanism::ScramSha256,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "not-the-password".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: false,
    };

    let (local, _remote) = tokio::io::duplex(1024);
    let result = arcd::client::run_command(&client_config, "echo", local).await;
    assert!(result.is_err());
    assert!(server_task.await.unwrap().is_err());
}

#[tokio::test]
async fn cmdport_mode_listens_locally_and_lets_the_server_connect_back() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, store) = scram_config(tmp.path());

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
        mechanism: arcd::sasl::Mechanism::ScramSha256,
        authzid: "alice".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        timeout_seconds: 5,
        protocol_version: arcd::protocol::ProtocolVersion::Arc2_1,
        use_cmdport: true,
    };

    let (local, remote) = tokio::io::duplex(1024);
    let (mut remote_rd, remote_wr) = tokio::io::split(remote);
    drop(remote_wr);

    let client_fut = arcd::client::run_command(&client_config, "echo hi", local);
    let drain_fut = async {
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = remote_rd.read_to_end(&mut buf).await;
        buf
    };
    let (exit_code, echoed) = tokio::join!(client_fut, drain_fut);

    assert_eq!(exit_code.unwrap(), 0);
    assert_eq!(echoed, b"hi\n");
    server_task.await.unwrap().unwrap();
}
