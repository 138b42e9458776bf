//! The preforking pool: the parent binds the listener(s),
//! keeps a pool of worker OS processes sized between `min_servers` and
//! `max_servers`, and reaps them as they exit. Workers are obtained by
//! re-executing the current binary with the listener fd(s) inherited
//! rather than by calling `fork(2)` directly, since raw `fork` from inside
//! a multi-threaded `tokio` runtime only leaves async-signal-safe calls
//! available in the child until the following `exec` -- narrower than this
//! pool needs. `pool::worker` holds the pure spawn/reap bookkeeping;
//! this module does the actual process and fd plumbing.

pub mod worker;

use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::time::interval;

use crate::config::Config;
use crate::connection::{Connection, Role};
use crate::credentials::CredentialStore;
use crate::error::ArcError;
use crate::log::{emit, Facility};
use crate::server;

/// The env var a worker process finds its inherited listener fds in, as a
/// comma-separated list in the same order as `config.ports`.
pub const WORKER_FDS_ENV: &str = "ARCD_WORKER_FDS";

fn bind_listeners(config: &Config) -> Result<Vec<StdTcpListener>, ArcError> {
    config
        .ports
        .iter()
        .map(|&port| {
            let listener = StdTcpListener::bind((config.host.as_str(), port))
                .map_err(|e| ArcError::Bind(format!("{}:{port}", config.host), e))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| ArcError::Bind(format!("{}:{port}", config.host), e))?;
            clear_cloexec(listener.as_raw_fd());
            Ok(listener)
        })
        .collect()
}

fn clear_cloexec(fd: RawFd) {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFD) {
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.remove(FdFlag::FD_CLOEXEC);
        let _ = fcntl(fd, FcntlArg::F_SETFD(flags));
    }
}

fn spawn_worker(listeners: &[StdTcpListener]) -> Result<Child, ArcError> {
    let exe = std::env::current_exe()
        .map_err(|e| ArcError::Internal(format!("cannot find current executable: {e}")))?;
    let fds: Vec<String> = listeners.iter().map(|l| l.as_raw_fd().to_string()).collect();

    Command::new(exe)
        .args(std::env::args().skip(1))
        .env(WORKER_FDS_ENV, fds.join(","))
        .stdin(Stdio::null())
        .spawn()
        .map_err(ArcError::ChildSpawn)
}

/// The parent supervisor loop. Binds the listener(s), writes the pid file,
/// and keeps the worker pool within its configured thresholds until a
/// `SIGTERM` requests graceful shutdown.
pub async fn run_parent(config: Config) -> Result<(), ArcError> {
    let listeners = bind_listeners(&config)?;
    std::fs::write(&config.pid_file, format!("{}\n", std::process::id()))
        .map_err(|e| ArcError::Internal(format!("writing pid file: {e}")))?;

    let mut children: Vec<Child> = Vec::new();
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| ArcError::Internal(format!("installing SIGTERM handler: {e}")))?;
    let mut tick = interval(Duration::from_secs(1));

    let result = loop {
        tokio::select! {
            _ = tick.tick() => {
                reap_dead(&mut children);
                let statuses: Vec<worker::WorkerStatus> = children
                    .iter()
                    .map(|c| worker::WorkerStatus { pid: c.id().unwrap_or(0) as i32, requests_served: 0, idle: true })
                    .collect();

                let deficit = worker::spawn_deficit(&statuses, &config);
                for _ in 0..deficit {
                    match spawn_worker(&listeners) {
                        Ok(child) => {
                            emit(Facility::SIDE, &["spawned worker", &child.id().unwrap_or(0).to_string()]);
                            children.push(child);
                        }
                        Err(e) => emit(Facility::ERR, &["failed to spawn worker:", &e.to_string()]),
                    }
                }

                let surplus = worker::reap_surplus(&statuses, &config);
                for child in children.iter_mut().rev().take(surplus as usize) {
                    if let Some(pid) = child.id() {
                        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                }
            }
            _ = term.recv() => {
                break Ok(());
            }
        }
    };

    emit(Facility::SIDE, &["shutting down, terminating", &children.len().to_string(), "workers"]);
    for child in &children {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    for mut child in children {
        let _ = child.wait().await;
    }
    let _ = std::fs::remove_file(&config.pid_file);

    result
}

fn reap_dead(children: &mut Vec<Child>) {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                children.retain(|c| c.id() != Some(pid.as_raw() as u32));
            }
            Ok(_) => continue,
        }
    }
}

/// The worker entry point: accepts connections on the inherited fd(s) and
/// serves them until `max_requests_per_worker` is reached, then exits.
pub async fn run_worker(config: Config, store: CredentialStore) -> Result<(), ArcError> {
    let fds = std::env::var(WORKER_FDS_ENV)
        .map_err(|_| ArcError::Internal(format!("{WORKER_FDS_ENV} not set in worker process")))?;

    let mut listeners = Vec::new();
    for fd in fds.split(',') {
        let fd: RawFd = fd
            .parse()
            .map_err(|_| ArcError::Internal(format!("malformed fd in {WORKER_FDS_ENV}")))?;
        let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|e| ArcError::Internal(format!("fd {fd} not usable: {e}")))?;
        listeners.push(
            TcpListener::from_std(std_listener)
                .map_err(|e| ArcError::Internal(format!("fd {fd} not usable: {e}")))?,
        );
    }

    let mut requests_served = 0u32;

    'accept: loop {
        let (stream, _) = accept_any(&listeners).await?;
        requests_served += 1;

        let conn = Connection::new(Role::Server, stream, config.timeout_seconds);
        if let Err(e) = server::serve(conn, &config, &store).await {
            emit(Facility::ERR, &["connection ended:", &e.to_string()]);
        }

        if worker::should_retire(requests_served, &config) {
            emit(Facility::SIDE, &["worker retiring after", &requests_served.to_string(), "requests"]);
            break 'accept;
        }
    }

    Ok(())
}

async fn accept_any(listeners: &[TcpListener]) -> Result<(tokio::net::TcpStream, std::net::SocketAddr), ArcError> {
    use futures::future::select_all;

    let futs = listeners.iter().map(|l| Box::pin(l.accept()));
    let (result, _, _) = select_all(futs).await;
    result.map_err(|e| ArcError::Internal(format!("accept failed: {e}")))
}
