//! Privileged child process spawning.
//!
//! Between `fork` and `exec`, a `pre_exec` hook may only call
//! async-signal-safe functions, which `nix::unistd::{setgid, setuid}` are.

use std::process::Stdio as StdStdio;

use nix::unistd::{Gid, Uid};
use tokio::process::{Child, Command};

use crate::config::CommandSpec;
use crate::error::ArcError;

/// Spawns `spec` with stdio piped, dropping to `(uid, gid)` before `exec`.
/// `extra_args` -- the arguments the client supplied after the command
/// name on its `CMD` line -- are appended after `spec.args` (the
/// configured argv template), not substituted for it.
/// Group is dropped first -- `setuid` after `setgid` would fail once the
/// process no longer has the privilege to change its group.
pub fn spawn(spec: &CommandSpec, extra_args: &[String], uid: u32, gid: u32) -> Result<Child, ArcError> {
    let mut command = Command::new(&spec.executable);
    command
        .args(&spec.args)
        .args(extra_args)
        .stdin(StdStdio::piped())
        .stdout(StdStdio::piped())
        .stderr(StdStdio::piped());

    unsafe {
        command.pre_exec(move || {
            nix::unistd::setgid(Gid::from_raw(gid))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            nix::unistd::setuid(Uid::from_raw(uid))
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    command.spawn().map_err(ArcError::ChildSpawn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_runs_to_completion_as_the_current_user() {
        let spec = CommandSpec {
            name: "whoami".to_string(),
            executable: "/bin/echo".to_string(),
            args: vec!["hello".to_string()],
        };
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let mut child = spawn(&spec, &[], uid, gid).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn extra_args_are_appended_after_the_configured_template() {
        let spec = CommandSpec {
            name: "echo".to_string(),
            executable: "/bin/echo".to_string(),
            args: vec!["configured".to_string()],
        };
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let mut child = spawn(&spec, &["client".to_string(), "args".to_string()], uid, gid).unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut out).await.unwrap();
        assert_eq!(out, b"configured client args\n");

        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
