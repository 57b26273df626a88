//! Guest shell access over ssh/scp.
//!
//! [`GuestShell`] is the seam the backup engine drives; [`SshShell`] shells
//! out to the OpenSSH client with key-based, non-interactive options. Guests
//! are recreated often, so host keys are never checked or recorded.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{QvmError, Result};

/// Where to reach a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestTarget {
    pub ip: Ipv4Addr,
    pub username: String,
}

impl GuestTarget {
    pub fn new(ip: Ipv4Addr, username: impl Into<String>) -> Self {
        Self {
            ip,
            username: username.into(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.ip)
    }
}

#[async_trait]
pub trait GuestShell: Send + Sync {
    /// Run `script` in the guest and return its stdout. A non-zero exit is an
    /// error labelled with `step`.
    async fn run(&self, target: &GuestTarget, step: &str, script: &str) -> Result<String>;

    /// Run `script` with its stdout written to `dest` on the host.
    async fn run_to_file(
        &self,
        target: &GuestTarget,
        step: &str,
        script: &str,
        dest: &Path,
    ) -> Result<()>;

    /// Copy a host file to `remote_path` in the guest.
    async fn upload(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> Result<()>;

    /// Whether a trivial command succeeds, i.e. key-based login works.
    async fn probe(&self, target: &GuestTarget) -> bool {
        self.run(target, "ssh probe", "true").await.is_ok()
    }
}

#[rustfmt::skip]
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
];

/// OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshShell {
    identity: PathBuf,
    connect_timeout: Duration,
}

impl SshShell {
    /// `identity` is the private key; its `.pub` sibling is what the guest
    /// trusts.
    pub fn new(identity: &Path, connect_timeout: Duration) -> Self {
        Self {
            identity: identity.to_path_buf(),
            connect_timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            self.identity.display().to_string(),
        ]);
        args
    }

    fn ssh_args(&self, target: &GuestTarget, script: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.push(target.destination());
        args.push(script.to_string());
        args
    }
}

#[async_trait]
impl GuestShell for SshShell {
    async fn run(&self, target: &GuestTarget, step: &str, script: &str) -> Result<String> {
        debug!(target = %target.destination(), step, "ssh");
        let out = Command::new("ssh")
            .args(self.ssh_args(target, script))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| QvmError::remote(step, format!("failed to spawn ssh: {e}")))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(QvmError::remote(step, exit_detail(out.status.code(), &out.stderr)))
        }
    }

    async fn run_to_file(
        &self,
        target: &GuestTarget,
        step: &str,
        script: &str,
        dest: &Path,
    ) -> Result<()> {
        debug!(target = %target.destination(), step, dest = %dest.display(), "ssh to file");
        let file = std::fs::File::create(dest)?;
        let out = Command::new("ssh")
            .args(self.ssh_args(target, script))
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| QvmError::remote(step, format!("failed to spawn ssh: {e}")))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(QvmError::remote(step, exit_detail(out.status.code(), &out.stderr)))
        }
    }

    async fn upload(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> Result<()> {
        let mut args = self.base_args();
        args.push(local.display().to_string());
        args.push(format!("{}:{}", target.destination(), remote_path));
        let out = Command::new("scp")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| QvmError::remote("upload", format!("failed to spawn scp: {e}")))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(QvmError::remote("upload", exit_detail(out.status.code(), &out.stderr)))
        }
    }
}

fn exit_detail(code: Option<i32>, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    match code {
        Some(c) if last.is_empty() => format!("exit {c}"),
        Some(c) => format!("exit {c}: {last}"),
        None => "terminated by signal".to_string(),
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote(".ssh"), ".ssh");
        assert_eq!(shell_quote(".config/gh"), ".config/gh");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn ssh_args_are_non_interactive() {
        let shell = SshShell::new(Path::new("/k/id_ed25519"), Duration::from_secs(3));
        let target = GuestTarget::new("192.168.1.50".parse().unwrap(), "ubuntu");
        let args = shell.ssh_args(&target, "true");
        assert!(args.windows(2).any(|w| w == ["-o", "BatchMode=yes"]));
        assert!(args.windows(2).any(|w| w == ["-o", "StrictHostKeyChecking=no"]));
        assert!(args.windows(2).any(|w| w == ["-o", "ConnectTimeout=3"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/k/id_ed25519"]));
        assert_eq!(&args[args.len() - 2..], ["ubuntu@192.168.1.50", "true"]);
    }

    #[test]
    fn exit_detail_uses_last_stderr_line() {
        assert_eq!(
            exit_detail(Some(255), b"warning\nPermission denied\n\n"),
            "exit 255: Permission denied"
        );
        assert_eq!(exit_detail(Some(1), b""), "exit 1");
        assert_eq!(exit_detail(None, b""), "terminated by signal");
    }
}
