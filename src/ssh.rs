//! Remote access through the OpenSSH command line tools
//!
//! Every operation is one `ssh` (or `scp`) invocation. Paths are quoted for
//! the remote shell; a missing path is detected from the tool's error output
//! and reported as [`RemoteError::NotFound`].

use deploykit::{
    ExecOptions, ExecOutput, FileAttrs, LocalHost, Node, RemoteError, RemoteHost, RemoteStat,
    run_command, shell_quote,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;

/// Open a remote host for a node using the given access method.
pub fn connect(node: &Node, method: &str) -> Result<Arc<dyn RemoteHost>, RemoteError> {
    match method {
        "local" => Ok(Arc::new(LocalHost::new())),
        "ssh" | "openssh" => Ok(Arc::new(OpenSshHost::new(node)?)),
        _ => Err(RemoteError::Unsupported {
            node: node.name.clone(),
            method: method.to_string(),
        }),
    }
}

/// Quote a string for a POSIX shell.
fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

/// A node reached with `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct OpenSshHost {
    host: String,
    user: Option<String>,
    key: Option<PathBuf>,
}

impl OpenSshHost {
    pub fn new(node: &Node) -> Result<Self, RemoteError> {
        if node.host.is_empty() {
            return Err(RemoteError::Other(format!(
                "{}: no host address configured",
                node.name
            )));
        }
        Ok(Self {
            host: node.host.clone(),
            user: node.user.clone(),
            key: node.ssh_key.as_deref().map(key_path),
        })
    }

    /// `user@host` for scp targets.
    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"]);
        if let Some(key) = &self.key {
            cmd.arg("-i").arg(key);
        }
        if let Some(user) = &self.user {
            cmd.arg("-l").arg(user);
        }
        cmd.arg(&self.host).arg(remote_command);
        cmd
    }

    /// Run a remote command, optionally feeding `input` to its stdin.
    fn run(&self, remote_command: &str, input: Option<&[u8]>) -> Result<Output, RemoteError> {
        let failed = |message: String| RemoteError::Command {
            command: format!("ssh {} {remote_command}", self.host),
            message,
        };

        let mut cmd = self.ssh(remote_command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });

        log::trace!("ssh {}: {remote_command}", self.host);
        let mut child = cmd.spawn().map_err(|e| failed(e.to_string()))?;
        if let Some(data) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(data).map_err(|e| failed(e.to_string()))?;
        }
        child.wait_with_output().map_err(|e| failed(e.to_string()))
    }

    /// Run a remote command that must succeed; a missing `path` maps to NotFound.
    fn run_checked(
        &self,
        remote_command: &str,
        path: &Path,
        input: Option<&[u8]>,
    ) -> Result<Vec<u8>, RemoteError> {
        let output = self.run(remote_command, input)?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return Err(RemoteError::NotFound(path.to_path_buf()));
        }
        Err(RemoteError::Command {
            command: format!("ssh {} {remote_command}", self.host),
            message: stderr.trim().to_string(),
        })
    }
}

/// Resolve an `ssh-key` property: bare names live in `~/.ssh`.
fn key_path(key: &str) -> PathBuf {
    if key.contains('/') {
        return PathBuf::from(shellexpand::tilde(key).as_ref());
    }
    dirs::home_dir()
        .map(|home| home.join(".ssh").join(key))
        .unwrap_or_else(|| PathBuf::from(key))
}

/// Parse `stat -c '%s %Y %F'` output.
fn parse_stat(output: &str) -> Option<RemoteStat> {
    let mut fields = output.trim().splitn(3, ' ');
    let size = fields.next()?.parse().ok()?;
    let mtime = fields.next()?.parse().ok()?;
    let kind = fields.next()?;
    Some(RemoteStat {
        size,
        mtime,
        is_dir: kind == "directory",
    })
}

impl RemoteHost for OpenSshHost {
    fn stat(&self, path: &Path) -> Result<RemoteStat, RemoteError> {
        let command = format!("stat -L -c '%s %Y %F' -- {}", quote_path(path));
        let stdout = self.run_checked(&command, path, None)?;
        let text = String::from_utf8_lossy(&stdout);
        parse_stat(&text)
            .ok_or_else(|| RemoteError::Other(format!("unexpected stat output: {}", text.trim())))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, RemoteError> {
        self.run_checked(&format!("cat -- {}", quote_path(path)), path, None)
    }

    fn write_file(&self, path: &Path, contents: &[u8], attrs: &FileAttrs) -> Result<(), RemoteError> {
        let target = quote_path(path);
        let mut command = format!("cat > {target}");
        if let Some(mode) = attrs.mode {
            command.push_str(&format!(" && chmod {mode:o} -- {target}"));
        }
        match (&attrs.owner, &attrs.group) {
            (Some(owner), Some(group)) => {
                command.push_str(&format!(" && chown {}:{} -- {target}", shell_quote(owner), shell_quote(group)));
            }
            (Some(owner), None) => {
                command.push_str(&format!(" && chown {} -- {target}", shell_quote(owner)));
            }
            (None, Some(group)) => {
                command.push_str(&format!(" && chgrp {} -- {target}", shell_quote(group)));
            }
            (None, None) => {}
        }
        self.run_checked(&command, path, Some(contents)).map(drop)
    }

    fn makedirs(&self, path: &Path) -> Result<(), RemoteError> {
        self.run_checked(&format!("mkdir -p -- {}", quote_path(path)), path, None)
            .map(drop)
    }

    fn put_file(
        &self,
        local: &Path,
        remote: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), RemoteError> {
        let total = fs::metadata(local)
            .map_err(|e| RemoteError::from_io("stat", local, e))?
            .len();
        progress(0, total);

        let mut cmd = Command::new("scp");
        cmd.args(["-q", "-B"]);
        if let Some(key) = &self.key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(local)
            .arg(format!("{}:{}", self.target(), quote_path(remote)));

        let output = cmd.output().map_err(|e| RemoteError::Command {
            command: format!("scp {}", local.display()),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(RemoteError::Command {
                command: format!("scp {} {}:{}", local.display(), self.host, remote.display()),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        progress(total, total);
        Ok(())
    }

    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> Result<(), RemoteError> {
        let target = quote_path(path);
        let command =
            format!("touch -a -d @{atime} -- {target} && touch -m -d @{mtime} -- {target}");
        self.run_checked(&command, path, None).map(drop)
    }

    fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput, RemoteError> {
        run_command(self.ssh(&remote_command(command, opts)), command, opts)
    }
}

/// The local environment does not reach the remote shell, so colorless runs
/// export `NO_COLOR` in the command itself.
fn remote_command(command: &str, opts: &ExecOptions) -> String {
    if opts.color {
        command.to_string()
    } else {
        format!("export NO_COLOR=1; {command}")
    }
}
