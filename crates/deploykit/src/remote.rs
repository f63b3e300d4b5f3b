//! Remote host abstraction
//!
//! The [`RemoteHost`] trait is the only way the engine touches a node:
//! stat, read, write, copy, set times and execute. Implementations:
//!
//! - [`LocalHost`]: the local filesystem and `sh -c`
//! - [`MockHost`]: in-memory host with an operation journal, for testing
//!
//! A [`Connector`] turns a node and an access method into a host handle.

use crate::error::RemoteError;
use crate::types::Node;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Size and truncated modification time of a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    /// Seconds since the Unix epoch, truncated.
    pub mtime: i64,
    pub is_dir: bool,
}

/// Ownership and permissions requested for a written file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Options for [`RemoteHost::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub verbose: bool,
    /// Discard output instead of forwarding it to the terminal.
    pub quiet: bool,
    /// Collect stdout lines into [`ExecOutput::lines`].
    pub capture: bool,
    /// Append stdout and stderr to this file.
    pub output_file: Option<PathBuf>,
    /// Allow colored output; `NO_COLOR=1` is set for the command otherwise.
    pub color: bool,
}

/// Result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Captured stdout lines (empty unless [`ExecOptions::capture`] was set).
    pub lines: Vec<String>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// File access and command execution on one node.
pub trait RemoteHost: Send + Sync {
    /// Stat a path; a missing path is [`RemoteError::NotFound`].
    fn stat(&self, path: &Path) -> Result<RemoteStat, RemoteError>;

    /// Read a whole file; a missing file is [`RemoteError::NotFound`].
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, RemoteError>;

    /// Write a whole file and apply the requested attributes.
    fn write_file(&self, path: &Path, contents: &[u8], attrs: &FileAttrs) -> Result<(), RemoteError>;

    /// Create a directory and all missing parents.
    fn makedirs(&self, path: &Path) -> Result<(), RemoteError>;

    /// Copy a local file to the host, reporting `(copied, total)` bytes.
    fn put_file(
        &self,
        local: &Path,
        remote: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), RemoteError>;

    /// Set access and modification times (seconds since the epoch).
    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> Result<(), RemoteError>;

    /// Run a shell command and return its exit code.
    fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput, RemoteError>;
}

/// Provides remote host handles for nodes.
pub trait Connector: Send + Sync {
    /// Open a host handle for `node` using access method `method`.
    fn connect(&self, node: &Node, method: &str) -> Result<Arc<dyn RemoteHost>, RemoteError>;
}

impl<F> Connector for F
where
    F: Fn(&Node, &str) -> Result<Arc<dyn RemoteHost>, RemoteError> + Send + Sync,
{
    fn connect(&self, node: &Node, method: &str) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        self(node, method)
    }
}

/// Connector handing out one shared host for every node and method.
#[derive(Clone)]
pub struct StaticConnector(pub Arc<dyn RemoteHost>);

impl Connector for StaticConnector {
    fn connect(&self, _node: &Node, _method: &str) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Truncated modification time of local metadata, in epoch seconds.
pub fn unix_mtime(meta: &fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => epoch_seconds(time),
        Err(_) => 0,
    }
}

fn epoch_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

fn system_time(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

// ============================================================================
// LocalHost
// ============================================================================

/// Local filesystem access.
#[derive(Debug, Clone, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn new() -> Self {
        Self
    }

    #[cfg(unix)]
    fn apply_attrs(path: &Path, attrs: &FileAttrs) -> Result<(), RemoteError> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = attrs.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| RemoteError::from_io("chmod", path, e))?;
        }

        if attrs.owner.is_some() || attrs.group.is_some() {
            let uid = numeric_id(attrs.owner.as_deref(), "owner")?;
            let gid = numeric_id(attrs.group.as_deref(), "group")?;
            std::os::unix::fs::chown(path, uid, gid)
                .map_err(|e| RemoteError::from_io("chown", path, e))?;
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_attrs(_path: &Path, _attrs: &FileAttrs) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(unix)]
fn numeric_id(value: Option<&str>, what: &str) -> Result<Option<u32>, RemoteError> {
    value
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| RemoteError::Other(format!("local {what} must be numeric, got {v:?}")))
        })
        .transpose()
}

impl RemoteHost for LocalHost {
    fn stat(&self, path: &Path) -> Result<RemoteStat, RemoteError> {
        let meta = fs::metadata(path).map_err(|e| RemoteError::from_io("stat", path, e))?;
        Ok(RemoteStat {
            size: meta.len(),
            mtime: unix_mtime(&meta),
            is_dir: meta.is_dir(),
        })
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, RemoteError> {
        fs::read(path).map_err(|e| RemoteError::from_io("read", path, e))
    }

    fn write_file(&self, path: &Path, contents: &[u8], attrs: &FileAttrs) -> Result<(), RemoteError> {
        fs::write(path, contents).map_err(|e| RemoteError::from_io("write", path, e))?;
        Self::apply_attrs(path, attrs)
    }

    fn makedirs(&self, path: &Path) -> Result<(), RemoteError> {
        fs::create_dir_all(path).map_err(|e| RemoteError::from_io("makedirs", path, e))
    }

    fn put_file(
        &self,
        local: &Path,
        remote: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), RemoteError> {
        let mut source = File::open(local).map_err(|e| RemoteError::from_io("open", local, e))?;
        let total = source
            .metadata()
            .map_err(|e| RemoteError::from_io("stat", local, e))?
            .len();
        let mut dest = File::create(remote).map_err(|e| RemoteError::from_io("create", remote, e))?;

        let mut buf = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        loop {
            let n = source
                .read(&mut buf)
                .map_err(|e| RemoteError::from_io("read", local, e))?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])
                .map_err(|e| RemoteError::from_io("write", remote, e))?;
            copied += n as u64;
            progress(copied, total);
        }
        Ok(())
    }

    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> Result<(), RemoteError> {
        let file = File::open(path).map_err(|e| RemoteError::from_io("open", path, e))?;
        let times = fs::FileTimes::new()
            .set_accessed(system_time(atime))
            .set_modified(system_time(mtime));
        file.set_times(times)
            .map_err(|e| RemoteError::from_io("utime", path, e))
    }

    fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput, RemoteError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_command(cmd, command, opts)
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run a prepared command with stdio wired up per `opts`.
///
/// `command` is the display form used in logs and errors. Output goes to the
/// terminal, to `opts.output_file` (appended), or is captured line by line.
pub fn run_command(
    mut cmd: Command,
    command: &str,
    opts: &ExecOptions,
) -> Result<ExecOutput, RemoteError> {
    let output_file = opts
        .output_file
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| RemoteError::from_io("open", path, e))
        })
        .transpose()?;

    let redirect = |file: &File| -> Result<Stdio, RemoteError> {
        file.try_clone()
            .map(Stdio::from)
            .map_err(|e| RemoteError::Other(format!("cannot redirect output: {e}")))
    };

    cmd.stdin(Stdio::null());
    if !opts.color {
        cmd.env("NO_COLOR", "1");
    }

    if opts.capture {
        cmd.stdout(Stdio::piped());
    } else if let Some(file) = &output_file {
        cmd.stdout(redirect(file)?);
    } else if opts.quiet {
        cmd.stdout(Stdio::null());
    } else {
        cmd.stdout(Stdio::inherit());
    }

    if let Some(file) = &output_file {
        cmd.stderr(redirect(file)?);
    } else if opts.quiet {
        cmd.stderr(Stdio::null());
    } else {
        cmd.stderr(Stdio::inherit());
    }

    if opts.verbose {
        log::info!("--- BEGIN {command} ---");
    }
    let start = Instant::now();

    let output = cmd.output().map_err(|e| RemoteError::Command {
        command: command.to_string(),
        message: e.to_string(),
    })?;
    let exit_code = output.status.code().unwrap_or(-1);

    if opts.verbose {
        log::info!(
            "--- END {:.1}s ({}) {command} ---",
            start.elapsed().as_secs_f64(),
            if exit_code == 0 { "OK".to_string() } else { exit_code.to_string() }
        );
    }

    let lines = if opts.capture {
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    Ok(ExecOutput { exit_code, lines })
}

// ============================================================================
// MockHost
// ============================================================================

/// A file stored on a [`MockHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub mtime: i64,
    pub attrs: FileAttrs,
}

/// Mutating operations recorded by a [`MockHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Write(PathBuf),
    Makedirs(PathBuf),
    Put(PathBuf),
    Utime(PathBuf, i64),
    Execute(String),
}

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<PathBuf, MockFile>,
    dirs: BTreeSet<PathBuf>,
    failures: HashMap<PathBuf, String>,
    scripts: HashMap<String, ExecOutput>,
    journal: Vec<MockOp>,
    clock: i64,
}

/// In-memory host for testing without a network or real filesystem.
///
/// Clones share state, so a test can keep one handle and give another to
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    /// Create an empty mock host.
    pub fn new() -> Self {
        let host = Self::default();
        host.lock().clock = 1_700_000_000;
        host
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a file with an explicit modification time.
    pub fn set_file(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>, mtime: i64) {
        self.lock().files.insert(
            path.into(),
            MockFile {
                data: data.into(),
                mtime,
                attrs: FileAttrs::default(),
            },
        );
    }

    /// Store a file using the mock clock.
    pub fn with_file(self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> Self {
        let mtime = self.lock().clock;
        self.set_file(path, data, mtime);
        self
    }

    /// Mark a directory as existing.
    pub fn with_dir(self, path: impl Into<PathBuf>) -> Self {
        self.lock().dirs.insert(path.into());
        self
    }

    /// Make every operation on `path` fail with a generic remote error.
    pub fn fail_on(&self, path: impl Into<PathBuf>, message: impl Into<String>) {
        self.lock().failures.insert(path.into(), message.into());
    }

    /// Configure the result of a command.
    pub fn set_script(&self, command: impl Into<String>, exit_code: i32, lines: &[&str]) {
        self.lock().scripts.insert(
            command.into(),
            ExecOutput {
                exit_code,
                lines: lines.iter().map(|l| (*l).to_string()).collect(),
            },
        );
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<MockFile> {
        self.lock().files.get(path.as_ref()).cloned()
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.file(path).map(|f| f.data)
    }

    pub fn journal(&self) -> Vec<MockOp> {
        self.lock().journal.clone()
    }

    /// Number of `write_file` calls.
    pub fn writes(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Write(_)))
    }

    /// Number of `put_file` calls.
    pub fn puts(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Put(_)))
    }

    /// Commands executed so far.
    pub fn executed(&self) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                MockOp::Execute(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&MockOp) -> bool) -> usize {
        self.lock().journal.iter().filter(|op| pred(op)).count()
    }

    fn check(state: &MockState, path: &Path) -> Result<(), RemoteError> {
        match state.failures.get(path) {
            Some(message) => Err(RemoteError::Other(message.clone())),
            None => Ok(()),
        }
    }

    fn is_dir(state: &MockState, path: &Path) -> bool {
        path == Path::new("/")
            || state.dirs.contains(path)
            || state.files.keys().any(|f| f.starts_with(path) && f != path)
    }
}

impl RemoteHost for MockHost {
    fn stat(&self, path: &Path) -> Result<RemoteStat, RemoteError> {
        let state = self.lock();
        Self::check(&state, path)?;
        if let Some(file) = state.files.get(path) {
            return Ok(RemoteStat {
                size: file.data.len() as u64,
                mtime: file.mtime,
                is_dir: false,
            });
        }
        if Self::is_dir(&state, path) {
            return Ok(RemoteStat {
                size: 0,
                mtime: 0,
                is_dir: true,
            });
        }
        Err(RemoteError::NotFound(path.to_path_buf()))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, RemoteError> {
        let state = self.lock();
        Self::check(&state, path)?;
        state
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| RemoteError::NotFound(path.to_path_buf()))
    }

    fn write_file(&self, path: &Path, contents: &[u8], attrs: &FileAttrs) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check(&state, path)?;
        state.clock += 1;
        let mtime = state.clock;
        state.files.insert(
            path.to_path_buf(),
            MockFile {
                data: contents.to_vec(),
                mtime,
                attrs: attrs.clone(),
            },
        );
        state.journal.push(MockOp::Write(path.to_path_buf()));
        Ok(())
    }

    fn makedirs(&self, path: &Path) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check(&state, path)?;
        for ancestor in path.ancestors() {
            state.dirs.insert(ancestor.to_path_buf());
        }
        state.journal.push(MockOp::Makedirs(path.to_path_buf()));
        Ok(())
    }

    fn put_file(
        &self,
        local: &Path,
        remote: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), RemoteError> {
        let data = fs::read(local).map_err(|e| RemoteError::from_io("read", local, e))?;
        let total = data.len() as u64;
        {
            let mut state = self.lock();
            Self::check(&state, remote)?;
            state.clock += 1;
            let mtime = state.clock;
            state.files.insert(
                remote.to_path_buf(),
                MockFile {
                    data,
                    mtime,
                    attrs: FileAttrs::default(),
                },
            );
            state.journal.push(MockOp::Put(remote.to_path_buf()));
        }
        progress(total, total);
        Ok(())
    }

    fn utime(&self, path: &Path, _atime: i64, mtime: i64) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check(&state, path)?;
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_path_buf()))?;
        file.mtime = mtime;
        state.journal.push(MockOp::Utime(path.to_path_buf(), mtime));
        Ok(())
    }

    fn execute(&self, command: &str, opts: &ExecOptions) -> Result<ExecOutput, RemoteError> {
        let mut state = self.lock();
        state.journal.push(MockOp::Execute(command.to_string()));
        let mut output = state.scripts.get(command).cloned().unwrap_or_default();
        if !opts.capture {
            output.lines.clear();
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mock_missing_file_is_not_found() {
        let host = MockHost::new();
        let err = host.read_file(Path::new("/etc/missing")).unwrap_err();
        assert!(err.is_not_found());
        assert!(host.stat(Path::new("/etc/missing")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_mock_parent_of_file_is_dir() {
        let host = MockHost::new().with_file("/etc/app/app.conf", "x");
        assert!(host.stat(Path::new("/etc/app")).unwrap().is_dir);
        assert!(!host.stat(Path::new("/etc/app/app.conf")).unwrap().is_dir);
    }

    #[test]
    fn test_mock_failure_injection() {
        let host = MockHost::new().with_file("/etc/app.conf", "x");
        host.fail_on("/etc/app.conf", "permission denied");
        let err = host.read_file(Path::new("/etc/app.conf")).unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "permission denied");
    }

    #[test]
    fn test_mock_scripts_and_journal() {
        let host = MockHost::new();
        host.set_script("uptime", 0, &["up 3 days"]);
        let opts = ExecOptions {
            capture: true,
            ..Default::default()
        };
        let out = host.execute("uptime", &opts).unwrap();
        assert_eq!(out.lines, ["up 3 days"]);
        assert!(out.success());
        assert_eq!(host.executed(), ["uptime"]);
    }

    #[test]
    fn test_local_round_trip_and_not_found() {
        let tmp = TempDir::new().unwrap();
        let host = LocalHost::new();
        let path = tmp.path().join("nested/dir/file.txt");

        assert!(host.read_file(&path).unwrap_err().is_not_found());

        host.makedirs(path.parent().unwrap()).unwrap();
        host.write_file(&path, b"hello", &FileAttrs::default()).unwrap();
        assert_eq!(host.read_file(&path).unwrap(), b"hello");
        assert_eq!(host.stat(&path).unwrap().size, 5);
    }

    #[test]
    fn test_local_put_file_and_utime() {
        let tmp = TempDir::new().unwrap();
        let host = LocalHost::new();
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, vec![7u8; 1000]).unwrap();

        let mut last = (0, 0);
        host.put_file(&src, &dst, &mut |copied, total| last = (copied, total))
            .unwrap();
        assert_eq!(last, (1000, 1000));

        host.utime(&dst, 1_600_000_000, 1_600_000_000).unwrap();
        assert_eq!(host.stat(&dst).unwrap().mtime, 1_600_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_local_execute_exit_code_and_capture() {
        let host = LocalHost::new();
        let opts = ExecOptions {
            capture: true,
            ..Default::default()
        };
        let out = host.execute("echo one; echo two", &opts).unwrap();
        assert_eq!(out.lines, ["one", "two"]);
        assert_eq!(out.exit_code, 0);

        let quiet = ExecOptions {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(host.execute("exit 3", &quiet).unwrap().exit_code, 3);
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_execute_without_color_sets_no_color() {
        let opts = ExecOptions {
            capture: true,
            ..Default::default()
        };
        let out = LocalHost::new().execute("echo \"${NO_COLOR:-unset}\"", &opts).unwrap();
        assert_eq!(out.lines, ["1"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_local_execute_appends_output_file() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("node.log");
        let opts = ExecOptions {
            output_file: Some(log.clone()),
            ..Default::default()
        };
        let host = LocalHost::new();
        host.execute("echo first", &opts).unwrap();
        host.execute("echo second", &opts).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }
}
