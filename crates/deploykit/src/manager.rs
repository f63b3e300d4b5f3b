//! Verify, audit and deploy passes
//!
//! The [`Manager`] owns the registered [`FileEntry`] list and the bucket
//! store of one session. A pass renders every entry, optionally compares the
//! result with what is deployed and optionally writes it. Per-entry failures
//! are logged and counted and never stop the pass; the aggregate failure is
//! raised by [`VerifyStats::into_result`] once every entry has been handled.
//!
//! Processing order: non-report entries first, then report entries, each
//! group in registration order.

use crate::bucket::{BucketStore, Record};
use crate::entry::{EntryKind, FileEntry};
use crate::error::{Error, RemoteError, VerifyError, format_error};
use crate::inventory::Inventory;
use crate::remote::{RemoteHost, unix_mtime};
use crate::render::{RenderContext, RenderRequest, Rendered, read_source};
use crate::report::{Location, Reporter};
use crate::types::Node;
use similar::TextDiff;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Format of the per-file audit log lines.
fn audit_line(tag: &str, node: &str, path: &str) -> String {
    format!("{tag:>8} {node}: {path}")
}

/// Mode flags for one pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Hand rendered output to the reporter.
    pub show: bool,
    /// Show diffs (template vs rendered, deployed vs rendered) instead of bodies.
    pub show_diff: bool,
    pub deploy: bool,
    pub audit: bool,
    pub verbose: bool,
    /// Skip rendering and use source bytes as-is.
    pub raw: bool,
    /// Deploy under `<prefix>/<node name>/` instead of `/`.
    pub path_prefix: Option<String>,
    /// Override the nodes' default access method.
    pub access_method: Option<String>,
}

/// Final state of one entry in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// Rendered without remote access.
    Rendered,
    /// Deployed content already matched.
    Unchanged,
    Written,
    /// Audit found drift.
    Differs,
    /// Audit found no deployed file.
    Missing,
    /// Directory synced; number of files copied.
    Synced(usize),
    /// Directory source checked without deploying.
    DirChecked { file_count: usize, total_bytes: u64 },
    /// Skipped by the caller's filter.
    Filtered,
    Failed(String),
}

/// Outcome of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub node: String,
    pub config: String,
    pub kind: EntryKind,
    pub dest: Option<String>,
    pub status: EntryStatus,
}

/// Counters accumulated over one pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyStats {
    pub error_count: usize,
    /// File entries considered; directories are not counted.
    pub file_count: usize,
    pub written: usize,
    pub unchanged: usize,
    /// Files copied by directory syncs.
    pub copied: usize,
    pub outcomes: Vec<EntryOutcome>,
}

impl VerifyStats {
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    /// Raise the aggregate failure if any entry failed.
    pub fn into_result(self) -> Result<Self, VerifyError> {
        if self.has_errors() {
            Err(VerifyError::Aggregate {
                error_count: self.error_count,
                file_count: self.file_count,
            })
        } else {
            Ok(self)
        }
    }
}

/// File count and total size of a local directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirStats {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Walk a local directory recursively and sum its regular files.
pub fn dir_stats(path: &Path) -> Result<DirStats, VerifyError> {
    let mut stats = DirStats::default();
    for item in WalkDir::new(path) {
        let item = item.map_err(|e| VerifyError::Source {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        if item.file_type().is_file() {
            let meta = item.metadata().map_err(|e| VerifyError::Source {
                path: item.path().to_path_buf(),
                source: e.into(),
            })?;
            stats.file_count += 1;
            stats.total_bytes += meta.len();
        }
    }
    Ok(stats)
}

/// Lexically normalize a path: drop `.`, resolve `..`, collapse slashes.
fn normalize(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out.to_string_lossy().into_owned()
}

fn unified_diff(old: &str, new: &str, old_name: &str, new_name: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(old_name, new_name)
        .to_string()
}

fn format_mtime(mtime: i64) -> String {
    chrono::DateTime::from_timestamp(mtime, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Copy the regular files of `source` into `dest_dir` when size or mtime differ.
///
/// Returns the number of files copied.
fn copy_tree(
    remote: &dyn RemoteHost,
    source: &Path,
    dest_dir: &Path,
    verbose: bool,
    reporter: &mut dyn Reporter,
) -> Result<usize, Error> {
    if remote.stat(dest_dir).is_err() {
        remote.makedirs(dest_dir)?;
    }

    let source_error = |path: &Path, e: std::io::Error| VerifyError::Source {
        path: path.to_path_buf(),
        source: e,
    };

    let mut files: Vec<PathBuf> = fs::read_dir(source)
        .map_err(|e| source_error(source, e))?
        .filter_map(Result::ok)
        .map(|item| item.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut copied = 0;
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let dest = dest_dir.join(name);
        let meta = fs::metadata(&file).map_err(|e| source_error(&file, e))?;
        let (size, mtime) = (meta.len(), unix_mtime(&meta));

        let needs_copy = match remote.stat(&dest) {
            Ok(stat) => stat.size != size || stat.mtime != mtime,
            Err(_) => true,
        };

        if needs_copy {
            log::info!("copying: {}", dest.display());
            remote.put_file(&file, &dest, &mut |done, total| {
                reporter.on_copy_progress(&dest, done, total);
            })?;
            remote.utime(&dest, mtime, mtime)?;
            copied += 1;
        } else if verbose {
            log::info!("already copied: {}", dest.display());
        }
    }
    Ok(copied)
}

/// Accumulates file entries and buckets for one session and runs passes.
pub struct Manager {
    inventory: Arc<Inventory>,
    entries: Vec<FileEntry>,
    buckets: BucketStore,
}

impl Manager {
    pub fn new(inventory: Arc<Inventory>) -> Self {
        Self {
            inventory,
            entries: Vec::new(),
            buckets: BucketStore::new(),
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Clear all entries and buckets.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.buckets.clear();
    }

    /// Register an entry. Registration order is processing order.
    pub fn add_file(&mut self, entry: FileEntry) {
        log::trace!("add entry: {entry:?}");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Named bucket, created if absent.
    pub fn get_bucket(&mut self, name: &str) -> &mut Vec<Record> {
        self.buckets.get_mut(name)
    }

    /// Records of a bucket, empty if it does not exist.
    pub fn bucket(&self, name: &str) -> &[Record] {
        self.buckets.get(name)
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    /// Run one pass and raise the aggregate error if any entry failed.
    pub fn verify(
        &mut self,
        opts: &VerifyOptions,
        filter: Option<&dyn Fn(&FileEntry) -> bool>,
        reporter: &mut dyn Reporter,
    ) -> Result<VerifyStats, VerifyError> {
        self.run(opts, filter, reporter).into_result()
    }

    /// Run one pass over all entries and return the accumulated stats.
    pub fn run(
        &mut self,
        opts: &VerifyOptions,
        filter: Option<&dyn Fn(&FileEntry) -> bool>,
        reporter: &mut dyn Reporter,
    ) -> VerifyStats {
        log::debug!("verify: {opts:?}");

        let order: Vec<usize> = (0..self.entries.len())
            .filter(|&i| !self.entries[i].report)
            .chain((0..self.entries.len()).filter(|&i| self.entries[i].report))
            .collect();

        let mut stats = VerifyStats::default();
        for index in order {
            let entry = self.entries[index].clone();
            if !self.inventory.verify_enabled(&entry.node) {
                log::debug!("filtered: verify disabled: {entry:?}");
                continue;
            }

            let filtered_out = filter.is_some_and(|keep| !keep(&entry));
            if filtered_out {
                log::debug!("filtered: callback: {entry:?}");
            }

            let prefix = opts
                .path_prefix
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| format!("{p}/{}/", entry.node.name))
                .unwrap_or_default();

            let outcome = match entry.kind {
                EntryKind::Dir => self.process_dir(&entry, filtered_out, opts, &prefix, reporter, &mut stats),
                EntryKind::File => self.process_file(&entry, filtered_out, opts, &prefix, reporter, &mut stats),
            };
            stats.outcomes.push(outcome);
        }

        if stats.has_errors() {
            log::warn!(
                "there were [{}/{}] errors",
                stats.error_count,
                stats.file_count
            );
        }
        stats
    }

    fn emit_error(node: &Node, location: &str, error: &dyn std::fmt::Display, kind: &str) {
        log::warn!("node {}: {location}: {kind}: {error}", node.name);
    }

    fn process_dir(
        &self,
        entry: &FileEntry,
        filtered_out: bool,
        opts: &VerifyOptions,
        prefix: &str,
        reporter: &mut dyn Reporter,
        stats: &mut VerifyStats,
    ) -> EntryOutcome {
        let source = entry
            .resolved_source()
            .unwrap_or_else(|| entry.config.path.clone());
        let dest = entry
            .dest_path
            .as_deref()
            .map(|d| normalize(&format!("{prefix}{d}")));

        let status = if opts.deploy {
            // directory syncs ignore the filter when deploying
            let dest_dir = PathBuf::from(dest.clone().unwrap_or_default());
            let result = self
                .inventory
                .get_remote(&entry.node, opts.access_method.as_deref())
                .map_err(Error::from)
                .and_then(|remote| copy_tree(remote.as_ref(), &source, &dest_dir, opts.verbose, reporter));
            match result {
                Ok(copied) => {
                    stats.copied += copied;
                    EntryStatus::Synced(copied)
                }
                Err(e) => {
                    log::error!("{}: {}: {e}", entry.node.name, dest_dir.display());
                    stats.error_count += 1;
                    EntryStatus::Failed(e.to_string())
                }
            }
        } else if filtered_out {
            EntryStatus::Filtered
        } else {
            match dir_stats(&source) {
                Ok(ds) => {
                    if ds.file_count == 0 {
                        log::warn!("source directory '{}' is empty", source.display());
                    } else if opts.verbose {
                        log::info!(
                            "[OK] copy source directory '{}' has {} files, {} bytes",
                            source.display(),
                            ds.file_count,
                            ds.total_bytes
                        );
                    }
                    EntryStatus::DirChecked {
                        file_count: ds.file_count,
                        total_bytes: ds.total_bytes,
                    }
                }
                Err(e) => {
                    log::error!("cannot copy files from '{}': {e}", source.display());
                    stats.error_count += 1;
                    EntryStatus::Failed(e.to_string())
                }
            }
        };

        EntryOutcome {
            node: entry.node.name.clone(),
            config: entry.config.name.clone(),
            kind: EntryKind::Dir,
            dest,
            status,
        }
    }

    fn render_entry(
        &mut self,
        entry: &FileEntry,
        source: Option<&Path>,
        dest_spec: Option<&str>,
        raw: bool,
    ) -> Result<Rendered, VerifyError> {
        if raw {
            let body = match (entry.source_text.as_deref(), source) {
                (Some(text), _) => text.as_bytes().to_vec(),
                (None, Some(path)) => read_source(path)?,
                (None, None) => Vec::new(),
            };
            return Ok(Rendered {
                dest_path: dest_spec.map(str::to_string),
                body: Some(body),
            });
        }

        let ctx = RenderContext::new(
            &self.inventory,
            &entry.node,
            &entry.config,
            &entry.top_config,
            &self.buckets,
        );
        let request = RenderRequest {
            source_path: source,
            dest_path: dest_spec,
            source_text: entry.source_text.as_deref(),
        };
        let result = entry.render.render(&request, &ctx);
        let published = ctx.take_published();
        for (bucket, record) in published {
            self.buckets.push(&bucket, record);
        }
        result
    }

    /// Template side of a `show --diff`; an unreadable source shows its error marker.
    fn template_source(entry: &FileEntry, source: Option<&Path>) -> String {
        match (entry.source_text.as_deref(), source) {
            (Some(text), _) => text.to_string(),
            (None, Some(path)) => match read_source(path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    log::warn!("node {}: {}: {}: {e}", entry.node.name, path.display(), e.kind_name());
                    format_error(e.kind_name(), &e)
                }
            },
            (None, None) => String::new(),
        }
    }

    fn process_file(
        &mut self,
        entry: &FileEntry,
        filtered_out: bool,
        opts: &VerifyOptions,
        prefix: &str,
        reporter: &mut dyn Reporter,
        stats: &mut VerifyStats,
    ) -> EntryOutcome {
        stats.file_count += 1;
        let node_name = entry.node.name.as_str();
        let source = entry.resolved_source();
        let source_label = source
            .as_ref()
            .map_or_else(|| "<inline>".to_string(), |p| p.display().to_string());

        let mut dest_spec = entry.dest_path.clone().filter(|d| !d.is_empty());
        if let Some(spec) = dest_spec.as_mut()
            && spec.ends_with('/')
            && let Some(name) = source.as_deref().and_then(Path::file_name)
        {
            spec.push_str(&name.to_string_lossy());
        }

        let mut failed = false;
        let mut status = if filtered_out {
            EntryStatus::Filtered
        } else {
            EntryStatus::Rendered
        };

        let (dest, output) = match self.render_entry(entry, source.as_deref(), dest_spec.as_deref(), opts.raw) {
            Ok(rendered) => {
                let dest = rendered
                    .dest_path
                    .filter(|d| !d.is_empty())
                    .map(|d| normalize(&format!("{prefix}{d}")));
                if !opts.audit && !opts.deploy && opts.verbose {
                    log::info!("OK: {node_name}: {}", dest.as_deref().unwrap_or(""));
                }
                (dest, rendered.body.unwrap_or_default())
            }
            Err(e) => {
                Self::emit_error(&entry.node, &source_label, &e, e.kind_name());
                stats.error_count += 1;
                failed = true;
                status = EntryStatus::Failed(e.to_string());
                (dest_spec.clone(), format_error(e.kind_name(), &e).into_bytes())
            }
        };
        let output_text = String::from_utf8_lossy(&output);

        if !output.is_empty()
            && let Some(bucket) = &entry.dest_bucket
        {
            self.buckets.push(
                bucket,
                Record::new(node_name, &entry.top_config.name).with_text(output_text.as_ref()),
            );
        }

        if opts.show && !filtered_out {
            let location = match (&dest, &entry.dest_bucket) {
                (Some(dest), _) => Location::Path(dest),
                (None, Some(bucket)) => Location::Bucket(bucket),
                (None, None) => Location::JustRendered,
            };
            if opts.show_diff {
                let template = Self::template_source(entry, source.as_deref());
                let diff = unified_diff(&template, &output_text, "template", "rendered");
                reporter.on_show(node_name, &location, &diff, true);
            } else {
                reporter.on_show(node_name, &location, &output_text, false);
            }
        }

        let mut active: Option<(Vec<u8>, i64)> = None;
        let mut remote: Option<Arc<dyn RemoteHost>> = None;
        if (opts.audit || opts.deploy)
            && !failed
            && !filtered_out
            && let Some(dest) = dest.as_deref()
        {
            let read = self
                .inventory
                .get_remote(&entry.node, opts.access_method.as_deref())
                .and_then(|host| {
                    let text = host.read_file(Path::new(dest));
                    remote = Some(Arc::clone(&host));
                    let text = text?;
                    let stat = host.stat(Path::new(dest))?;
                    Ok((text, stat.mtime))
                });
            match read {
                Ok(found) => active = Some(found),
                Err(e) if e.is_not_found() => {
                    if opts.audit {
                        log::error!("{node_name}: {dest}: {}: {e}", e.kind_name());
                        stats.error_count += 1;
                        status = EntryStatus::Missing;
                    }
                }
                Err(e) => {
                    log::error!("{node_name}: {dest}: {}: {e}", e.kind_name());
                    stats.error_count += 1;
                    failed = true;
                    status = EntryStatus::Failed(e.to_string());
                }
            }
        }

        if opts.audit
            && let Some((text, mtime)) = active.as_ref().filter(|(text, _)| !text.is_empty())
            && let Some(dest) = dest.as_deref()
        {
            if *text == output {
                if opts.verbose {
                    log::info!("{}", audit_line("OK", node_name, dest));
                }
                status = EntryStatus::Unchanged;
            } else {
                log::warn!("{}", audit_line("DIFFERS", node_name, dest));
                if opts.show_diff {
                    let active_text = String::from_utf8_lossy(text);
                    let header = format!("active\t{}", format_mtime(*mtime));
                    reporter.on_drift(
                        node_name,
                        dest,
                        &unified_diff(&active_text, &output_text, &header, "rendered"),
                    );
                }
                stats.error_count += 1;
                status = EntryStatus::Differs;
            }
        }

        if opts.deploy
            && !failed
            && !filtered_out
            && let (Some(dest), Some(host)) = (dest.as_deref(), remote.as_ref())
        {
            let active_text = active.as_ref().map(|(text, _)| text.as_slice());
            match Self::deploy_file(host.as_ref(), entry, dest, &output, active_text, opts.verbose) {
                Ok(written) => {
                    if written {
                        stats.written += 1;
                        status = EntryStatus::Written;
                    } else {
                        stats.unchanged += 1;
                        if status != EntryStatus::Differs {
                            status = EntryStatus::Unchanged;
                        }
                    }
                    if let Some(hook) = &entry.post_process
                        && let Err(e) = hook(Path::new(dest))
                    {
                        log::error!("{node_name}: {dest}: post-process failed: {e:#}");
                        stats.error_count += 1;
                        status = EntryStatus::Failed(format!("post-process: {e}"));
                    }
                }
                Err(e) => {
                    log::error!("{node_name}: {dest}: {e}");
                    stats.error_count += 1;
                    status = EntryStatus::Failed(e.to_string());
                }
            }
        }

        EntryOutcome {
            node: entry.node.name.clone(),
            config: entry.config.name.clone(),
            kind: EntryKind::File,
            dest,
            status,
        }
    }

    /// Write `output` unless it equals the deployed content.
    ///
    /// Returns whether a write happened.
    fn deploy_file(
        remote: &dyn RemoteHost,
        entry: &FileEntry,
        dest: &str,
        output: &[u8],
        active: Option<&[u8]>,
        verbose: bool,
    ) -> Result<bool, RemoteError> {
        if active == Some(output) {
            if verbose {
                log::info!("{}", audit_line("OK", &entry.node.name, dest));
            }
            return Ok(false);
        }

        let dest_path = Path::new(dest);
        if let Some(dir) = dest_path.parent().filter(|d| !d.as_os_str().is_empty())
            && remote.stat(dir).is_err()
        {
            remote.makedirs(dir)?;
        }

        remote.write_file(dest_path, output, &entry.attrs)?;
        log::info!("{}", audit_line("WROTE", &entry.node.name, dest));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FileAttrs, MockHost, MockOp};
    use crate::render::{TemplateRenderer, VerbatimRenderer};
    use crate::report::NoReport;
    use crate::types::Config;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Setup {
        host: MockHost,
        inventory: Arc<Inventory>,
    }

    fn setup(nodes: &[Node]) -> Setup {
        let host = MockHost::new();
        let mut inv = Inventory::new().with_shared_host(Arc::new(host.clone()));
        for node in nodes {
            inv.add_node(node.clone());
        }
        Setup {
            host,
            inventory: Arc::new(inv),
        }
    }

    fn entry(setup: &Setup, node: &str, settings: Value, text: &str, dest: Option<&str>) -> FileEntry {
        let config = Arc::new(Config::new(node, "app", "/repo/app").with_settings(settings));
        FileEntry {
            kind: EntryKind::File,
            node: Arc::clone(setup.inventory.node(node).unwrap()),
            config: Arc::clone(&config),
            top_config: config,
            source_path: None,
            dest_path: dest.map(str::to_string),
            source_text: Some(text.to_string()),
            render: Arc::new(TemplateRenderer),
            dest_bucket: None,
            attrs: FileAttrs::default(),
            post_process: None,
            report: false,
        }
    }

    fn deploy() -> VerifyOptions {
        VerifyOptions {
            deploy: true,
            ..Default::default()
        }
    }

    fn audit() -> VerifyOptions {
        VerifyOptions {
            audit: true,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Captured {
        shows: Vec<(String, String, String, bool)>,
        drifts: Vec<String>,
    }

    impl Reporter for Captured {
        fn on_show(&mut self, node: &str, location: &Location<'_>, body: &str, is_diff: bool) {
            self.shows
                .push((node.to_string(), location.to_string(), body.to_string(), is_diff));
        }
        fn on_drift(&mut self, _node: &str, _dest: &str, diff: &str) {
            self.drifts.push(diff.to_string());
        }
        fn on_copy_progress(&mut self, _dest: &Path, _copied: u64, _total: u64) {}
    }

    #[test]
    fn test_end_to_end_render_and_redeploy() {
        let s = setup(&[Node::new("sys/node1")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        let hello = |name: &str| {
            entry(&s, "sys/node1", json!({"name": name}), "Hello {{ s.name }}", Some("/etc/app.conf"))
        };

        manager.add_file(hello("node1"));
        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!((stats.file_count, stats.error_count), (1, 0));
        assert_eq!(s.host.contents("/etc/app.conf").unwrap(), b"Hello node1");
        assert_eq!(s.host.writes(), 1);

        manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(s.host.writes(), 1);

        manager.reset();
        manager.add_file(hello("node2"));
        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(s.host.writes(), 2);
        assert_eq!(stats.written, 1);
        assert_eq!(s.host.contents("/etc/app.conf").unwrap(), b"Hello node2");
    }

    #[test]
    fn test_idempotent_deploy_runs_post_process_each_time() {
        let s = setup(&[Node::new("sys/node1")]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut e = entry(&s, "sys/node1", json!({}), "static\n", Some("/etc/motd"));
        e.post_process = Some(Arc::new(move |path: &Path| -> anyhow::Result<()> {
            assert_eq!(path, Path::new("/etc/motd"));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(e);

        let first = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        let second = manager.verify(&deploy(), None, &mut NoReport).unwrap();

        assert_eq!(s.host.writes(), 1);
        assert_eq!((first.written, second.written, second.unchanged), (1, 0, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deploy_creates_missing_parent_dir() {
        let s = setup(&[Node::new("sys/node1")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "x", Some("/opt/app/conf/app.ini")));
        manager.verify(&deploy(), None, &mut NoReport).unwrap();

        let journal = s.host.journal();
        assert_eq!(journal[0], MockOp::Makedirs(PathBuf::from("/opt/app/conf")));
        assert_eq!(journal[1], MockOp::Write(PathBuf::from("/opt/app/conf/app.ini")));
    }

    #[test]
    fn test_failed_post_process_counts_as_error() {
        let s = setup(&[Node::new("sys/node1")]);
        let mut e = entry(&s, "sys/node1", json!({}), "x", Some("/etc/x"));
        e.post_process = Some(Arc::new(|_: &Path| -> anyhow::Result<()> {
            anyhow::bail!("reload failed")
        }));

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(e);
        let err = manager.verify(&deploy(), None, &mut NoReport).unwrap_err();
        assert!(matches!(err, VerifyError::Aggregate { error_count: 1, file_count: 1 }));
        assert_eq!(s.host.writes(), 1);
    }

    #[test]
    fn test_aggregate_failure_keeps_going() {
        let s = setup(&[Node::new("sys/node1")]);
        let tmp = TempDir::new().unwrap();
        let mut manager = Manager::new(Arc::clone(&s.inventory));

        manager.add_file(entry(&s, "sys/node1", json!({}), "one", Some("/etc/one")));
        manager.add_file(entry(&s, "sys/node1", json!({}), "{{ missing.value }}", Some("/etc/two")));
        let mut dir = entry(&s, "sys/node1", json!({}), "", Some("/srv/static"));
        dir.kind = EntryKind::Dir;
        dir.source_path = Some(tmp.path().to_path_buf());
        manager.add_file(dir);
        manager.add_file(entry(&s, "sys/node1", json!({}), "three", Some("/etc/three")));

        let stats = manager.run(&deploy(), None, &mut NoReport);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.file_count, 3);
        assert!(matches!(stats.outcomes[1].status, EntryStatus::Failed(_)));
        assert_eq!(s.host.contents("/etc/one").unwrap(), b"one");
        assert_eq!(s.host.contents("/etc/three").unwrap(), b"three");
        assert!(s.host.contents("/etc/two").is_none());

        let err = stats.into_result().unwrap_err();
        assert_eq!(err.to_string(), "failed: there were [1/3] errors");
    }

    #[test]
    fn test_audit_reports_drift_without_writing() {
        let s = setup(&[Node::new("sys/node1")]);
        s.host.set_file("/etc/app.conf", "old content\n", 1_600_000_000);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "new content\n", Some("/etc/app.conf")));

        let mut captured = Captured::default();
        let opts = VerifyOptions {
            audit: true,
            show_diff: true,
            ..Default::default()
        };
        let stats = manager.run(&opts, None, &mut captured);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.outcomes[0].status, EntryStatus::Differs);
        assert_eq!(s.host.writes(), 0);

        assert_eq!(captured.drifts.len(), 1);
        assert!(captured.drifts[0].contains("-old content"));
        assert!(captured.drifts[0].contains("+new content"));
    }

    #[test]
    fn test_audit_matching_content_is_ok() {
        let s = setup(&[Node::new("sys/node1")]);
        s.host.set_file("/etc/app.conf", "same", 1_600_000_000);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "same", Some("/etc/app.conf")));

        let stats = manager.verify(&audit(), None, &mut NoReport).unwrap();
        assert_eq!(stats.outcomes[0].status, EntryStatus::Unchanged);
    }

    #[test]
    fn test_audit_missing_file_is_one_error() {
        let s = setup(&[Node::new("sys/node1")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "x", Some("/etc/absent")));

        let mut captured = Captured::default();
        let opts = VerifyOptions {
            audit: true,
            show_diff: true,
            ..Default::default()
        };
        let stats = manager.run(&opts, None, &mut captured);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.outcomes[0].status, EntryStatus::Missing);
        assert!(captured.drifts.is_empty());
    }

    #[test]
    fn test_missing_file_is_fine_when_deploying() {
        let s = setup(&[Node::new("sys/node1")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "x", Some("/etc/new")));
        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.outcomes[0].status, EntryStatus::Written);
    }

    #[test]
    fn test_remote_read_failure_skips_deploy() {
        let s = setup(&[Node::new("sys/node1")]);
        s.host.fail_on("/etc/locked", "permission denied");
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/node1", json!({}), "x", Some("/etc/locked")));
        manager.add_file(entry(&s, "sys/node1", json!({}), "y", Some("/etc/open")));

        let stats = manager.run(&deploy(), None, &mut NoReport);
        assert_eq!(stats.error_count, 1);
        assert_eq!(s.host.writes(), 1);
        assert!(matches!(stats.outcomes[0].status, EntryStatus::Failed(_)));
    }

    #[test]
    fn test_disabled_node_is_skipped_entirely() {
        let s = setup(&[Node::new("sys/off").with_verify(false), Node::new("sys/on")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        let mut off = entry(&s, "sys/off", json!({}), "{{ broken", Some("/etc/off"));
        off.dest_bucket = Some("out".into());
        manager.add_file(off);
        manager.add_file(entry(&s, "sys/on", json!({}), "on", Some("/etc/on")));

        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.outcomes.len(), 1);
        assert!(s.host.contents("/etc/off").is_none());
        assert!(manager.bucket("out").is_empty());
    }

    #[test]
    fn test_record_order_survives_failures() {
        let s = setup(&[Node::new("sys/a"), Node::new("sys/b"), Node::new("sys/c")]);
        s.host.fail_on("/etc/b", "disk full");
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        for (node, dest) in [("sys/a", "/etc/a"), ("sys/b", "/etc/b"), ("sys/c", "/etc/c")] {
            let mut e = entry(&s, node, json!({}), "{{ node.name }}", Some(dest));
            e.dest_bucket = Some("names".into());
            manager.add_file(e);
        }

        let stats = manager.run(&deploy(), None, &mut NoReport);
        assert_eq!(stats.error_count, 1);
        let texts: Vec<_> = manager
            .bucket("names")
            .iter()
            .map(|r| r.text.as_deref().unwrap_or(""))
            .collect();
        assert_eq!(texts, ["sys/a", "sys/b", "sys/c"]);
        assert_eq!(manager.bucket("names")[1].source_node, "sys/b");
    }

    #[test]
    fn test_render_error_marker_lands_in_bucket() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        let mut e = entry(&s, "sys/a", json!({}), "{{ nope }}", None);
        e.dest_bucket = Some("out".into());
        manager.add_file(e);

        let stats = manager.run(&VerifyOptions::default(), None, &mut NoReport);
        assert_eq!(stats.error_count, 1);
        let text = manager.bucket("out")[0].text.clone().unwrap();
        assert!(text.starts_with("ERROR: RenderError:"));
    }

    #[test]
    fn test_reports_run_after_files() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));

        let mut report = entry(
            &s,
            "sys/a",
            json!({}),
            "{{ bucket('names') | length }} names",
            None,
        );
        report.report = true;
        report.dest_bucket = Some("summary".into());
        manager.add_file(report);

        let mut producer = entry(&s, "sys/a", json!({}), "a", None);
        producer.dest_bucket = Some("names".into());
        manager.add_file(producer);

        manager.verify(&VerifyOptions::default(), None, &mut NoReport).unwrap();
        assert_eq!(manager.bucket("summary")[0].text.as_deref(), Some("1 names"));
    }

    #[test]
    fn test_template_edges_are_published() {
        let s = setup(&[Node::new("sys/a"), Node::new("sys/b")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(
            &s,
            "sys/a",
            json!({}),
            "{{ edge('links', 'sys/b', 'app', proto='tcp') }}done",
            None,
        ));
        manager.verify(&VerifyOptions::default(), None, &mut NoReport).unwrap();

        let links = manager.bucket("links");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source_node, "sys/a");
        assert_eq!(links[0].dest_node.as_deref(), Some("sys/b"));
    }

    #[test]
    fn test_filtered_entries_count_but_do_not_deploy() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/a", json!({}), "keep", Some("/etc/keep")));
        manager.add_file(entry(&s, "sys/a", json!({}), "skip", Some("/etc/skip")));

        let keep = |e: &FileEntry| e.dest_path.as_deref() == Some("/etc/keep");
        let stats = manager.verify(&deploy(), Some(&keep), &mut NoReport).unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.outcomes[1].status, EntryStatus::Filtered);
        assert_eq!(s.host.writes(), 1);
        assert!(s.host.contents("/etc/skip").is_none());
    }

    #[test]
    fn test_path_prefix_and_trailing_slash_dest() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("motd.txt"), "hi {{ node.name }}").unwrap();

        let mut e = entry(&s, "sys/a", json!({}), "", Some("/etc/"));
        e.source_text = None;
        e.source_path = Some(tmp.path().join("motd.txt"));

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(e);
        let opts = VerifyOptions {
            deploy: true,
            path_prefix: Some("/tmp/stage".into()),
            ..Default::default()
        };
        manager.verify(&opts, None, &mut NoReport).unwrap();
        assert_eq!(
            s.host.contents("/tmp/stage/sys/a/etc/motd.txt").unwrap(),
            b"hi sys/a"
        );
    }

    #[test]
    fn test_show_locations_and_raw_mode() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/a", json!({}), "{{ node.name }}", None));
        let mut bucketed = entry(&s, "sys/a", json!({}), "b", None);
        bucketed.dest_bucket = Some("things".into());
        manager.add_file(bucketed);

        let mut captured = Captured::default();
        let opts = VerifyOptions {
            show: true,
            raw: true,
            ..Default::default()
        };
        manager.verify(&opts, None, &mut captured).unwrap();
        assert_eq!(captured.shows[0].1, "(just rendered)");
        assert_eq!(captured.shows[0].2, "{{ node.name }}");
        assert_eq!(captured.shows[1].1, "bucket:things");
    }

    #[test]
    fn test_show_diff_against_template() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(entry(&s, "sys/a", json!({}), "name={{ node.name }}\n", Some("/etc/n")));

        let mut captured = Captured::default();
        let opts = VerifyOptions {
            show: true,
            show_diff: true,
            ..Default::default()
        };
        manager.verify(&opts, None, &mut captured).unwrap();
        let (_, location, body, is_diff) = &captured.shows[0];
        assert_eq!(location, "/etc/n");
        assert!(is_diff);
        assert!(body.contains("+name=sys/a"));
    }

    #[test]
    fn test_non_ascii_lookup_pattern_in_template() {
        let s = setup(&[Node::new("sys/a")]);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        let mut lookup = entry(&s, "sys/a", json!({}), "{{ find_config('café') | length }}", None);
        lookup.dest_bucket = Some("out".into());
        manager.add_file(lookup);
        manager.add_file(entry(&s, "sys/a", json!({}), "after", Some("/etc/after")));

        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(manager.bucket("out")[0].text.as_deref(), Some("0"));
        assert_eq!(s.host.contents("/etc/after").unwrap(), b"after");
    }

    fn binary_entry(s: &Setup, source: &Path, dest: &str) -> FileEntry {
        let mut e = entry(s, "sys/a", json!({}), "", Some(dest));
        e.source_text = None;
        e.source_path = Some(source.to_path_buf());
        e
    }

    #[test]
    fn test_raw_deploy_keeps_bytes_and_is_idempotent() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("blob.bin");
        fs::write(&source, [97u8, 255, 98]).unwrap();
        s.host.set_file("/srv/blob.bin", vec![97u8, 255, 98], 1_600_000_000);

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(binary_entry(&s, &source, "/srv/blob.bin"));
        let opts = VerifyOptions {
            deploy: true,
            raw: true,
            ..Default::default()
        };
        let stats = manager.verify(&opts, None, &mut NoReport).unwrap();
        assert_eq!((stats.written, stats.unchanged), (0, 1));
        assert_eq!(s.host.writes(), 0);
        assert_eq!(s.host.contents("/srv/blob.bin").unwrap(), [97u8, 255, 98]);
    }

    #[test]
    fn test_verbatim_binary_deploys_once() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("logo.png");
        let bytes = [137u8, 80, 78, 71, 255, 0, 254];
        fs::write(&source, bytes).unwrap();

        let mut e = binary_entry(&s, &source, "/srv/logo.png");
        e.render = Arc::new(VerbatimRenderer);
        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(e);

        let first = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        let second = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!((first.written, second.written, second.unchanged), (1, 0, 1));
        assert_eq!(s.host.contents("/srv/logo.png").unwrap(), bytes);

        let stats = manager.verify(&audit(), None, &mut NoReport).unwrap();
        assert_eq!(stats.outcomes[0].status, EntryStatus::Unchanged);
    }

    #[test]
    fn test_unreadable_template_source_shows_error_marker() {
        let s = setup(&[Node::new("sys/a")]);
        let e = binary_entry(&s, Path::new("/nonexistent/app.conf"), "/etc/app.conf");
        let template = Manager::template_source(&e, e.source_path.as_deref());
        assert!(template.starts_with("ERROR: SourceError:"));
    }

    fn dir_entry(s: &Setup, source: &Path, dest: &str) -> FileEntry {
        let mut e = entry(s, "sys/a", json!({}), "", Some(dest));
        e.kind = EntryKind::Dir;
        e.source_text = None;
        e.source_path = Some(source.to_path_buf());
        e
    }

    #[test]
    fn test_dir_sync_skip_rule() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("logo.png");
        fs::write(&local, vec![1u8; 10]).unwrap();
        let local_mtime = unix_mtime(&fs::metadata(&local).unwrap());

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(dir_entry(&s, tmp.path(), "/srv/static"));

        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(s.host.file("/srv/static/logo.png").unwrap().mtime, local_mtime);
        assert_eq!(stats.file_count, 0);

        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.copied, 0);
        assert_eq!(s.host.puts(), 1);

        s.host.set_file("/srv/static/logo.png", vec![1u8; 10], local_mtime + 1);
        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(s.host.file("/srv/static/logo.png").unwrap().mtime, local_mtime);

        s.host.set_file("/srv/static/logo.png", vec![1u8; 11], local_mtime);
        let stats = manager.verify(&deploy(), None, &mut NoReport).unwrap();
        assert_eq!(stats.copied, 1);
    }

    #[test]
    fn test_dir_sync_ignores_filter_when_deploying() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(dir_entry(&s, tmp.path(), "/srv/files"));
        let none = |_: &FileEntry| false;
        let stats = manager.verify(&deploy(), Some(&none), &mut NoReport).unwrap();
        assert_eq!(stats.copied, 1);
    }

    #[test]
    fn test_dir_verify_reports_stats() {
        let s = setup(&[Node::new("sys/a")]);
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("a.txt"), "abc").unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "de").unwrap();

        let mut manager = Manager::new(Arc::clone(&s.inventory));
        manager.add_file(dir_entry(&s, tmp.path(), "/srv/files"));
        let stats = manager.verify(&VerifyOptions::default(), None, &mut NoReport).unwrap();
        assert_eq!(
            stats.outcomes[0].status,
            EntryStatus::DirChecked {
                file_count: 2,
                total_bytes: 5
            }
        );
        assert_eq!(s.host.puts(), 0);
    }

    #[test]
    fn test_normalize_paths() {
        assert_eq!(normalize("/tmp/stage/sys/a//etc/./x"), "/tmp/stage/sys/a/etc/x");
        assert_eq!(normalize("/etc/app/../motd"), "/etc/motd");
    }
}
