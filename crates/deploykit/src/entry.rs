//! File entries: one render + deploy unit each

use crate::remote::FileAttrs;
use crate::render::Renderer;
use crate::types::{Config, Node};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hook run with the final destination path after every deploy attempt.
pub type PostProcess = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Rendered file.
    File,
    /// Directory copied file by file.
    Dir,
}

/// A registered render/deploy task. Immutable once added to a manager.
#[derive(Clone)]
pub struct FileEntry {
    pub kind: EntryKind,
    pub node: Arc<Node>,
    pub config: Arc<Config>,
    pub top_config: Arc<Config>,
    /// Template source, relative to the config directory unless absolute.
    pub source_path: Option<PathBuf>,
    /// Destination path spec. `None` or empty means render only.
    pub dest_path: Option<String>,
    pub source_text: Option<String>,
    pub render: Arc<dyn Renderer>,
    pub dest_bucket: Option<String>,
    pub attrs: FileAttrs,
    pub post_process: Option<PostProcess>,
    /// Report entries run after all other entries of a pass.
    pub report: bool,
}

impl FileEntry {
    /// Source path resolved against the owning config's directory.
    pub fn resolved_source(&self) -> Option<PathBuf> {
        self.source_path.as_ref().map(|p| self.config.path.join(p))
    }
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("kind", &self.kind)
            .field("node", &self.node.name)
            .field("config", &self.config.name)
            .field("top_config", &self.top_config.name)
            .field("source_path", &self.source_path)
            .field("dest_path", &self.dest_path)
            .field("render", &self.render.name())
            .field("dest_bucket", &self.dest_bucket)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}
