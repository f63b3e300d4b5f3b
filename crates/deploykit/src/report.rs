//! Reporting callbacks for verify passes
//!
//! The engine never prints. Rendered output, drift diffs and copy progress
//! are handed to a [`Reporter`]; the command line supplies a terminal
//! implementation and library users can pass [`NoReport`].

use std::fmt;
use std::path::Path;

/// Where a shown entry ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location<'a> {
    /// Destination path on the node.
    Path(&'a str),
    /// Bucket receiving the rendered text.
    Bucket(&'a str),
    /// Neither: the entry was only rendered.
    JustRendered,
}

impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.write_str(path),
            Self::Bucket(name) => write!(f, "bucket:{name}"),
            Self::JustRendered => f.write_str("(just rendered)"),
        }
    }
}

/// Receives the visible output of a verify pass.
pub trait Reporter: Send {
    /// Rendered output, or a diff against the template source when `is_diff`.
    fn on_show(&mut self, node: &str, location: &Location<'_>, body: &str, is_diff: bool);

    /// Unified diff between deployed and rendered content.
    fn on_drift(&mut self, node: &str, dest: &str, diff: &str);

    /// Bytes copied so far during a directory sync.
    fn on_copy_progress(&mut self, dest: &Path, copied: u64, total: u64);
}

/// A reporter that discards everything.
pub struct NoReport;

impl Reporter for NoReport {
    fn on_show(&mut self, _node: &str, _location: &Location<'_>, _body: &str, _is_diff: bool) {}
    fn on_drift(&mut self, _node: &str, _dest: &str, _diff: &str) {}
    fn on_copy_progress(&mut self, _dest: &Path, _copied: u64, _total: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        assert_eq!(Location::Path("/etc/app.conf").to_string(), "/etc/app.conf");
        assert_eq!(Location::Bucket("backends").to_string(), "bucket:backends");
        assert_eq!(Location::JustRendered.to_string(), "(just rendered)");
    }
}
