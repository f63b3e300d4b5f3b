//! Control operations: named, capability-tagged remote actions
//!
//! Controls are registered explicitly on a [`Plugin`](crate::plugin::Plugin)
//! with [`Plugin::add_control`](crate::plugin::Plugin::add_control). The
//! `provides`/`requires`/`optional_requires` lists are advisory metadata for
//! whatever sequences controls across nodes; invoking a control here is a
//! direct synchronous call.

use crate::error::ControlError;
use crate::manager::Manager;
use crate::plugin::Plugin;
use crate::types::Node;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Callback implementing a control.
pub type ControlHandler =
    Arc<dyn Fn(&Plugin, &mut Manager, &ControlInvocation) -> Result<(), ControlError> + Send + Sync>;

/// Capability metadata of a control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub optional_requires: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provides(mut self, items: &[&str]) -> Self {
        self.provides = owned(items);
        self
    }

    pub fn requires(mut self, items: &[&str]) -> Self {
        self.requires = owned(items);
        self
    }

    pub fn optional_requires(mut self, items: &[&str]) -> Self {
        self.optional_requires = owned(items);
        self
    }
}

/// A registered control.
#[derive(Clone)]
pub struct Control {
    /// Dash-cased name.
    pub name: String,
    pub capabilities: Capabilities,
    pub(crate) handler: ControlHandler,
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Control")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// A control bound to a node and config, as listed for sequencing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOperation {
    pub name: String,
    pub node: String,
    pub config: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// Per-call options of a control invocation.
#[derive(Debug, Clone)]
pub struct ControlInvocation {
    /// Target node.
    pub node: Arc<Node>,
    /// Access method override.
    pub method: Option<String>,
    pub verbose: bool,
    pub quiet: bool,
    pub color: bool,
    /// Directory receiving one `<node>.log` file per node.
    pub output_dir: Option<PathBuf>,
    /// Extra arguments passed after the operation name.
    pub args: Vec<String>,
}

impl ControlInvocation {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            method: None,
            verbose: false,
            quiet: false,
            color: false,
            output_dir: None,
            args: Vec::new(),
        }
    }

    /// Log file for this node's command output, if an output directory is set.
    pub fn output_file(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", self.node.name.replace('/', "_"))))
    }
}

/// Dash-case a control name.
pub fn control_name(name: &str) -> String {
    name.replace('_', "-")
}
