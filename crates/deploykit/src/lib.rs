//! # Deploykit
//!
//! Render per-node configuration files, audit them for drift against what is
//! deployed, and deploy them idempotently.
//!
//! ## Core Concepts
//!
//! - **Inventory**: systems, nodes and configs, with regex lookups and
//!   properties inherited through the system tree
//! - **FileEntry**: one render + deploy unit (a file or a directory)
//! - **Manager**: runs verify, audit and deploy passes over all entries and
//!   owns the cross-node bucket store
//! - **Plugin**: a config bound to a node; registers entries, records and
//!   capability-tagged controls
//!
//! ## Example
//!
//! ```ignore
//! use deploykit::{
//!     Config, FileOptions, Inventory, Manager, MockHost, Node, NoReport,
//!     Plugin, VerifyOptions,
//! };
//! use std::sync::Arc;
//!
//! let host = MockHost::new();
//! let mut inventory = Inventory::new().with_shared_host(Arc::new(host.clone()));
//! inventory.add_node(Node::new("web/front1"));
//! inventory.add_config(
//!     Config::new("web/front1", "motd", "/repo/motd")
//!         .with_settings(serde_json::json!({"name": "front1"})),
//! );
//! let inventory = Arc::new(inventory);
//!
//! let config = Arc::clone(&inventory.configs()[0]);
//! let node = Arc::clone(inventory.node("web/front1").unwrap());
//! let plugin = Plugin::new(Arc::clone(&inventory), node, Arc::clone(&config), config);
//!
//! let mut manager = Manager::new(inventory);
//! plugin.add_file(
//!     &mut manager,
//!     FileOptions::new().text("Hello {{ s.name }}\n").dest("/etc/motd"),
//! )?;
//!
//! let opts = VerifyOptions { deploy: true, ..Default::default() };
//! let stats = manager.verify(&opts, None, &mut NoReport)?;
//! assert_eq!(stats.written, 1);
//! ```
//!
//! ## Provider Traits
//!
//! - [`RemoteHost`]: file access and command execution on a node
//! - [`Connector`]: opens a [`RemoteHost`] for a node and access method
//! - [`Renderer`]: turns a template source into the deployed text
//! - [`Reporter`]: receives rendered output, drift diffs and copy progress
//! - [`ConfigPlugin`]: the entries and controls of one config

pub mod bucket;
pub mod control;
pub mod entry;
pub mod error;
pub mod inventory;
pub mod manager;
pub mod plugin;
pub mod remote;
pub mod render;
pub mod report;
pub mod types;

// Re-export main types at crate root
pub use bucket::{BucketStore, Record};
pub use control::{Capabilities, Control, ControlHandler, ControlInvocation, ControlOperation};
pub use entry::{EntryKind, FileEntry, PostProcess};
pub use error::{ControlError, Error, RemoteError, Result, VerifyError, format_error};
pub use inventory::{ConfigMatch, DEFAULT_ACCESS_METHOD, Inventory, Item};
pub use manager::{
    DirStats, EntryOutcome, EntryStatus, Manager, VerifyOptions, VerifyStats, dir_stats,
};
pub use plugin::{ConfigPlugin, FileOptions, Plugin};
pub use remote::{
    Connector, ExecOptions, ExecOutput, FileAttrs, LocalHost, MockFile, MockHost, MockOp,
    RemoteHost, RemoteStat, StaticConnector, run_command, shell_quote, unix_mtime,
};
pub use render::{
    MarkupRenderer, RenderContext, RenderRequest, Rendered, Renderer, TemplateRenderer,
    VerbatimRenderer, render_template, renderer_by_name,
};
pub use report::{Location, NoReport, Reporter};
pub use types::{Config, Node, System};
