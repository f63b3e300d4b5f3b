//! Config plugins
//!
//! A [`Plugin`] is bound to one `(node, config, top_config)` triple. It
//! registers file entries and controls for its config, publishes records,
//! resolves lookups and runs control scripts on the node.
//!
//! The behavior of a config is supplied through [`ConfigPlugin`]; the
//! [`Plugin`] value carries the binding and the helper methods.

use crate::bucket::Record;
use crate::control::{
    Capabilities, Control, ControlHandler, ControlInvocation, ControlOperation, control_name,
};
use crate::entry::{EntryKind, FileEntry, PostProcess};
use crate::error::{ControlError, VerifyError};
use crate::inventory::{Inventory, Item};
use crate::manager::Manager;
use crate::remote::{ExecOptions, FileAttrs, shell_quote};
use crate::render::{RenderContext, Renderer, TemplateRenderer, render_template};
use crate::types::{Config, Node, System};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Behavior of one config: the entries and controls it contributes.
pub trait ConfigPlugin: Send + Sync {
    /// Register file entries and records.
    fn add_actions(&self, plugin: &Plugin, manager: &mut Manager) -> Result<(), VerifyError>;

    /// Register controls.
    fn add_controls(&self, _plugin: &mut Plugin) {}
}

/// Options for [`Plugin::add_file`].
#[derive(Clone, Default)]
pub struct FileOptions {
    source_path: Option<PathBuf>,
    dest_path: Option<String>,
    source_text: Option<String>,
    dest_bucket: Option<String>,
    attrs: FileAttrs,
    render: Option<Arc<dyn Renderer>>,
    report: bool,
    post_process: Option<PostProcess>,
    auto_override: bool,
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template source, relative to the config directory.
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn dest(mut self, path: impl Into<String>) -> Self {
        self.dest_path = Some(path.into());
        self
    }

    /// Inline template body.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    /// Append the rendered output to a bucket.
    pub fn bucket(mut self, name: impl Into<String>) -> Self {
        self.dest_bucket = Some(name.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.attrs.owner = Some(owner.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.attrs.group = Some(group.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.attrs.mode = Some(mode);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.render = Some(renderer);
        self
    }

    /// Process after all non-report entries.
    pub fn report(mut self, report: bool) -> Self {
        self.report = report;
        self
    }

    pub fn post_process(mut self, hook: PostProcess) -> Self {
        self.post_process = Some(hook);
        self
    }

    /// Look the source up in the config and top config directories.
    pub fn auto_override(mut self, enabled: bool) -> Self {
        self.auto_override = enabled;
        self
    }
}

/// A config's plugin instance bound to a node.
pub struct Plugin {
    pub node: Arc<Node>,
    pub config: Arc<Config>,
    pub top_config: Arc<Config>,
    inventory: Arc<Inventory>,
    renderer: Arc<dyn Renderer>,
    controls: Vec<Control>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("node", &self.node.name)
            .field("config", &self.config.name)
            .field("top_config", &self.top_config.name)
            .field("controls", &self.controls)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(
        inventory: Arc<Inventory>,
        node: Arc<Node>,
        config: Arc<Config>,
        top_config: Arc<Config>,
    ) -> Self {
        Self {
            node,
            config,
            top_config,
            inventory,
            renderer: Arc::new(TemplateRenderer),
            controls: Vec::new(),
        }
    }

    /// Use a different default renderer for this plugin's entries.
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Run a config's behavior: entries first, then controls.
    pub fn collect(mut self, behavior: &dyn ConfigPlugin, manager: &mut Manager) -> Result<Self, VerifyError> {
        log::debug!(
            "collect: {} config={} top={}",
            self.node.name,
            self.config.name,
            self.top_config.name
        );
        behavior.add_actions(&self, manager)?;
        behavior.add_controls(&mut self);
        Ok(self)
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    fn entry(&self, kind: EntryKind, render: Arc<dyn Renderer>) -> FileEntry {
        FileEntry {
            kind,
            node: Arc::clone(&self.node),
            config: Arc::clone(&self.config),
            top_config: Arc::clone(&self.top_config),
            source_path: None,
            dest_path: None,
            source_text: None,
            render,
            dest_bucket: None,
            attrs: FileAttrs::default(),
            post_process: None,
            report: false,
        }
    }

    /// Register a rendered file bound to this plugin's node and config.
    pub fn add_file(&self, manager: &mut Manager, opts: FileOptions) -> Result<(), VerifyError> {
        let source_path = match opts.source_path {
            Some(name) if opts.auto_override => Some(self.override_path(&name)?),
            other => other,
        };

        let render = opts.render.unwrap_or_else(|| Arc::clone(&self.renderer));
        manager.add_file(FileEntry {
            source_path,
            dest_path: opts.dest_path,
            source_text: opts.source_text,
            dest_bucket: opts.dest_bucket,
            attrs: opts.attrs,
            post_process: opts.post_process,
            report: opts.report,
            ..self.entry(EntryKind::File, render)
        });
        Ok(())
    }

    /// Register a directory copied file by file to `dest_path`.
    pub fn add_dir(&self, manager: &mut Manager, source_path: impl Into<PathBuf>, dest_path: impl Into<String>) {
        manager.add_file(FileEntry {
            source_path: Some(source_path.into()),
            dest_path: Some(dest_path.into()),
            ..self.entry(EntryKind::Dir, Arc::clone(&self.renderer))
        });
    }

    /// Locate an override file in the config directory, then the top config's.
    pub fn override_path(&self, name: &Path) -> Result<PathBuf, VerifyError> {
        [&self.config.path, &self.top_config.path]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
            .map(|found| std::path::absolute(&found).unwrap_or(found))
            .ok_or_else(|| VerifyError::NoOverride {
                file: name.display().to_string(),
                config: self.top_config.name.clone(),
            })
    }

    /// Exactly one node and/or system fully matching `name`.
    pub fn get_one(&self, name: &str, nodes: bool, systems: bool) -> Result<Item<'_>, VerifyError> {
        self.inventory.get_one(name, nodes, systems)
    }

    pub fn get_node(&self, name: &str) -> Result<&Node, VerifyError> {
        match self.get_one(name, true, false)? {
            Item::Node(node) => Ok(node),
            Item::System(system) => Err(VerifyError::NotFound {
                kind: "node",
                pattern: system.name.clone(),
            }),
        }
    }

    pub fn get_system(&self, name: &str) -> Result<&System, VerifyError> {
        match self.get_one(name, false, true)? {
            Item::System(system) => Ok(system),
            Item::Node(node) => Err(VerifyError::NotFound {
                kind: "system",
                pattern: node.name.clone(),
            }),
        }
    }

    /// A record tagged with this plugin's node and top config.
    pub fn record(&self) -> Record {
        Record::new(&self.node.name, &self.top_config.name)
    }

    /// Append a record to a bucket.
    pub fn add_record(&self, manager: &mut Manager, bucket: &str, values: BTreeMap<String, Value>) {
        let mut record = self.record();
        record.values = values;
        manager.get_bucket(bucket).push(record);
    }

    /// Append an edge towards `dest_node`/`dest_config` to a bucket.
    pub fn add_edge(
        &self,
        manager: &mut Manager,
        bucket: &str,
        dest_node: &str,
        dest_config: &str,
        values: BTreeMap<String, Value>,
    ) {
        let mut record = self.record().with_dest(dest_node, dest_config);
        record.values = values;
        manager.get_bucket(bucket).push(record);
    }

    /// Render a template string with this plugin's bindings.
    pub fn render_str(&self, manager: &mut Manager, text: &str) -> Result<String, VerifyError> {
        let (result, published) = {
            let ctx = RenderContext::new(
                &self.inventory,
                &self.node,
                &self.config,
                &self.top_config,
                manager.buckets(),
            );
            let result = render_template(text, &ctx);
            (result, ctx.take_published())
        };
        for (bucket, record) in published {
            manager.get_bucket(&bucket).push(record);
        }
        result
    }

    /// Register a control; the name is dash-cased.
    pub fn add_control<F>(&mut self, name: &str, capabilities: Capabilities, handler: F)
    where
        F: Fn(&Plugin, &mut Manager, &ControlInvocation) -> Result<(), ControlError> + Send + Sync + 'static,
    {
        let name = control_name(name);
        let handler: ControlHandler = Arc::new(handler);
        let control = Control {
            name: name.clone(),
            capabilities,
            handler,
        };
        match self.controls.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = control,
            None => self.controls.push(control),
        }
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    /// Registered controls bound to the given node and config.
    pub fn iter_control_operations<'a>(
        &'a self,
        node: &'a Node,
        config: &'a Config,
    ) -> impl Iterator<Item = ControlOperation> + 'a {
        self.controls.iter().map(move |control| ControlOperation {
            name: control.name.clone(),
            node: node.name.clone(),
            config: config.name.clone(),
            capabilities: control.capabilities.clone(),
        })
    }

    /// Invoke a registered control.
    pub fn invoke(
        &self,
        name: &str,
        manager: &mut Manager,
        invocation: &ControlInvocation,
    ) -> Result<(), ControlError> {
        let control = self
            .controls
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ControlError::UnknownControl {
                name: name.to_string(),
                config: self.top_config.full_name(),
            })?;
        log::debug!("control {name}: {}", self.node.name);
        (control.handler)(self, manager, invocation)
    }

    /// Render `script` and run it on the node.
    ///
    /// The invocation's extra arguments are appended shell-quoted, after
    /// rendering. Fails with [`ControlError::Failed`] on a non-zero exit
    /// code. When `capture` is set the stdout lines are returned.
    pub fn remote_gen_execute(
        &self,
        manager: &mut Manager,
        invocation: &ControlInvocation,
        script: &str,
        capture: bool,
    ) -> Result<impl Iterator<Item = String>, ControlError> {
        let mut command = self.render_str(manager, script)?;
        for arg in &invocation.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let remote = self
            .inventory
            .get_remote(&invocation.node, invocation.method.as_deref())?;

        let opts = ExecOptions {
            verbose: invocation.verbose,
            quiet: invocation.quiet,
            capture,
            output_file: invocation.output_file(),
            color: invocation.color,
        };
        let output = remote.execute(&command, &opts)?;
        if !output.success() {
            return Err(ControlError::Failed {
                command,
                exit_code: output.exit_code,
            });
        }
        Ok(output.lines.into_iter())
    }

    /// Run a script on the node, discarding its output.
    pub fn remote_execute(
        &self,
        manager: &mut Manager,
        invocation: &ControlInvocation,
        script: &str,
    ) -> Result<(), ControlError> {
        self.remote_gen_execute(manager, invocation, script, false)?
            .for_each(drop);
        Ok(())
    }
}
