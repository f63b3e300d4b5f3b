//! Repository manifest loading
//!
//! A repository is a directory holding `rigging.toml` plus the template
//! sources of every config. The manifest declares systems, nodes and configs;
//! this module turns it into a [`deploykit::Inventory`] and registers every
//! config's entries and controls with a [`deploykit::Manager`].

use anyhow::{Context, Result, bail};
use deploykit::{
    Capabilities, Config, ConfigMatch, ConfigPlugin, Connector, FileOptions, Inventory, Manager,
    Node, Plugin, System, VerifyError, renderer_by_name,
};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Manifest file name at the repository root.
pub const MANIFEST_FILE: &str = "rigging.toml";

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    pub systems: BTreeMap<String, SystemSpec>,
    pub nodes: BTreeMap<String, NodeSpec>,
    pub configs: Vec<ConfigSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SystemSpec {
    pub verify: Option<bool>,
    pub template: Option<bool>,
    pub deploy: Option<String>,
    pub props: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub host: String,
    pub user: Option<String>,
    pub ssh_key: Option<String>,
    pub deploy: Option<String>,
    pub verify: Option<bool>,
    pub template: Option<bool>,
    pub props: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigSpec {
    pub node: String,
    pub name: String,
    /// Source directory relative to the repository root (default: `name`).
    pub path: Option<String>,
    /// Config pattern of the parent config.
    pub parent: Option<String>,
    pub settings: Map<String, Value>,
    pub files: Vec<FileSpec>,
    pub dirs: Vec<DirSpec>,
    pub controls: Vec<ControlSpec>,
    pub records: Vec<RecordSpec>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileSpec {
    pub source: Option<String>,
    pub dest: Option<String>,
    pub text: Option<String>,
    pub bucket: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    #[serde(deserialize_with = "octal_mode")]
    pub mode: Option<u32>,
    pub report: bool,
    pub auto_override: bool,
    pub renderer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirSpec {
    pub source: String,
    pub dest: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSpec {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub optional_requires: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordSpec {
    pub bucket: String,
    pub dest_node: Option<String>,
    pub dest_config: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

/// Accept `mode = "0644"` as well as `mode = 420`.
fn octal_mode<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mode {
        Text(String),
        Number(u32),
    }

    match Option::<Mode>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Mode::Number(mode)) => Ok(Some(mode)),
        Some(Mode::Text(text)) => {
            let digits = text.trim_start_matches("0o");
            u32::from_str_radix(digits, 8)
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid octal mode {text:?}")))
        }
    }
}

impl ConfigSpec {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.node, self.name)
    }
}

impl FileSpec {
    fn options(&self) -> FileOptions {
        let mut opts = FileOptions::new()
            .report(self.report)
            .auto_override(self.auto_override);
        if let Some(source) = &self.source {
            opts = opts.source(source);
        }
        if let Some(dest) = &self.dest {
            opts = opts.dest(dest);
        }
        if let Some(text) = &self.text {
            opts = opts.text(text);
        }
        if let Some(bucket) = &self.bucket {
            opts = opts.bucket(bucket);
        }
        if let Some(owner) = &self.owner {
            opts = opts.owner(owner);
        }
        if let Some(group) = &self.group {
            opts = opts.group(group);
        }
        if let Some(mode) = self.mode {
            opts = opts.mode(mode);
        }
        if let Some(renderer) = self.renderer.as_deref().and_then(renderer_by_name) {
            opts = opts.renderer(renderer);
        }
        opts
    }
}

// ============================================================================
// Config Behavior
// ============================================================================

/// The entries, records and controls a manifest config declares.
struct ManifestPlugin<'a>(&'a ConfigSpec);

fn strings(items: &[String]) -> Vec<&str> {
    items.iter().map(String::as_str).collect()
}

impl ConfigPlugin for ManifestPlugin<'_> {
    fn add_actions(&self, plugin: &Plugin, manager: &mut Manager) -> Result<(), VerifyError> {
        let spec = self.0;
        for file in &spec.files {
            plugin.add_file(manager, file.options())?;
        }
        for dir in &spec.dirs {
            plugin.add_dir(manager, &dir.source, &dir.dest);
        }
        for record in &spec.records {
            match &record.dest_node {
                Some(dest_node) => plugin.add_edge(
                    manager,
                    &record.bucket,
                    dest_node,
                    record.dest_config.as_deref().unwrap_or_default(),
                    record.values.clone(),
                ),
                None => plugin.add_record(manager, &record.bucket, record.values.clone()),
            }
        }
        Ok(())
    }

    fn add_controls(&self, plugin: &mut Plugin) {
        for control in &self.0.controls {
            let capabilities = Capabilities::new()
                .provides(&strings(&control.provides))
                .requires(&strings(&control.requires))
                .optional_requires(&strings(&control.optional_requires));
            let script = control.script.clone();
            plugin.add_control(&control.name, capabilities, move |plugin, manager, invocation| {
                plugin.remote_execute(manager, invocation, &script)
            });
        }
    }
}

// ============================================================================
// Repository
// ============================================================================

/// A loaded repository.
#[derive(Debug)]
pub struct Repo {
    pub root: PathBuf,
    pub manifest: Manifest,
}

impl Repo {
    /// Load `rigging.toml` from a repository root (`~` is expanded).
    pub fn load(root: &str) -> Result<Self> {
        let root = PathBuf::from(shellexpand::tilde(root).as_ref());
        let path = root.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("Invalid {} format", path.display()))?;
        Self::new(root, manifest)
    }

    /// Wrap an already parsed manifest, validating cross references.
    pub fn new(root: impl Into<PathBuf>, manifest: Manifest) -> Result<Self> {
        let repo = Self {
            root: root.into(),
            manifest,
        };
        repo.validate()?;
        Ok(repo)
    }

    fn validate(&self) -> Result<()> {
        for spec in &self.manifest.configs {
            if !self.manifest.nodes.contains_key(&spec.node) {
                bail!("config {:?}: unknown node {:?}", spec.full_name(), spec.node);
            }
            for file in &spec.files {
                if let Some(name) = &file.renderer
                    && renderer_by_name(name).is_none()
                {
                    bail!("config {:?}: unknown renderer {name:?}", spec.full_name());
                }
            }
            self.parent_chain(spec)?;
        }
        Ok(())
    }

    /// Index of the config a `parent` pattern names.
    fn parent_of(&self, spec: &ConfigSpec) -> Result<Option<usize>> {
        let Some(pattern) = &spec.parent else {
            return Ok(None);
        };
        let matcher = ConfigMatch::new(pattern, true)
            .with_context(|| format!("config {:?}: bad parent pattern", spec.full_name()))?;
        let hits: Vec<usize> = self
            .manifest
            .configs
            .iter()
            .enumerate()
            .filter(|(_, c)| matcher.matches_node(&c.node) && matcher.matches_config(&c.name))
            .map(|(i, _)| i)
            .collect();
        match hits.as_slice() {
            [] => bail!(
                "config {:?} parent config {pattern:?} not found",
                spec.full_name()
            ),
            [index] => Ok(Some(*index)),
            _ => {
                let names: Vec<String> = hits
                    .iter()
                    .map(|&i| self.manifest.configs[i].full_name())
                    .collect();
                bail!(
                    "config {:?}'s parent config {pattern:?} matches multiple configs: {}",
                    spec.full_name(),
                    names.join(", ")
                )
            }
        }
    }

    /// Ancestors of a config, nearest first.
    fn parent_chain(&self, spec: &ConfigSpec) -> Result<Vec<usize>> {
        let mut chain = Vec::new();
        let mut current = spec;
        while let Some(index) = self.parent_of(current)? {
            if chain.contains(&index) || std::ptr::eq(&self.manifest.configs[index], spec) {
                bail!("config {:?}: parent cycle", spec.full_name());
            }
            chain.push(index);
            current = &self.manifest.configs[index];
        }
        Ok(chain)
    }

    /// Settings of a config merged over those of its ancestors.
    fn settings(&self, spec: &ConfigSpec) -> Result<Value> {
        let mut merged = Value::Object(Map::new());
        for &index in self.parent_chain(spec)?.iter().rev() {
            merge(&mut merged, &Value::Object(self.manifest.configs[index].settings.clone()));
        }
        merge(&mut merged, &Value::Object(spec.settings.clone()));
        Ok(merged)
    }

    fn config_dir(&self, spec: &ConfigSpec) -> PathBuf {
        self.root.join(spec.path.as_deref().unwrap_or(&spec.name))
    }

    /// Build the inventory, opening remotes through `connector`.
    pub fn inventory(&self, connector: impl Connector + 'static) -> Result<Inventory> {
        let mut inventory = Inventory::new().with_connector(connector);

        for (name, spec) in &self.manifest.systems {
            inventory.add_system(System {
                name: name.clone(),
                verify: spec.verify,
                template: spec.template,
                deploy: spec.deploy.clone(),
                props: spec.props.clone(),
            });
        }

        for (name, spec) in &self.manifest.nodes {
            let mut node = Node::new(name).with_host(&spec.host);
            node.user.clone_from(&spec.user);
            node.ssh_key.clone_from(&spec.ssh_key);
            node.deploy.clone_from(&spec.deploy);
            node.verify = spec.verify;
            node.template = spec.template;
            node.props = spec.props.clone();
            inventory.add_node(node);
        }

        for spec in &self.manifest.configs {
            let mut config = Config::new(&spec.node, &spec.name, self.config_dir(spec))
                .with_settings(self.settings(spec)?);
            config.parent.clone_from(&spec.parent);
            inventory.add_config(config);
        }

        Ok(inventory)
    }

    /// Register every config's entries and controls.
    ///
    /// All configs contribute their own entries first; inherited entries
    /// follow once every node is loaded.
    pub fn collect(&self, inventory: &Arc<Inventory>, manager: &mut Manager) -> Result<Vec<Plugin>> {
        let configs = inventory.configs();
        let mut plugins = Vec::new();

        for (spec, config) in self.manifest.configs.iter().zip(configs) {
            let node = self.node_of(inventory, spec)?;
            let plugin = Plugin::new(Arc::clone(inventory), node, Arc::clone(config), Arc::clone(config))
                .collect(&ManifestPlugin(spec), manager)
                .with_context(|| format!("config {:?}", spec.full_name()))?;
            plugins.push(plugin);
        }

        for (spec, config) in self.manifest.configs.iter().zip(configs) {
            let node = self.node_of(inventory, spec)?;
            for index in self.parent_chain(spec)? {
                let parent = &self.manifest.configs[index];
                let plugin = Plugin::new(
                    Arc::clone(inventory),
                    Arc::clone(&node),
                    Arc::clone(&configs[index]),
                    Arc::clone(config),
                )
                .collect(&ManifestPlugin(parent), manager)
                .with_context(|| {
                    format!("config {:?} via {:?}", parent.full_name(), spec.full_name())
                })?;
                plugins.push(plugin);
            }
        }

        log::debug!(
            "collected {} plugins, {} entries",
            plugins.len(),
            manager.entries().len()
        );
        Ok(plugins)
    }

    fn node_of(&self, inventory: &Inventory, spec: &ConfigSpec) -> Result<Arc<Node>> {
        inventory
            .node(&spec.node)
            .cloned()
            .with_context(|| format!("config {:?}: unknown node", spec.full_name()))
    }
}

/// Recursively merge `overlay` into `base`; overlay values win.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
