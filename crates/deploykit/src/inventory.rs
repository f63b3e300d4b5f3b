//! Inventory of systems, nodes and configs
//!
//! The inventory answers every lookup the engine and templates need:
//! node and system search by regex, `node/config` pattern matching, tree
//! properties inherited through the system hierarchy, and cached remote
//! host handles.

use crate::error::{RemoteError, VerifyError};
use crate::remote::{Connector, RemoteHost, StaticConnector};
use crate::types::{Config, Node, System, parent_path};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// Access method used when neither the caller nor the tree names one.
pub const DEFAULT_ACCESS_METHOD: &str = "ssh";

/// A node or system returned by [`Inventory::find`].
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum Item<'a> {
    Node(&'a Node),
    System(&'a System),
}

impl Item<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::Node(node) => &node.name,
            Self::System(system) => &system.name,
        }
    }
}

/// Compile a lookup regex. Full match anchors both ends.
fn compile(pattern: &str, full_match: bool) -> Result<Regex, VerifyError> {
    let source = if full_match {
        let body = pattern.strip_suffix('$').unwrap_or(pattern);
        format!("^(?:{body})$")
    } else {
        pattern.to_string()
    };
    Regex::new(&source).map_err(|e| VerifyError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Matcher for `node_regex/config_regex` patterns.
///
/// `//` stands for any number of intermediate path components. A pattern
/// without a slash matches configs of any node.
#[derive(Debug, Clone)]
pub struct ConfigMatch {
    node: Regex,
    config: Regex,
}

impl ConfigMatch {
    pub fn new(pattern: &str, full_match: bool) -> Result<Self, VerifyError> {
        let head = pattern
            .char_indices()
            .next_back()
            .map_or(pattern, |(last, _)| &pattern[..last]);
        if head.contains('$') {
            return Err(VerifyError::Pattern {
                pattern: pattern.to_string(),
                message: "invalid chars in pattern".into(),
            });
        }

        let expanded = pattern.replace("//", "/.*/");
        let (node_pattern, config_pattern) = match expanded.rsplit_once('/') {
            Some((node, config)) => (node.to_string(), config.to_string()),
            None => (".".to_string(), expanded),
        };

        Ok(Self {
            node: compile(&node_pattern, full_match)?,
            config: compile(&config_pattern, full_match)?,
        })
    }

    pub fn matches_node(&self, node: &str) -> bool {
        self.node.is_match(node)
    }

    pub fn matches_config(&self, config: &str) -> bool {
        self.config.is_match(config)
    }

    pub fn matches(&self, node: &Node, config: &Config) -> bool {
        self.matches_node(&node.name) && self.matches_config(&config.name)
    }
}

/// All systems, nodes and configs of one repository.
pub struct Inventory {
    systems: BTreeMap<String, System>,
    nodes: BTreeMap<String, Arc<Node>>,
    configs: Vec<Arc<Config>>,
    connector: Option<Arc<dyn Connector>>,
    remotes: Mutex<HashMap<(String, String), Arc<dyn RemoteHost>>>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("systems", &self.systems.len())
            .field("nodes", &self.nodes.len())
            .field("configs", &self.configs.len())
            .finish_non_exhaustive()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            systems: BTreeMap::new(),
            nodes: BTreeMap::new(),
            configs: Vec::new(),
            connector: None,
            remotes: Mutex::new(HashMap::new()),
        }
    }

    /// Use `connector` to open remote hosts.
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Serve every node and access method from one host.
    pub fn with_shared_host(self, host: Arc<dyn RemoteHost>) -> Self {
        self.with_connector(StaticConnector(host))
    }

    /// Add or replace a system, creating its missing ancestors.
    pub fn add_system(&mut self, system: System) {
        if let Some(parent) = system.parent_name() {
            self.ensure_system(parent);
        }
        self.systems.insert(system.name.clone(), system);
    }

    fn ensure_system(&mut self, name: &str) {
        let mut current = Some(name);
        while let Some(name) = current {
            if !self.systems.contains_key(name) {
                self.systems.insert(name.to_string(), System::new(name));
            }
            current = parent_path(name);
        }
    }

    /// Add or replace a node, creating its systems implicitly.
    pub fn add_node(&mut self, node: Node) {
        if let Some(system) = node.system.clone() {
            self.ensure_system(&system);
        }
        self.nodes.insert(node.name.clone(), Arc::new(node));
    }

    /// Add a config. Configs keep insertion order per node.
    pub fn add_config(&mut self, config: Config) {
        self.configs.push(Arc::new(config));
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn systems(&self) -> impl Iterator<Item = &System> {
        self.systems.values()
    }

    pub fn configs(&self) -> &[Arc<Config>] {
        &self.configs
    }

    /// Configs owned by a node, in insertion order.
    pub fn configs_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Arc<Config>> + 'a {
        self.configs.iter().filter(move |c| c.node == node)
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    pub fn system(&self, name: &str) -> Option<&System> {
        self.systems.get(name)
    }

    /// Nodes whose name matches `pattern`, sorted by name.
    pub fn find_nodes(
        &self,
        pattern: &str,
        full_match: bool,
        exclude: Option<&str>,
    ) -> Result<Vec<&Arc<Node>>, VerifyError> {
        let regex = compile(pattern, full_match)?;
        let exclude = exclude.map(|p| compile(p, false)).transpose()?;
        Ok(self
            .nodes
            .values()
            .filter(|n| regex.is_match(&n.name))
            .filter(|n| !exclude.as_ref().is_some_and(|ex| ex.is_match(&n.name)))
            .collect())
    }

    /// Systems whose name matches `pattern`, sorted by name.
    pub fn find_systems(&self, pattern: &str, full_match: bool) -> Result<Vec<&System>, VerifyError> {
        let regex = compile(pattern, full_match)?;
        Ok(self
            .systems
            .values()
            .filter(|s| regex.is_match(&s.name))
            .collect())
    }

    /// Nodes and/or systems matching `pattern`, ordered by name.
    pub fn find(
        &self,
        pattern: &str,
        nodes: bool,
        systems: bool,
        full_match: bool,
    ) -> Result<Vec<Item<'_>>, VerifyError> {
        let mut hits = Vec::new();
        if systems {
            hits.extend(self.find_systems(pattern, full_match)?.into_iter().map(Item::System));
        }
        if nodes {
            hits.extend(
                self.find_nodes(pattern, full_match, None)?
                    .into_iter()
                    .map(|n| Item::Node(n.as_ref())),
            );
        }
        hits.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(hits)
    }

    /// Exactly one node or system fully matching `name`.
    pub fn get_one(&self, name: &str, nodes: bool, systems: bool) -> Result<Item<'_>, VerifyError> {
        let kind = match (nodes, systems) {
            (true, false) => "node",
            (false, true) => "system",
            _ => "item",
        };
        let mut hits = self.find(name, nodes, systems, true)?;
        match hits.len() {
            0 => Err(VerifyError::NotFound {
                kind,
                pattern: name.to_string(),
            }),
            1 => Ok(hits.remove(0)),
            _ => Err(VerifyError::Ambiguous {
                kind,
                pattern: name.to_string(),
                names: hits.iter().map(|h| h.name().to_string()).collect(),
            }),
        }
    }

    /// `(node, config)` pairs matching a config pattern.
    pub fn find_config(
        &self,
        pattern: &str,
        full_match: bool,
    ) -> Result<Vec<(&Arc<Node>, &Arc<Config>)>, VerifyError> {
        let matcher = ConfigMatch::new(pattern, full_match)?;
        let mut hits = Vec::new();
        for node in self.nodes.values() {
            if !matcher.matches_node(&node.name) {
                continue;
            }
            for config in self.configs_of(&node.name) {
                if matcher.matches_config(&config.name) {
                    hits.push((node, config));
                }
            }
        }
        Ok(hits)
    }

    /// Exactly one config fully matching `pattern`.
    pub fn get_config(&self, pattern: &str) -> Result<&Arc<Config>, VerifyError> {
        let mut hits = self.find_config(pattern, true)?;
        match hits.len() {
            0 => Err(VerifyError::NotFound {
                kind: "config",
                pattern: pattern.to_string(),
            }),
            1 => Ok(hits.remove(0).1),
            _ => Err(VerifyError::Ambiguous {
                kind: "config",
                pattern: pattern.to_string(),
                names: hits.iter().map(|(_, c)| c.full_name()).collect(),
            }),
        }
    }

    /// Property value from the node or its closest system ancestor.
    pub fn tree_property(&self, node: &Node, key: &str) -> Option<Value> {
        let lookup = |value: Value| value.get(key).filter(|v| !v.is_null()).cloned();

        if let Some(value) = serde_json::to_value(node).ok().and_then(lookup) {
            return Some(value);
        }

        let mut current = node.system.as_deref();
        while let Some(name) = current {
            if let Some(system) = self.systems.get(name)
                && let Some(value) = serde_json::to_value(system).ok().and_then(lookup)
            {
                return Some(value);
            }
            current = parent_path(name);
        }
        None
    }

    fn tree_bool(&self, node: &Node, key: &str, default: bool) -> bool {
        self.tree_property(node, key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Whether verify, audit and deploy apply to this node.
    pub fn verify_enabled(&self, node: &Node) -> bool {
        self.tree_bool(node, "verify", true) && !self.tree_bool(node, "template", false)
    }

    /// Default access method for a node.
    pub fn deploy_method(&self, node: &Node) -> String {
        self.tree_property(node, "deploy")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_ACCESS_METHOD.to_string())
    }

    /// Remote host for a node, cached per access method.
    pub fn get_remote(
        &self,
        node: &Node,
        method: Option<&str>,
    ) -> Result<Arc<dyn RemoteHost>, RemoteError> {
        let method = method.map_or_else(|| self.deploy_method(node), str::to_string);
        let key = (node.name.clone(), method);

        let mut remotes = self.remotes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(remote) = remotes.get(&key) {
            return Ok(Arc::clone(remote));
        }

        let connector = self.connector.as_ref().ok_or_else(|| RemoteError::Unsupported {
            node: node.name.clone(),
            method: key.1.clone(),
        })?;
        log::debug!("{}: opening remote via {}", node.name, key.1);
        let remote = connector.connect(node, &key.1)?;
        remotes.insert(key, Arc::clone(&remote));
        Ok(remote)
    }
}
