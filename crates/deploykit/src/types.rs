//! Core data model: systems, nodes and configs

use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// A named grouping of nodes.
///
/// System names are slash-separated paths; `web/eu` is a child of `web`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct System {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl System {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Name of the enclosing system, if any.
    pub fn parent_name(&self) -> Option<&str> {
        parent_path(&self.name)
    }
}

/// A managed remote host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Node {
    /// Full node path, e.g. `web/frontend1`.
    pub name: String,
    /// Enclosing system path, derived from the node name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    /// Default access method (`local`, `ssh`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<bool>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let system = parent_path(&name).map(str::to_string);
        Self {
            name,
            system,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn with_deploy(mut self, method: impl Into<String>) -> Self {
        self.deploy = Some(method.into());
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Last path component of the node name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// A named configuration unit bound to one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub name: String,
    /// Name of the owning node.
    pub node: String,
    /// Directory holding this config's template sources.
    pub path: PathBuf,
    /// Pattern of the config this one inherits entries from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub settings: Value,
}

impl Config {
    pub fn new(node: impl Into<String>, name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            path: path.as_ref().to_path_buf(),
            parent: None,
            settings: Value::Object(Map::new()),
        }
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// `node/config`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.node, self.name)
    }
}

/// Parent component of a slash-separated path.
pub(crate) fn parent_path(name: &str) -> Option<&str> {
    name.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}
