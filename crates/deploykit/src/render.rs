//! Renderers and the template context
//!
//! A [`Renderer`] turns a file entry's source (a template file or inline
//! text) and destination path spec into the final destination path and
//! file body. Three renderers ship with the crate:
//!
//! - [`TemplateRenderer`]: minijinja templates for paths and bodies
//! - [`VerbatimRenderer`]: templated destination path, body copied as-is
//! - [`MarkupRenderer`]: body rendered with HTML/XML auto-escaping
//!
//! Every render sees the same fixed set of bindings, built by
//! [`RenderContext`]: `node`, `system`, `s`, `settings`, `config`, `plugin`
//! and the helper functions `find`, `find_config`, `get_node`, `get_system`,
//! `get_config`, `bucket`, `edge` and `record`.

use crate::bucket::{BucketStore, Record};
use crate::error::VerifyError;
use crate::inventory::Inventory;
use crate::types::{Config, Node};
use minijinja::value::{Kwargs, Value};
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Records published from templates, applied after the render returns.
type Outbox = Arc<Mutex<Vec<(String, Record)>>>;

/// Inputs of a single render call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderRequest<'a> {
    pub source_path: Option<&'a Path>,
    /// Destination path spec; may itself contain template expressions.
    pub dest_path: Option<&'a str>,
    /// Inline body that replaces the source file contents.
    pub source_text: Option<&'a str>,
}

/// Output of a render call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    pub dest_path: Option<String>,
    /// File body; not necessarily UTF-8 for verbatim sources.
    pub body: Option<Vec<u8>>,
}

/// Pluggable rendering backend bound to a file entry.
pub trait Renderer: Send + Sync + fmt::Debug {
    /// Short backend name, shown in listings.
    fn name(&self) -> &'static str;

    /// Render a request against the given context.
    fn render(&self, request: &RenderRequest<'_>, ctx: &RenderContext<'_>) -> Result<Rendered, VerifyError>;
}

/// The bindings visible to one render call.
pub struct RenderContext<'a> {
    pub inventory: &'a Arc<Inventory>,
    pub node: &'a Node,
    pub config: &'a Config,
    /// Config providing settings and override lookup.
    pub top_config: &'a Config,
    pub buckets: &'a BucketStore,
    outbox: Outbox,
}

#[derive(Serialize)]
struct PluginInfo<'a> {
    node: &'a str,
    config: &'a str,
    top_config: &'a str,
}

#[derive(Serialize)]
struct ConfigHit<'a> {
    node: &'a Node,
    config: &'a Config,
}

fn template_error(error: impl fmt::Display) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, error.to_string())
}

fn json_value(value: &Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn kwargs_into(mut record: Record, kwargs: &Kwargs) -> Result<Record, minijinja::Error> {
    let keys: Vec<String> = kwargs.args().map(str::to_string).collect();
    for key in keys {
        let value: Value = kwargs.get(&key)?;
        record.values.insert(key, json_value(&value));
    }
    kwargs.assert_all_used()?;
    Ok(record)
}

impl<'a> RenderContext<'a> {
    pub fn new(
        inventory: &'a Arc<Inventory>,
        node: &'a Node,
        config: &'a Config,
        top_config: &'a Config,
        buckets: &'a BucketStore,
    ) -> Self {
        Self {
            inventory,
            node,
            config,
            top_config,
            buckets,
            outbox: Arc::default(),
        }
    }

    /// Drain the records published by templates during renders.
    pub fn take_published(&self) -> Vec<(String, Record)> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn globals(&self) -> BTreeMap<&'static str, Value> {
        let system = self
            .node
            .system
            .as_deref()
            .and_then(|name| self.inventory.system(name));
        let settings = Value::from_serialize(&self.top_config.settings);

        let mut names = BTreeMap::new();
        names.insert("node", Value::from_serialize(self.node));
        names.insert("system", Value::from_serialize(system));
        names.insert("s", settings.clone());
        names.insert("settings", settings);
        names.insert("config", Value::from_serialize(self.top_config));
        names.insert(
            "plugin",
            Value::from_serialize(PluginInfo {
                node: &self.node.name,
                config: &self.config.name,
                top_config: &self.top_config.name,
            }),
        );
        names
    }

    /// Build a sandboxed environment carrying the lookup and publish helpers.
    fn environment(&self, auto_escape: bool) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        if auto_escape {
            env.set_auto_escape_callback(|_| AutoEscape::Html);
        }

        let inv = Arc::clone(self.inventory);
        env.add_function(
            "find",
            move |pattern: String, full_match: Option<bool>| -> Result<Value, minijinja::Error> {
                let hits = inv
                    .find(&pattern, true, false, full_match.unwrap_or(false))
                    .map_err(template_error)?;
                Ok(Value::from_serialize(&hits))
            },
        );

        let inv = Arc::clone(self.inventory);
        env.add_function(
            "find_config",
            move |pattern: String, full_match: Option<bool>| -> Result<Value, minijinja::Error> {
                let hits: Vec<_> = inv
                    .find_config(&pattern, full_match.unwrap_or(false))
                    .map_err(template_error)?
                    .into_iter()
                    .map(|(node, config)| ConfigHit {
                        node: node.as_ref(),
                        config: config.as_ref(),
                    })
                    .collect();
                Ok(Value::from_serialize(&hits))
            },
        );

        let inv = Arc::clone(self.inventory);
        env.add_function("get_node", move |name: String| -> Result<Value, minijinja::Error> {
            let item = inv.get_one(&name, true, false).map_err(template_error)?;
            Ok(Value::from_serialize(item))
        });

        let inv = Arc::clone(self.inventory);
        env.add_function("get_system", move |name: String| -> Result<Value, minijinja::Error> {
            let item = inv.get_one(&name, false, true).map_err(template_error)?;
            Ok(Value::from_serialize(item))
        });

        let inv = Arc::clone(self.inventory);
        env.add_function("get_config", move |pattern: String| -> Result<Value, minijinja::Error> {
            let config = inv.get_config(&pattern).map_err(template_error)?;
            Ok(Value::from_serialize(config.as_ref()))
        });

        let snapshot: Arc<BTreeMap<String, Value>> = Arc::new(
            self.buckets
                .iter()
                .map(|(name, records)| (name.to_string(), Value::from_serialize(records)))
                .collect(),
        );
        env.add_function("bucket", move |name: String| -> Value {
            snapshot
                .get(&name)
                .cloned()
                .unwrap_or_else(|| Value::from(Vec::<Value>::new()))
        });

        let outbox = Arc::clone(&self.outbox);
        let (source_node, source_config) = (self.node.name.clone(), self.top_config.name.clone());
        env.add_function(
            "record",
            move |bucket: String, kwargs: Kwargs| -> Result<Value, minijinja::Error> {
                let record = kwargs_into(Record::new(&source_node, &source_config), &kwargs)?;
                outbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((bucket, record));
                Ok(Value::from(""))
            },
        );

        let outbox = Arc::clone(&self.outbox);
        let (source_node, source_config) = (self.node.name.clone(), self.top_config.name.clone());
        env.add_function(
            "edge",
            move |bucket: String,
                  dest_node: String,
                  dest_config: String,
                  kwargs: Kwargs|
                  -> Result<Value, minijinja::Error> {
                let record = Record::new(&source_node, &source_config).with_dest(dest_node, dest_config);
                let record = kwargs_into(record, &kwargs)?;
                outbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((bucket, record));
                Ok(Value::from(""))
            },
        );

        env
    }

    fn render_with(&self, text: &str, origin: &str, auto_escape: bool) -> Result<String, VerifyError> {
        self.environment(auto_escape)
            .render_str(text, self.globals())
            .map_err(|e| VerifyError::Render {
                source_path: origin.to_string(),
                message: e.to_string(),
            })
    }
}

/// Render a template string against the context.
pub fn render_template(text: &str, ctx: &RenderContext<'_>) -> Result<String, VerifyError> {
    ctx.render_with(text, "<inline>", false)
}

/// Read a source file as-is.
pub(crate) fn read_source(path: &Path) -> Result<Vec<u8>, VerifyError> {
    fs::read(path).map_err(|source| VerifyError::Source {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a template source; templates must be UTF-8.
fn read_template(path: &Path) -> Result<String, VerifyError> {
    String::from_utf8(read_source(path)?).map_err(|e| VerifyError::Render {
        source_path: path.display().to_string(),
        message: format!("template is not valid UTF-8: {e}"),
    })
}

fn render_dest(dest: Option<&str>, ctx: &RenderContext<'_>) -> Result<Option<String>, VerifyError> {
    match dest {
        Some(dest) if !dest.is_empty() => render_template(dest, ctx).map(Some),
        other => Ok(other.map(str::to_string)),
    }
}

/// minijinja text templates for source path, body and destination path.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl Renderer for TemplateRenderer {
    fn name(&self) -> &'static str {
        "template"
    }

    fn render(&self, request: &RenderRequest<'_>, ctx: &RenderContext<'_>) -> Result<Rendered, VerifyError> {
        let source_path = request
            .source_path
            .map(|p| render_template(&p.to_string_lossy(), ctx).map(PathBuf::from))
            .transpose()?;

        let text = match (request.source_text, source_path.as_deref()) {
            (Some(text), _) if !text.is_empty() => Some(ctx.render_with(text, "<inline>", false)?),
            (_, Some(path)) => {
                let body = read_template(path)?;
                Some(ctx.render_with(&body, &path.display().to_string(), false)?)
            }
            _ => None,
        };

        Ok(Rendered {
            dest_path: render_dest(request.dest_path, ctx)?,
            body: text.map(String::into_bytes),
        })
    }
}

/// Copies the body untouched; only the destination path is templated.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbatimRenderer;

impl Renderer for VerbatimRenderer {
    fn name(&self) -> &'static str {
        "verbatim"
    }

    fn render(&self, request: &RenderRequest<'_>, ctx: &RenderContext<'_>) -> Result<Rendered, VerifyError> {
        let body = match (request.source_text, request.source_path) {
            (Some(text), _) => Some(text.as_bytes().to_vec()),
            (None, Some(path)) => Some(read_source(path)?),
            (None, None) => None,
        };
        Ok(Rendered {
            dest_path: render_dest(request.dest_path, ctx)?,
            body,
        })
    }
}

/// Markup documents rendered with auto-escaping of substituted values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupRenderer;

impl Renderer for MarkupRenderer {
    fn name(&self) -> &'static str {
        "markup"
    }

    fn render(&self, request: &RenderRequest<'_>, ctx: &RenderContext<'_>) -> Result<Rendered, VerifyError> {
        let origin = request
            .source_path
            .map_or_else(|| "<inline>".to_string(), |p| p.display().to_string());

        if request.source_text.is_some_and(|t| !t.is_empty()) {
            return Err(VerifyError::Render {
                source_path: origin,
                message: "markup rendering from inline text is not supported".into(),
            });
        }

        let dest_path = render_dest(request.dest_path, ctx)?;
        let body = request
            .source_path
            .map(|path| {
                let body = read_template(path)?;
                ctx.render_with(&body, &origin, true).map(String::into_bytes)
            })
            .transpose()?;

        Ok(Rendered { dest_path, body })
    }
}

/// Look up a renderer by name.
pub fn renderer_by_name(name: &str) -> Option<Arc<dyn Renderer>> {
    match name {
        "template" => Some(Arc::new(TemplateRenderer)),
        "verbatim" => Some(Arc::new(VerbatimRenderer)),
        "markup" => Some(Arc::new(MarkupRenderer)),
        _ => None,
    }
}
