//! control and controls
//!
//! Operations run directly, one matching config at a time, in the order the
//! configs were collected. No cross-node dependency ordering is applied.

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use deploykit::{ConfigMatch, ControlInvocation, ControlOperation, Node, Plugin};
use std::fs;

use super::Session;
use crate::Context;
use crate::cli::ControlArgs;
use crate::ui;

fn is_template(session: &Session, node: &Node) -> bool {
    session
        .inventory
        .tree_property(node, "template")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Plugins whose node and top config match a config pattern, templates skipped.
fn matching_plugins<'a>(session: &'a Session, pattern: &str) -> Result<Vec<&'a Plugin>> {
    let matcher = ConfigMatch::new(pattern, false)?;
    Ok(session
        .plugins
        .iter()
        .filter(|p| matcher.matches(&p.node, &p.top_config))
        .filter(|p| !is_template(session, &p.node))
        .collect())
}

pub fn run(ctx: &Context, args: &ControlArgs) -> Result<()> {
    let mut session = Session::open(ctx)?;
    let ran = invoke(ctx, &mut session, args)?;
    if !ctx.quiet {
        ui::success(&format!("{}: ran on [{ran}] configs", args.operation));
    }
    Ok(())
}

/// Run an operation on every matching config and return how many ran.
pub fn invoke(ctx: &Context, session: &mut Session, args: &ControlArgs) -> Result<usize> {
    if let Some(dir) = &args.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Could not create {}", dir.display()))?;
    }

    let plugins: Vec<usize> = {
        let matched = matching_plugins(session, &args.pattern)?;
        session
            .plugins
            .iter()
            .enumerate()
            .filter(|(_, p)| matched.iter().any(|m| std::ptr::eq(*m, *p)))
            .filter(|(_, p)| p.controls().iter().any(|c| c.name == args.operation))
            .map(|(i, _)| i)
            .collect()
    };
    if plugins.is_empty() {
        bail!(
            "no {:?} operation found in configs matching {:?}",
            args.operation,
            args.pattern
        );
    }

    let Session {
        manager,
        plugins: all,
        ..
    } = session;

    let mut failed = 0;
    for &index in &plugins {
        let plugin = &all[index];
        let invocation = ControlInvocation {
            method: args.method.clone(),
            verbose: ctx.verbose > 0,
            quiet: ctx.quiet,
            color: ctx.color,
            output_dir: args.output_dir.clone(),
            args: args.args.clone(),
            ..ControlInvocation::new(plugin.node.clone())
        };

        log::info!(
            "{:>8} {}: {}",
            "CONTROL",
            plugin.node.name,
            plugin.top_config.name
        );
        if let Err(e) = plugin.invoke(&args.operation, manager, &invocation) {
            ui::error(&format!(
                "{} {}: {e}",
                plugin.node.name.bold(),
                plugin.config.name
            ));
            failed += 1;
        }
    }

    if failed > 0 {
        bail!(
            "{}: there were [{failed}/{}] failures",
            args.operation,
            plugins.len()
        );
    }
    Ok(plugins.len())
}

/// Control operations of every matching config.
pub fn operations(session: &Session, pattern: &str) -> Result<Vec<ControlOperation>> {
    Ok(matching_plugins(session, pattern)?
        .into_iter()
        .flat_map(|p| p.iter_control_operations(&p.node, &p.top_config))
        .collect())
}

pub fn list(ctx: &Context, pattern: &str) -> Result<()> {
    let session = Session::open(ctx)?;
    let ops = operations(&session, pattern)?;
    if ops.is_empty() {
        ui::warn("no control operations found");
        return Ok(());
    }

    ui::header("Control Operations");
    for op in &ops {
        println!(
            "  {} {}",
            format!("{}/{}", op.node, op.config).cyan(),
            op.name.bold()
        );
        let caps = &op.capabilities;
        for (key, values) in [
            ("provides", &caps.provides),
            ("requires", &caps.requires),
            ("optional", &caps.optional_requires),
        ] {
            if !values.is_empty() {
                ui::kv(key, &values.join(", "));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::fixture;
    use std::path::PathBuf;

    fn ctx() -> Context {
        Context {
            verbose: 0,
            quiet: true,
            color: false,
            root: ".".into(),
        }
    }

    fn args(pattern: &str, operation: &str) -> ControlArgs {
        ControlArgs {
            pattern: pattern.into(),
            operation: operation.into(),
            args: Vec::new(),
            method: None,
            output_dir: None,
        }
    }

    #[test]
    fn test_inherited_control_runs_per_node() {
        let mut f = fixture();
        let ran = invoke(&ctx(), &mut f.session, &args("web/", "reload")).unwrap();
        assert_eq!(ran, 2);
        assert_eq!(f.host.executed(), ["nginx -s reload", "nginx -s reload"]);
    }

    #[test]
    fn test_trailing_args_reach_the_script() {
        let mut f = fixture();
        let mut request = args("web/a/site", "reload");
        request.args = vec!["now".into()];
        invoke(&ctx(), &mut f.session, &request).unwrap();
        assert_eq!(f.host.executed(), ["nginx -s reload 'now'"]);
    }

    #[test]
    fn test_template_nodes_skipped() {
        let mut f = fixture();
        let err = invoke(&ctx(), &mut f.session, &args("tmpl/", "reload")).unwrap_err();
        assert!(err.to_string().contains("no \"reload\" operation"));
        assert!(f.host.executed().is_empty());
    }

    #[test]
    fn test_failures_are_counted() {
        let mut f = fixture();
        f.host.set_script("systemctl restart postgresql", 1, &[]);
        let err = invoke(&ctx(), &mut f.session, &args("db/", "restart")).unwrap_err();
        assert_eq!(err.to_string(), "restart: there were [1/1] failures");
    }

    #[test]
    fn test_output_dir_created() {
        let mut f = fixture();
        let out = f.root.path().join("logs");
        let mut request = args("web/a/site", "reload");
        request.output_dir = Some(PathBuf::from(&out));
        invoke(&ctx(), &mut f.session, &request).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn test_operations_listing() {
        let f = fixture();
        let ops = operations(&f.session, ".").unwrap();
        let names: Vec<String> = ops.iter().map(|o| format!("{}/{}:{}", o.node, o.config, o.name)).collect();
        assert_eq!(names, ["db/main/pg:restart", "web/a/site:reload", "web/b/site:reload"]);
        assert_eq!(ops[0].capabilities.requires, ["http"]);
    }
}
