//! show, verify, audit and deploy
//!
//! All four run the same pass over every collected entry; they differ only in
//! the options handed to the manager and in what is printed afterwards.

use anyhow::Result;
use colored::Colorize;
use deploykit::{EntryStatus, FileEntry, Reporter, VerifyOptions, VerifyStats};

use super::Session;
use crate::Context;
use crate::cli::NodeArgs;
use crate::ui::{self, TerminalReporter};

/// What a pass does besides rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Show { diff: bool, raw: bool, buckets: bool },
    Verify,
    Audit { diff: bool },
    Deploy,
}

/// One verify pass request.
#[derive(Debug, Clone)]
pub struct Request {
    pub target: NodeArgs,
    pub mode: Mode,
    pub path_prefix: Option<String>,
    pub method: Option<String>,
}

impl Request {
    fn options(&self, ctx: &Context) -> VerifyOptions {
        let mut opts = VerifyOptions {
            verbose: ctx.verbose > 0,
            path_prefix: self.path_prefix.clone(),
            access_method: self.method.clone(),
            ..Default::default()
        };
        match self.mode {
            Mode::Show { diff, raw, buckets } => {
                opts.show = !buckets;
                opts.show_diff = diff;
                opts.raw = raw;
            }
            Mode::Verify => {}
            Mode::Audit { diff } => {
                opts.audit = true;
                opts.show_diff = diff;
            }
            Mode::Deploy => opts.deploy = true,
        }
        opts
    }
}

pub fn run(ctx: &Context, request: &Request) -> Result<()> {
    let mut session = Session::open(ctx)?;
    let mut reporter = TerminalReporter::new(ctx.quiet);
    let stats = execute(ctx, &mut session, request, &mut reporter)?;
    reporter.finish();

    if let Mode::Show { buckets: true, .. } = request.mode {
        print_buckets(&session);
    }

    let stats = stats.into_result()?;
    if !ctx.quiet {
        summarize(request.mode, &stats);
    }
    Ok(())
}

/// Run the pass and return its stats without raising the aggregate error.
pub fn execute(
    ctx: &Context,
    session: &mut Session,
    request: &Request,
    reporter: &mut dyn Reporter,
) -> Result<VerifyStats> {
    let opts = request.options(ctx);
    let selected = session.select_nodes(&request.target)?;

    let stats = match &selected {
        Some(names) => {
            let filter = |entry: &FileEntry| names.contains(&entry.node.name);
            session.manager.run(&opts, Some(&filter), reporter)
        }
        None => session.manager.run(&opts, None, reporter),
    };
    Ok(stats)
}

fn print_buckets(session: &Session) {
    for (name, records) in session.manager.buckets().iter() {
        for (i, record) in records.iter().enumerate() {
            println!("{} #{i}: {record}", name.cyan());
        }
    }
}

/// One line per directory entry of a pass.
fn dir_lines(stats: &VerifyStats) -> Vec<String> {
    stats
        .outcomes
        .iter()
        .filter_map(|outcome| {
            let dest = outcome.dest.as_deref().unwrap_or_default();
            match outcome.status {
                EntryStatus::Synced(copied) => Some(format!("{dest}: {copied} files copied")),
                EntryStatus::DirChecked {
                    file_count,
                    total_bytes,
                } => Some(format!(
                    "{dest}: {file_count} files, {}",
                    ui::format_size(total_bytes)
                )),
                _ => None,
            }
        })
        .collect()
}

fn summarize(mode: Mode, stats: &VerifyStats) {
    match mode {
        Mode::Show { .. } => {}
        Mode::Verify => {
            if stats.file_count == 0 {
                log::warn!("no files to verify");
            } else {
                ui::success(&format!("all [{}] files ok", stats.file_count));
            }
        }
        Mode::Audit { .. } => {
            ui::success(&format!("audited [{}] files, no differences", stats.file_count));
        }
        Mode::Deploy => {
            ui::success(&format!(
                "deployed: {} written, {} unchanged, {} copied",
                stats.written, stats.unchanged, stats.copied
            ));
        }
    }
    if matches!(mode, Mode::Verify | Mode::Deploy) {
        for line in dir_lines(stats) {
            ui::dim(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::fixture;
    use deploykit::{EntryKind, EntryOutcome, NoReport};

    fn ctx() -> Context {
        Context {
            verbose: 0,
            quiet: true,
            color: false,
            root: ".".into(),
        }
    }

    fn request(mode: Mode, nodes: Option<&str>) -> Request {
        Request {
            target: NodeArgs {
                nodes: nodes.map(str::to_string),
                ..Default::default()
            },
            mode,
            path_prefix: Some("/out".into()),
            method: None,
        }
    }

    #[test]
    fn test_verify_renders_everything() {
        let mut f = fixture();
        let stats = execute(&ctx(), &mut f.session, &request(Mode::Verify, None), &mut NoReport).unwrap();
        assert_eq!(stats.error_count, 0);
        // site x2, inherited nginx x2, pg report; template node skipped
        assert_eq!(stats.file_count, 5);
        assert!(f.host.journal().is_empty());
    }

    #[test]
    fn test_deploy_writes_per_node_files() {
        let mut f = fixture();
        let stats = execute(&ctx(), &mut f.session, &request(Mode::Deploy, None), &mut NoReport).unwrap();
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.written, 3);

        assert_eq!(
            f.host.contents("/out/web/a/etc/nginx/nginx.conf").unwrap(),
            b"listen 80;\n"
        );
        assert_eq!(
            f.host.contents("/out/web/b/etc/nginx/nginx.conf").unwrap(),
            b"listen 8080;\n"
        );
        assert_eq!(
            f.host.contents("/out/db/main/etc/pg/allowed").unwrap(),
            b"server 10.0.0.1:80\nserver 10.0.0.2:8080\n"
        );
    }

    #[test]
    fn test_deploy_is_idempotent() {
        let mut f = fixture();
        let req = request(Mode::Deploy, None);
        execute(&ctx(), &mut f.session, &req, &mut NoReport).unwrap();
        let writes = f.host.writes();

        // bucket records are appended on every pass
        f.session.manager.get_bucket("upstreams").clear();
        let stats = execute(&ctx(), &mut f.session, &req, &mut NoReport).unwrap();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.unchanged, 3);
        assert_eq!(f.host.writes(), writes);
    }

    #[test]
    fn test_node_filter_limits_deploy() {
        let mut f = fixture();
        let stats = execute(
            &ctx(),
            &mut f.session,
            &request(Mode::Deploy, Some("web/a")),
            &mut NoReport,
        )
        .unwrap();
        assert_eq!(stats.written, 1);
        assert!(f.host.contents("/out/web/a/etc/nginx/nginx.conf").is_some());
        assert!(f.host.contents("/out/web/b/etc/nginx/nginx.conf").is_none());
    }

    #[test]
    fn test_audit_reports_missing_files() {
        let mut f = fixture();
        let stats = execute(
            &ctx(),
            &mut f.session,
            &request(Mode::Audit { diff: false }, Some("web/b")),
            &mut NoReport,
        )
        .unwrap();
        assert_eq!(stats.error_count, 1);
        assert!(stats.into_result().is_err());
    }

    #[test]
    fn test_bad_node_pattern_rejected() {
        let mut f = fixture();
        let result = execute(
            &ctx(),
            &mut f.session,
            &request(Mode::Verify, Some("web/(")),
            &mut NoReport,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dir_lines_report_synced_and_checked() {
        let outcome = |dest: &str, status| EntryOutcome {
            node: "web/a".into(),
            config: "site".into(),
            kind: EntryKind::Dir,
            dest: Some(dest.into()),
            status,
        };
        let stats = VerifyStats {
            outcomes: vec![
                outcome("/srv/static", EntryStatus::Synced(3)),
                outcome(
                    "/srv/assets",
                    EntryStatus::DirChecked {
                        file_count: 2,
                        total_bytes: 2048,
                    },
                ),
                outcome("/srv/other", EntryStatus::Filtered),
            ],
            ..Default::default()
        };
        assert_eq!(
            dir_lines(&stats),
            ["/srv/static: 3 files copied", "/srv/assets: 2 files, 2.0 KB"]
        );
    }

    #[test]
    fn test_show_options() {
        let req = request(
            Mode::Show {
                diff: true,
                raw: false,
                buckets: true,
            },
            None,
        );
        let opts = req.options(&ctx());
        assert!(!opts.show);
        assert!(opts.show_diff);
        assert!(!opts.deploy && !opts.audit);
    }
}
