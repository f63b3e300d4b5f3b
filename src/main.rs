mod cli;
mod commands;
mod repo;
mod ssh;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, ColorChoice, Command};
use commands::verify::{Mode, Request};
use std::io::{self, IsTerminal};

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub color: bool,
    /// Repository root as given on the command line.
    pub root: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stdout().is_terminal(),
    };
    colored::control::set_override(color);

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        color,
        root: cli.root,
    };

    match cli.command {
        Command::Show(args) => commands::verify::run(
            &ctx,
            &Request {
                target: args.target,
                mode: Mode::Show {
                    diff: args.diff,
                    raw: args.raw,
                    buckets: args.buckets,
                },
                path_prefix: None,
                method: None,
            },
        ),
        Command::Verify(target) => commands::verify::run(
            &ctx,
            &Request {
                target,
                mode: Mode::Verify,
                path_prefix: None,
                method: None,
            },
        ),
        Command::Audit(args) => commands::verify::run(
            &ctx,
            &Request {
                target: args.target,
                mode: Mode::Audit { diff: args.diff },
                path_prefix: args.path_prefix,
                method: args.method,
            },
        ),
        Command::Deploy(args) => commands::verify::run(
            &ctx,
            &Request {
                target: args.target,
                mode: Mode::Deploy,
                path_prefix: args.path_prefix,
                method: args.method,
            },
        ),
        Command::Control(args) => commands::control::run(&ctx, &args),
        Command::Controls { pattern } => commands::control::list(&ctx, &pattern),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "rigging", &mut io::stdout());
            Ok(())
        }
    }
}
