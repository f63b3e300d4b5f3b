use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rigging")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Render, audit and deploy node configuration files", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Repository root containing rigging.toml
    #[arg(short, long, global = true, default_value = ".", env = "RIGGING_ROOT")]
    pub root: String,

    /// When to use colored output
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand)]
pub enum Command {
    /// Render and show node config files
    Show(ShowArgs),

    /// Render all config files and check for errors
    Verify(NodeArgs),

    /// Compare rendered files against what is deployed
    Audit(AuditArgs),

    /// Write changed files to the nodes
    Deploy(DeployArgs),

    /// Run a control operation on matching configs
    Control(ControlArgs),

    /// List control operations and their capabilities
    Controls {
        /// Config pattern (node_regex/config_regex)
        #[arg(default_value = ".")]
        pattern: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Node Selection
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// Node name regex (default: all nodes)
    pub nodes: Option<String>,

    /// Require the regex to match the whole node name
    #[arg(short = 'M', long)]
    pub full_match: bool,

    /// Skip nodes matching this regex
    #[arg(short = 'x', long, value_name = "REGEX")]
    pub exclude: Option<String>,
}

// ============================================================================
// Verify Commands
// ============================================================================

#[derive(Args)]
pub struct ShowArgs {
    #[command(flatten)]
    pub target: NodeArgs,

    /// Show raw template vs. rendered output diff
    #[arg(short, long)]
    pub diff: bool,

    /// Show raw templates
    #[arg(long)]
    pub raw: bool,

    /// Show dynamic buckets instead of files
    #[arg(short = 'B', long)]
    pub buckets: bool,
}

#[derive(Args)]
pub struct AuditArgs {
    #[command(flatten)]
    pub target: NodeArgs,

    /// Show differences between deployed and rendered files
    #[arg(short, long)]
    pub diff: bool,

    /// Prefix added to every destination path
    #[arg(long, value_name = "DIR")]
    pub path_prefix: Option<String>,

    /// Access method override (local, ssh)
    #[arg(short, long)]
    pub method: Option<String>,
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub target: NodeArgs,

    /// Prefix added to every destination path
    #[arg(long, value_name = "DIR")]
    pub path_prefix: Option<String>,

    /// Access method override (local, ssh)
    #[arg(short, long)]
    pub method: Option<String>,
}

// ============================================================================
// Control Commands
// ============================================================================

#[derive(Args)]
pub struct ControlArgs {
    /// Config pattern (node_regex/config_regex)
    pub pattern: String,

    /// Operation name
    pub operation: String,

    /// Extra arguments passed to the operation
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,

    /// Access method override (local, ssh)
    #[arg(short, long)]
    pub method: Option<String>,

    /// Write command output to one log file per node in this directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_show_flags() {
        let cli = Cli::parse_from(["rigging", "-vv", "show", "web/.", "--diff", "-M"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Show(args) => {
                assert!(args.diff);
                assert!(args.target.full_match);
                assert_eq!(args.target.nodes.as_deref(), Some("web/."));
            }
            _ => panic!("expected show"),
        }
    }

    #[test]
    fn test_parse_control_args() {
        let cli = Cli::parse_from([
            "rigging", "control", "web//nginx", "reload", "--method", "local", "now",
        ]);
        match cli.command {
            Command::Control(args) => {
                assert_eq!(args.pattern, "web//nginx");
                assert_eq!(args.operation, "reload");
                assert_eq!(args.method.as_deref(), Some("local"));
                assert_eq!(args.args, ["now"]);
            }
            _ => panic!("expected control"),
        }
    }
}
