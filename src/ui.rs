use colored::Colorize;
use deploykit::{Location, Reporter};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Size Formatting
// ============================================================================

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ============================================================================
// Diff Output
// ============================================================================

/// Color one unified diff line by its leading marker.
pub fn diff_line(line: &str) -> String {
    match line.chars().next() {
        Some('+') => line.green().to_string(),
        Some('-') => line.red().to_string(),
        Some('@') => line.white().bold().to_string(),
        _ => line.to_string(),
    }
}

fn print_diff(diff: &str) {
    for line in diff.lines() {
        println!("{}", diff_line(line));
    }
}

/// Banner line framing a shown entry.
fn frame(edge: &str, node: &str, location: &Location<'_>) -> String {
    format!(
        "{} {}{}{} {}",
        edge.bold(),
        node.cyan(),
        ": path=".bold(),
        location.to_string().yellow(),
        "---".bold()
    )
}

// ============================================================================
// Terminal Reporter
// ============================================================================

/// Prints shown entries and drift diffs; draws a bar while copying files.
pub struct TerminalReporter {
    quiet: bool,
    copy: Option<(PathBuf, ProgressBar)>,
}

impl TerminalReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet, copy: None }
    }

    fn copy_bar(total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar
    }

    /// Clear any bar left from the last copy.
    pub fn finish(&mut self) {
        if let Some((_, bar)) = self.copy.take() {
            bar.finish_and_clear();
        }
    }
}

impl Reporter for TerminalReporter {
    fn on_show(&mut self, node: &str, location: &Location<'_>, body: &str, is_diff: bool) {
        println!("{}", frame("--- BEGIN", node, location));
        if is_diff {
            print_diff(body);
        } else {
            println!("{body}");
        }
        println!("{}", frame("--- END", node, location));
        println!();
    }

    fn on_drift(&mut self, _node: &str, _dest: &str, diff: &str) {
        print_diff(diff);
    }

    fn on_copy_progress(&mut self, dest: &Path, copied: u64, total: u64) {
        if self.quiet {
            return;
        }
        let same_file = self.copy.as_ref().is_some_and(|(path, _)| path == dest);
        if !same_file {
            self.finish();
            let bar = Self::copy_bar(total);
            bar.set_message(dest.display().to_string());
            self.copy = Some((dest.to_path_buf(), bar));
        }
        if let Some((_, bar)) = &self.copy {
            bar.set_position(copied);
            if copied >= total {
                bar.finish_and_clear();
            }
        }
    }
}

impl Drop for TerminalReporter {
    fn drop(&mut self) {
        self.finish();
    }
}
