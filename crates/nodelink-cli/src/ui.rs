//! Terminal output for the subcommands, using `colored`.

use colored::Colorize;

/// Width of the label column in [`kv`] lines.
const LABEL_WIDTH: usize = 12;

pub fn section(title: &str) {
    println!("{} {}", "::".bright_cyan().bold(), title.bold());
}

/// "  Label:      value"
pub fn kv(label: &str, value: &str) {
    println!("  {:<width$} {value}", format!("{label}:"), width = LABEL_WIDTH);
}

/// Like [`kv`], with the value highlighted.
pub fn kv_ok(label: &str, value: &str) {
    println!(
        "  {:<width$} {}",
        format!("{label}:"),
        value.bright_green(),
        width = LABEL_WIDTH
    );
}

pub fn success(msg: &str) {
    println!("{} {msg}", "ok".bright_green().bold());
}

/// Errors go to stderr so `--json` output stays parseable.
pub fn error(msg: &str) {
    eprintln!("{} {}", "error:".bright_red().bold(), msg);
}

pub fn hint(msg: &str) {
    println!("  {}", msg.dimmed());
}

pub fn blank() {
    println!();
}
