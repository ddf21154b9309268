//! `nodelink config` and `nodelink completion`.

use crate::cli::Cli;
use anyhow::Context;
use clap::CommandFactory;
use nodelink_types::config::{default_config_path, load_config, NodeLinkConfig};
use std::path::PathBuf;

pub fn cmd_config_show(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config.as_deref());
    print!("{}", render_config(&config)?);
    Ok(())
}

pub fn cmd_config_path(config: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config.unwrap_or_else(default_config_path);
    println!("{}", path.display());
    if !path.exists() {
        crate::ui::hint("the file does not exist yet; built-in defaults apply");
    }
    Ok(())
}

pub fn cmd_completion(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "nodelink", &mut std::io::stdout());
}

fn render_config(config: &NodeLinkConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration as TOML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rendered_config_parses_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\ndisplay_name = \"edge-1\"\n\n[uplink]\nidle_timeout_ms = 5000").unwrap();

        let config = load_config(Some(file.path()));
        let rendered = render_config(&config).unwrap();
        let parsed = NodeLinkConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.node.display_name, "edge-1");
        assert_eq!(parsed.uplink.idle_timeout_ms, 5000);
    }
}
