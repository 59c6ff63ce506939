use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "appkeeper.toml";

/// Nearest `filename` in `start` or one of its ancestors.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Per-user config location, `~/.config/appkeeper/appkeeper.toml` on Linux.
pub fn user_config() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("appkeeper").join(CONFIG_FILE))
}

/// Resolve the config file path. An explicit `cli_file` must exist. Otherwise
/// the current directory and its parents are searched, then the per-user
/// location. `None` means no config file exists and defaults apply.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = cli_file {
        if path.is_file() {
            return Ok(Some(path.canonicalize()?));
        }
        anyhow::bail!("config file {} does not exist", path.display());
    }

    let cwd = std::env::current_dir()?;
    if let Some(found) = find_config(&cwd, CONFIG_FILE) {
        return Ok(Some(found));
    }
    Ok(user_config().filter(|p| p.is_file()))
}
