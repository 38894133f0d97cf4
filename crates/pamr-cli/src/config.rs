//! Configuration file loading.
//!
//! The file is TOML. A top-level `include = ["a.toml", ...]` lists files,
//! relative to the including one, that are merged first; values of the
//! including file win. Any error falls back to defaults with a warning.

use pamr_types::PamrConfig;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

const MAX_INCLUDE_DEPTH: u32 = 8;

/// `~/.pamr/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".pamr")
        .join("config.toml")
}

/// Load the configuration at `path` (or the default path).
pub fn load_config(path: Option<&Path>) -> PamrConfig {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);
    if !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        return PamrConfig::default();
    }

    let mut stack = HashSet::new();
    let merged = match read_layered(&path, &mut stack, 0) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Cannot load configuration, using defaults");
            return PamrConfig::default();
        }
    };
    match merged.try_into::<PamrConfig>() {
        Ok(config) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Invalid configuration, using defaults");
            PamrConfig::default()
        }
    }
}

/// Read `path` with its includes merged underneath it.
///
/// `stack` holds the files currently being read, so a file may be included
/// from several places but never from itself.
fn read_layered(
    path: &Path,
    stack: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("includes nested deeper than {MAX_INCLUDE_DEPTH}"));
    }
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| format!("{}: {e}", path.display()))?;
    if !stack.insert(canonical.clone()) {
        return Err(format!("{} includes itself", path.display()));
    }
    let layered = read_layer(path, &canonical, stack, depth);
    stack.remove(&canonical);
    layered
}

fn read_layer(
    path: &Path,
    canonical: &Path,
    stack: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<toml::Value, String> {
    let text = std::fs::read_to_string(canonical)
        .map_err(|e| format!("{}: {e}", path.display()))?;
    let mut value: toml::Value =
        toml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))?;

    let includes: Vec<String> = match &mut value {
        toml::Value::Table(table) => match table.remove("include") {
            Some(toml::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(_) => return Err(format!("{}: include must be a list", path.display())),
            None => Vec::new(),
        },
        _ => Vec::new(),
    };
    if includes.is_empty() {
        return Ok(value);
    }

    let dir = canonical.parent().unwrap_or_else(|| Path::new("."));
    let mut base = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let relative = Path::new(include);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("include {include} must stay below {}", dir.display()));
        }
        let layer = read_layered(&dir.join(relative), stack, depth + 1)?;
        deep_merge_toml(&mut base, &layer);
    }
    deep_merge_toml(&mut base, &value);
    Ok(base)
}

/// Merge `overlay` into `base`. Tables merge key by key; other values are
/// replaced.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
