use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::config::EntryError;

/// Map a path under `source_root` to the same relative location under `target_root`.
///
/// `event_path == source_root` maps to `target_root` itself.
pub fn resolve_target_path(
    source_root: &Path,
    target_root: &Path,
    event_path: &Path,
) -> Result<PathBuf> {
    let rel = event_path.strip_prefix(source_root).with_context(|| {
        format!(
            "{} is not under {}",
            event_path.display(),
            source_root.display()
        )
    })?;

    if rel.as_os_str().is_empty() {
        return Ok(target_root.to_path_buf());
    }
    Ok(target_root.join(rel))
}

/// Compute the relative path from `base` to `full` as a forward-slash string.
/// This is the form ignore patterns are matched against.
pub fn relative_path(base: &Path, full: &Path) -> Result<String> {
    let rel = full
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", full.display(), base.display()))?;

    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|%([A-Za-z_][A-Za-z0-9_]*)%")
        .expect("placeholder regex is valid")
});

/// Expand `~`, `$VAR`, `${VAR}` and `%VAR%` in a configured path and make
/// the result absolute against the current directory.
pub fn expand_placeholders(raw: &str) -> std::result::Result<PathBuf, EntryError> {
    expand_with(raw, |name| std::env::var(name).ok(), dirs::home_dir())
}

fn expand_with(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> std::result::Result<PathBuf, EntryError> {
    let mut missing = None;
    let expanded = PLACEHOLDER.replace_all(raw, |caps: &Captures| {
        let name = caps
            .iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str())
            .unwrap_or_default();
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    if let Some(variable) = missing {
        return Err(EntryError::UndefinedVariable {
            path: raw.to_string(),
            variable,
        });
    }

    let path = match expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = home.ok_or_else(|| EntryError::UndefinedVariable {
                path: raw.to_string(),
                variable: "HOME".into(),
            })?;
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(expanded.as_ref()),
    };

    std::path::absolute(&path).map_err(|e| EntryError::Unresolvable {
        path: raw.to_string(),
        reason: e.to_string(),
    })
}
