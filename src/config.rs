use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::util::ignore::IgnoreSpec;
use crate::util::path::expand_placeholders;

pub const DEFAULT_CONFIG_FILE: &str = "sync-config.toml";

/// Raw on-disk configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    /// Source root -> target root, both before placeholder expansion.
    pub sync_paths: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ignored: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_report_debounce_ms")]
    pub report_debounce_ms: u64,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            report_debounce_ms: default_report_debounce_ms(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

fn default_report_debounce_ms() -> u64 {
    250
}
fn default_watch_debounce_ms() -> u64 {
    100
}

/// A mapping entry that was dropped while resolving the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("path '{path}' has no target path")]
    MissingTarget { path: String },
    #[error("path '{path}' references undefined variable '{variable}'")]
    UndefinedVariable { path: String, variable: String },
    #[error("path '{path}' cannot be resolved: {reason}")]
    Unresolvable { path: String, reason: String },
    #[error("path '{path}' resolves to source root {} which is already mapped", .root.display())]
    DuplicateSource { path: String, root: PathBuf },
}

/// One resolved source -> target pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRoot {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Fully resolved configuration. Replaced wholesale on reload.
///
/// Source roots must not be nested inside one another; a file under two
/// roots would be mirrored twice. This is checked only with a warning.
#[derive(Debug, Clone)]
pub struct SyncConfiguration {
    pub roots: Vec<MirrorRoot>,
    pub ignore: IgnoreSpec,
    pub report_window: Duration,
    pub watch_debounce: Duration,
}

impl SyncConfiguration {
    pub fn root_for(&self, source: &Path) -> Option<&MirrorRoot> {
        self.roots.iter().find(|r| r.source == source)
    }
}

/// Result of a successful load: the usable configuration plus the entries
/// that had to be skipped.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: SyncConfiguration,
    pub skipped: Vec<EntryError>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let content = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read config file: {}\n\
             See config/treemirror.example.toml for an example.",
            path.display()
        )
    })?;
    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<LoadedConfig> {
    let raw: Config = toml::from_str(content).context("Failed to parse config")?;

    let Some(sync_paths) = raw.sync_paths.as_ref() else {
        anyhow::bail!("no sync_paths found in config");
    };

    let (roots, skipped) = resolve_mapping(sync_paths, expand_placeholders);
    if roots.is_empty() {
        anyhow::bail!("no usable mapping found in config");
    }
    warn_nested_roots(&roots);

    let ignore = IgnoreSpec::compile(&raw.ignored)?;

    Ok(LoadedConfig {
        config: SyncConfiguration {
            roots,
            ignore,
            report_window: Duration::from_millis(raw.general.report_debounce_ms),
            watch_debounce: Duration::from_millis(raw.general.watch_debounce_ms),
        },
        skipped,
    })
}

/// Resolve every entry independently; a bad entry never spoils the others.
pub fn resolve_mapping(
    raw: &BTreeMap<String, String>,
    expand: impl Fn(&str) -> std::result::Result<PathBuf, EntryError>,
) -> (Vec<MirrorRoot>, Vec<EntryError>) {
    let mut roots: Vec<MirrorRoot> = Vec::new();
    let mut skipped = Vec::new();

    for (source, target) in raw {
        if target.trim().is_empty() {
            skipped.push(EntryError::MissingTarget {
                path: source.clone(),
            });
            continue;
        }

        let resolved = expand(source).and_then(|s| Ok((s, expand(target)?)));
        match resolved {
            Ok((source_root, _)) if roots.iter().any(|r| r.source == source_root) => {
                skipped.push(EntryError::DuplicateSource {
                    path: source.clone(),
                    root: source_root,
                });
            }
            Ok((source, target)) => roots.push(MirrorRoot { source, target }),
            Err(e) => skipped.push(e),
        }
    }

    (roots, skipped)
}

fn warn_nested_roots(roots: &[MirrorRoot]) {
    for outer in roots {
        for inner in roots {
            if outer.source != inner.source && inner.source.starts_with(&outer.source) {
                tracing::warn!(
                    outer = %outer.source.display(),
                    inner = %inner.source.display(),
                    "source roots are nested; files under the inner root will be mirrored twice"
                );
            }
        }
    }
}
