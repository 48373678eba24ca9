use anyhow::{Context, Result};
use regex::Regex;

/// Compiled ignore rules shared by every watched root.
///
/// Dotfiles and dot-directories are always ignored. Each configured fragment
/// is a literal substring that may appear anywhere in the relative path.
#[derive(Debug, Clone)]
pub struct IgnoreSpec {
    pattern: Regex,
    fragments: Vec<String>,
}

impl IgnoreSpec {
    pub fn compile(fragments: &[String]) -> Result<Self> {
        let fragments: Vec<String> = fragments
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let mut source = String::from(r"(^|/)\.");
        for fragment in &fragments {
            source.push('|');
            source.push_str(&regex::escape(fragment));
        }

        let pattern = Regex::new(&source)
            .with_context(|| format!("Failed to compile ignore pattern: {source}"))?;
        Ok(Self { pattern, fragments })
    }

    /// Test a forward-slash path relative to its source root.
    pub fn is_ignored(&self, relative: &str) -> bool {
        !relative.is_empty() && self.pattern.is_match(relative)
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }
}

impl Default for IgnoreSpec {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"(^|/)\.").expect("dotfile regex is valid"),
            fragments: Vec::new(),
        }
    }
}
