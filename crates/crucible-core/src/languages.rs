//! Known-runner registry
//!
//! One runner per entry in the runners directory; loaded once before any
//! session starts and read-only afterwards.

use crate::{CrucibleError, Result};
use std::collections::HashSet;
use std::path::Path;

/// Load the set of known language identifiers from the runners directory.
///
/// Identifiers are the literal entry names, case preserved; matching at
/// validation time is exact.
pub fn load(dir: &Path) -> Result<HashSet<String>> {
    let mut languages = HashSet::new();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CrucibleError::Languages(format!("cannot read runners directory {}: {e}", dir.display()))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            CrucibleError::Languages(format!("cannot read runners directory entry: {e}"))
        })?;
        match entry.file_name().into_string() {
            Ok(name) => {
                languages.insert(name);
            }
            Err(name) => {
                tracing::warn!(?name, "skipping runner with non-unicode name");
            }
        }
    }
    if languages.is_empty() {
        tracing::warn!(dir = %dir.display(), "runners directory is empty");
    }
    Ok(languages)
}

/// Language names in a stable order, for the metadata endpoint.
#[must_use]
pub fn sorted(languages: &HashSet<String>) -> Vec<&str> {
    let mut names: Vec<&str> = languages.iter().map(String::as_str).collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_entry_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zsh"), b"").unwrap();
        std::fs::write(dir.path().join("python"), b"").unwrap();
        let languages = load(dir.path()).unwrap();
        assert_eq!(languages.len(), 2);
        assert!(languages.contains("zsh"));
        assert!(languages.contains("python"));
        assert!(!languages.contains("ZSH"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn sorted_is_deterministic() {
        let languages: HashSet<String> =
            ["zsh".to_string(), "awk".to_string(), "python".to_string()].into();
        assert_eq!(sorted(&languages), ["awk", "python", "zsh"]);
    }
}
