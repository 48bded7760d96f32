//! Backend collaborator configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the isolation backend lives and where the per-invocation handoff
/// directories go.
///
/// The backend itself is opaque: crucible writes an input bundle, invokes
/// the configured command, reads the output bundle, and asks the configured
/// cleanup helper to drop the output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Root for staged input directories (one per invocation).
    pub input_root: PathBuf,

    /// Root under which the backend writes output directories.
    pub output_root: PathBuf,

    /// The privilege-dropping backend command.
    pub sandbox_path: PathBuf,

    /// Privileged helper that removes an output directory by invocation id.
    pub cleanup_path: PathBuf,

    /// Directory whose entries name the known runners.
    pub runners_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("/run/crucible_i"),
            output_root: PathBuf::from("/run/crucible_o"),
            sandbox_path: PathBuf::from("/usr/local/bin/crucible_sandbox"),
            cleanup_path: PathBuf::from("/usr/local/bin/crucible_rm"),
            runners_dir: PathBuf::from("/usr/local/share/crucible/runners"),
        }
    }
}

impl BackendConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::default()
    }

    /// Defaults with `CRUCIBLE_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for (var, field) in [
            ("CRUCIBLE_INPUT_ROOT", &mut config.input_root),
            ("CRUCIBLE_OUTPUT_ROOT", &mut config.output_root),
            ("CRUCIBLE_SANDBOX", &mut config.sandbox_path),
            ("CRUCIBLE_RM", &mut config.cleanup_path),
            ("CRUCIBLE_RUNNERS", &mut config.runners_dir),
        ] {
            if let Ok(value) = std::env::var(var) {
                *field = PathBuf::from(value);
            }
        }
        config
    }

    /// Staged input directory for a hashed invocation id.
    #[must_use]
    pub fn input_dir(&self, dir_name: &str) -> PathBuf {
        self.input_root.join(dir_name)
    }

    /// Backend output directory for a hashed invocation id.
    #[must_use]
    pub fn output_dir(&self, dir_name: &str) -> PathBuf {
        self.output_root.join(dir_name)
    }
}

/// Builder for [`BackendConfig`]
#[derive(Debug, Default)]
pub struct BackendConfigBuilder {
    config: BackendConfig,
}

impl BackendConfigBuilder {
    #[must_use]
    pub fn input_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.input_root = path.into();
        self
    }

    #[must_use]
    pub fn output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_root = path.into();
        self
    }

    #[must_use]
    pub fn sandbox_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.sandbox_path = path.into();
        self
    }

    #[must_use]
    pub fn cleanup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cleanup_path = path.into();
        self
    }

    #[must_use]
    pub fn runners_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.runners_dir = path.into();
        self
    }

    #[must_use]
    pub fn build(self) -> BackendConfig {
        self.config
    }
}

/// Listen address from `CRUCIBLE_BIND`, falling back to the loopback default.
#[must_use]
pub fn default_bind_address() -> String {
    std::env::var("CRUCIBLE_BIND").unwrap_or_else(|_| "127.0.0.1:8500".to_string())
}

/// True when a path is absolute and names an existing directory.
pub fn check_dir(path: &Path) -> crate::Result<()> {
    if !path.is_absolute() {
        return Err(crate::CrucibleError::Config(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(crate::CrucibleError::Config(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = BackendConfig::builder()
            .input_root("/tmp/i")
            .output_root("/tmp/o")
            .sandbox_path("/opt/backend")
            .build();
        assert_eq!(config.input_root, PathBuf::from("/tmp/i"));
        assert_eq!(config.output_root, PathBuf::from("/tmp/o"));
        assert_eq!(config.sandbox_path, PathBuf::from("/opt/backend"));
        assert_eq!(config.cleanup_path, BackendConfig::default().cleanup_path);
    }

    #[test]
    fn invocation_dirs_are_namespaced_by_hash() {
        let config = BackendConfig::default();
        assert_eq!(config.input_dir("abc"), PathBuf::from("/run/crucible_i/abc"));
        assert_eq!(config.output_dir("abc"), PathBuf::from("/run/crucible_o/abc"));
    }

    #[test]
    fn check_dir_rejects_relative_and_missing_paths() {
        assert!(check_dir(Path::new("relative/path")).is_err());
        assert!(check_dir(Path::new("/definitely/not/here")).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(check_dir(dir.path()).is_ok());
    }
}
