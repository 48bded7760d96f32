//! Sandbox lifecycle
//!
//! The isolation backend is an external, privilege-dropping command. This
//! module owns the filesystem handoff around it: stage the input bundle,
//! launch the backend in its own process group, collect its status record,
//! and tear the ephemeral directories down exactly once.

use crucible_core::report::RawStatus;
use crucible_core::{BackendConfig, CrucibleError, Invocation, Result, fingerprint};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// SIGKILL an entire backend process group.
///
/// ESRCH is not an error: the group already died.
pub fn kill_group(pgid: Pid) {
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            tracing::warn!(%pgid, error = %e, "failed to kill backend process group");
        }
    }
}

/// Staged input bundle for one invocation, and the obligation to remove it.
pub struct SandboxHandle {
    config: Arc<BackendConfig>,
    invocation_id: String,
    dir_name: String,
    torn_down: bool,
}

impl SandboxHandle {
    /// Create the invocation's input directory and write `code`, `input`,
    /// and the NUL-joined `arguments`/`options` payloads into it.
    ///
    /// On failure the partial directory is already cleaned up; the caller
    /// only owes a [`teardown`](Self::teardown) once staging succeeded.
    pub async fn stage(
        config: Arc<BackendConfig>,
        invocation: &Invocation,
        invocation_id: &str,
    ) -> Result<Self> {
        let mut handle = Self {
            dir_name: fingerprint::sandbox_dir_name(invocation_id),
            invocation_id: invocation_id.to_string(),
            config,
            torn_down: false,
        };
        if let Err(e) = handle.write_bundle(invocation).await {
            handle.teardown().await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn write_bundle(&self, invocation: &Invocation) -> Result<()> {
        let dir = self.input_dir();
        tokio::fs::create_dir(&dir).await.map_err(|e| {
            CrucibleError::Stage(format!("cannot create input directory {}: {e}", dir.display()))
        })?;
        for (name, data) in [
            ("code", invocation.code.clone()),
            ("input", invocation.input.clone()),
            ("arguments", invocation.arguments_payload()),
            ("options", invocation.options_payload()),
        ] {
            tokio::fs::write(dir.join(name), data).await.map_err(|e| {
                CrucibleError::Stage(format!("cannot write {name} into {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Where the backend reads the invocation's inputs from.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.config.input_dir(&self.dir_name)
    }

    /// Where the backend writes `stdout`, `stderr`, and `status`.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir(&self.dir_name)
    }

    /// Spawn the backend for this staged invocation.
    ///
    /// The backend becomes its own process group leader so a later kill
    /// reaches everything it forked.
    pub fn launch(
        &self,
        client_fingerprint: &str,
        invocation: &Invocation,
    ) -> Result<(BackendProcess, ChildStdout, ChildStderr)> {
        let mut command = Command::new(&self.config.sandbox_path);
        command
            .arg(client_fingerprint)
            .arg(&self.invocation_id)
            .arg(&invocation.language)
            .arg(invocation.timeout.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| {
            CrucibleError::Backend(format!(
                "cannot spawn {}: {e}",
                self.config.sandbox_path.display()
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CrucibleError::Backend("backend stdout was not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CrucibleError::Backend("backend stderr was not piped".into()))?;
        let pgid = child
            .id()
            .map(|id| Pid::from_raw(id.try_into().unwrap_or(i32::MAX)))
            .ok_or_else(|| CrucibleError::Backend("backend exited before it was observed".into()))?;
        tracing::debug!(%pgid, language = %invocation.language, "backend launched");
        let process = BackendProcess {
            child,
            pgid,
            status_path: self.output_dir().join("status"),
        };
        Ok((process, stdout, stderr))
    }

    /// Remove the input directory and ask the privileged helper to remove
    /// the backend's output directory. Runs at most once; a second call is
    /// a no-op. Failures are logged, never propagated.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let input_dir = self.input_dir();
        if let Err(e) = tokio::fs::remove_dir_all(&input_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %input_dir.display(), error = %e, "failed to remove input directory");
            }
        }

        match Command::new(&self.config.cleanup_path)
            .arg(&self.invocation_id)
            .status()
            .await
        {
            Ok(status) if !status.success() => {
                tracing::warn!(%status, "output cleanup helper reported failure");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    helper = %self.config.cleanup_path.display(),
                    error = %e,
                    "failed to run output cleanup helper"
                );
            }
        }
    }
}

/// A live backend invocation.
pub struct BackendProcess {
    child: Child,
    pgid: Pid,
    status_path: PathBuf,
}

impl BackendProcess {
    /// Process group to signal for cancellation or timeout.
    #[must_use]
    pub const fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Reap the backend, then read and decode its status record.
    ///
    /// Cancel-safe: dropping the future and calling again resumes waiting.
    pub async fn wait(&mut self) -> Result<RawStatus> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| CrucibleError::Backend(format!("error waiting for backend: {e}")))?;
        tracing::debug!(%status, "backend exited");
        let data = tokio::fs::read(&self.status_path).await.map_err(|e| {
            CrucibleError::Status(format!("cannot read {}: {e}", self.status_path.display()))
        })?;
        RawStatus::from_json(&data)
            .map_err(|e| CrucibleError::Status(format!("malformed status record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> Arc<BackendConfig> {
        std::fs::create_dir(root.join("input")).unwrap();
        std::fs::create_dir(root.join("output")).unwrap();
        Arc::new(
            BackendConfig::builder()
                .input_root(root.join("input"))
                .output_root(root.join("output"))
                .cleanup_path("true")
                .build(),
        )
    }

    fn invocation() -> Invocation {
        Invocation {
            language: "zsh".into(),
            code: b"echo hi".to_vec(),
            input: b"stdin".to_vec(),
            arguments: vec![b"foo".to_vec(), b"bar".to_vec()],
            options: vec![],
            timeout: 60,
        }
    }

    #[tokio::test]
    async fn stage_writes_the_input_bundle() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let handle = SandboxHandle::stage(config, &invocation(), "deadbeef")
            .await
            .unwrap();
        let dir = handle.input_dir();
        assert_eq!(std::fs::read(dir.join("code")).unwrap(), b"echo hi");
        assert_eq!(std::fs::read(dir.join("input")).unwrap(), b"stdin");
        assert_eq!(std::fs::read(dir.join("arguments")).unwrap(), b"foo\0bar\0");
        assert_eq!(std::fs::read(dir.join("options")).unwrap(), b"");
        // directory name is the hashed id, not the id itself
        assert!(!dir.ends_with("deadbeef"));
    }

    #[tokio::test]
    async fn concurrent_invocations_get_distinct_directories() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let a = SandboxHandle::stage(config.clone(), &invocation(), "one")
            .await
            .unwrap();
        let b = SandboxHandle::stage(config, &invocation(), "two")
            .await
            .unwrap();
        assert_ne!(a.input_dir(), b.input_dir());
    }

    #[tokio::test]
    async fn teardown_removes_the_input_directory_once() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let mut handle = SandboxHandle::stage(config, &invocation(), "deadbeef")
            .await
            .unwrap();
        let dir = handle.input_dir();
        assert!(dir.is_dir());
        handle.teardown().await;
        assert!(!dir.exists());
        // second call is a guarded no-op even if the directory reappears
        std::fs::create_dir(&dir).unwrap();
        handle.teardown().await;
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn staging_into_a_missing_root_fails_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let config = Arc::new(
            BackendConfig::builder()
                .input_root(root.path().join("missing"))
                .cleanup_path("true")
                .build(),
        );
        assert!(
            SandboxHandle::stage(config, &invocation(), "deadbeef")
                .await
                .is_err()
        );
    }
}
