//! Sandbox backends: where agent CLI commands actually execute.
//!
//! The `Sandbox` trait is the capability set {start, exec, stop}. Backends:
//! `local-subprocess` runs commands directly in the project directory (no
//! isolation; for trusted CLIs and tests), `container` drives a Docker
//! container with the repository mounted at `/workspace/project`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Errors from sandbox lifecycle and execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("docker {verb} failed: {stderr}")]
    Docker { verb: &'static str, stderr: String },

    #[error("unknown sandbox {0:?} (not started or already stopped)")]
    UnknownSandbox(String),

    #[error("empty command")]
    EmptyCommand,
}

/// Result of one `exec`: the process exit code and merged stdout/stderr.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Capability set for sandbox providers.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name (e.g. "local-subprocess", "container").
    fn name(&self) -> &str;

    /// Bring up one sandbox bound to the project repo path; returns its ID.
    async fn start(&self, repo_path: &Path) -> Result<String, SandboxError>;

    /// Run a command inside a started sandbox, optionally feeding stdin.
    /// A non-zero exit code is data, not an error.
    async fn exec(
        &self,
        sandbox_id: &str,
        argv: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutcome, SandboxError>;

    /// Tear the sandbox down.
    async fn stop(&self, sandbox_id: &str) -> Result<(), SandboxError>;
}

// Compile-time assertion: Sandbox must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Sandbox) {}
};

/// Factory: create a sandbox backend from a mode string.
pub fn create_sandbox(mode: &str, docker_image: Option<&str>) -> anyhow::Result<Arc<dyn Sandbox>> {
    match mode {
        "local-subprocess" => Ok(Arc::new(LocalSandbox::new())),
        "container" => Ok(Arc::new(ContainerSandbox::new(
            docker_image.unwrap_or("ubuntu:24.04"),
        ))),
        other => anyhow::bail!(
            "unknown sandbox mode: {other:?} (expected \"local-subprocess\" or \"container\")"
        ),
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return 128 + signal;
            }
        }
        -1
    })
}

fn merge_output(output: &std::process::Output) -> String {
    let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&stderr);
    }
    merged
}

// ---------------------------------------------------------------------------
// Local subprocess
// ---------------------------------------------------------------------------

/// Runs commands directly on the host in the sandbox's working directory.
/// Provides no isolation; use only for trusted CLI tools or testing.
#[derive(Debug, Default)]
pub struct LocalSandbox {
    /// sandbox_id -> working directory.
    workdirs: Mutex<HashMap<String, PathBuf>>,
    /// sandbox_id -> pids of in-flight execs, terminated on stop.
    live_pids: Mutex<HashMap<String, Vec<u32>>>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_pid(&self, sandbox_id: &str, pid: u32) {
        self.live_pids
            .lock()
            .unwrap()
            .entry(sandbox_id.to_owned())
            .or_default()
            .push(pid);
    }

    fn unregister_pid(&self, sandbox_id: &str, pid: u32) {
        if let Some(pids) = self.live_pids.lock().unwrap().get_mut(sandbox_id) {
            pids.retain(|p| *p != pid);
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        "local-subprocess"
    }

    async fn start(&self, repo_path: &Path) -> Result<String, SandboxError> {
        let id = format!("local-{}", uuid::Uuid::new_v4());
        self.workdirs
            .lock()
            .unwrap()
            .insert(id.clone(), repo_path.to_path_buf());
        debug!(sandbox_id = %id, repo = %repo_path.display(), "local sandbox started");
        Ok(id)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        argv: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutcome, SandboxError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::EmptyCommand);
        };
        let workdir = self
            .workdirs
            .lock()
            .unwrap()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownSandbox(sandbox_id.to_owned()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&workdir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: program.clone(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        self.register_pid(sandbox_id, pid);

        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let text = text.to_owned();
            // Write concurrently so a full pipe cannot deadlock the child.
            tokio::spawn(async move {
                let _ = pipe.write_all(text.as_bytes()).await;
            });
        }

        let output = child.wait_with_output().await;
        self.unregister_pid(sandbox_id, pid);
        let output = output?;

        Ok(ExecOutcome {
            exit_code: exit_code_of(output.status),
            output: merge_output(&output),
        })
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.workdirs
            .lock()
            .unwrap()
            .remove(sandbox_id)
            .ok_or_else(|| SandboxError::UnknownSandbox(sandbox_id.to_owned()))?;

        // Terminate any exec still in flight: SIGTERM, leaving SIGKILL to
        // the kill_on_drop guard if the process ignores it.
        let pids = self
            .live_pids
            .lock()
            .unwrap()
            .remove(sandbox_id)
            .unwrap_or_default();
        for pid in pids {
            #[cfg(unix)]
            {
                // SAFETY: pid came from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed for in-flight exec");
                }
            }
            #[cfg(not(unix))]
            let _ = pid;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Docker container
// ---------------------------------------------------------------------------

/// Runs commands inside a persistent Docker container with the repository
/// mounted at `/workspace/project`.
#[derive(Debug)]
pub struct ContainerSandbox {
    image: String,
    extra_flags: Vec<String>,
}

impl ContainerSandbox {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            extra_flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    async fn docker(
        verb: &'static str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<std::process::Output, SandboxError> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: "docker".to_owned(),
            source,
        })?;
        if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let text = text.to_owned();
            tokio::spawn(async move {
                let _ = pipe.write_all(text.as_bytes()).await;
            });
        }
        let output = child.wait_with_output().await?;
        if verb != "exec" && !output.status.success() {
            return Err(SandboxError::Docker {
                verb,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn name(&self) -> &str {
        "container"
    }

    async fn start(&self, repo_path: &Path) -> Result<String, SandboxError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-v".into(),
            format!("{}:/workspace/project", repo_path.display()),
            "-w".into(),
            "/workspace/project".into(),
        ];
        args.extend(self.extra_flags.iter().cloned());
        args.push(self.image.clone());
        args.extend(["sleep".into(), "infinity".into()]);

        let output = Self::docker("run", &args, None).await?;
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if container_id.is_empty() {
            return Err(SandboxError::Docker {
                verb: "run",
                stderr: "no container id on stdout".to_owned(),
            });
        }
        debug!(container_id = %container_id, image = %self.image, "container sandbox started");
        Ok(container_id)
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        argv: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutcome, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        let mut args: Vec<String> = vec!["exec".into()];
        if stdin.is_some() {
            args.push("-i".into());
        }
        args.push(sandbox_id.to_owned());
        args.extend(argv.iter().cloned());

        let output = Self::docker("exec", &args, stdin).await?;
        Ok(ExecOutcome {
            exit_code: exit_code_of(output.status),
            output: merge_output(&output),
        })
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let args: Vec<String> = vec!["rm".into(), "-f".into(), sandbox_id.to_owned()];
        Self::docker("rm", &args, None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn local_exec_captures_output_and_exit_code() {
        let sandbox = LocalSandbox::new();
        let dir = tempfile::tempdir().unwrap();
        let id = sandbox.start(dir.path()).await.unwrap();

        let ok = sandbox
            .exec(&id, &argv(&["sh", "-c", "echo hello"]), None)
            .await
            .unwrap();
        assert_eq!(ok.exit_code, 0);
        assert_eq!(ok.output.trim(), "hello");

        let failed = sandbox
            .exec(&id, &argv(&["sh", "-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(failed.exit_code, 3);
        assert!(failed.output.contains("oops"));
    }

    #[tokio::test]
    async fn local_exec_runs_in_repo_path() {
        let sandbox = LocalSandbox::new();
        let dir = tempfile::tempdir().unwrap();
        let id = sandbox.start(dir.path()).await.unwrap();

        let outcome = sandbox.exec(&id, &argv(&["pwd"]), None).await.unwrap();
        let pwd = std::path::PathBuf::from(outcome.output.trim());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn local_exec_feeds_stdin() {
        let sandbox = LocalSandbox::new();
        let dir = tempfile::tempdir().unwrap();
        let id = sandbox.start(dir.path()).await.unwrap();

        let outcome = sandbox
            .exec(&id, &argv(&["cat"]), Some("piped prompt"))
            .await
            .unwrap();
        assert_eq!(outcome.output, "piped prompt");
    }

    #[tokio::test]
    async fn exec_on_unknown_sandbox_fails() {
        let sandbox = LocalSandbox::new();
        let err = sandbox
            .exec("local-missing", &argv(&["true"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSandbox(_)));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_an_exit_code() {
        let sandbox = LocalSandbox::new();
        let dir = tempfile::tempdir().unwrap();
        let id = sandbox.start(dir.path()).await.unwrap();

        let err = sandbox
            .exec(&id, &argv(&["/nonexistent/binary"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[tokio::test]
    async fn stop_forgets_the_sandbox() {
        let sandbox = LocalSandbox::new();
        let dir = tempfile::tempdir().unwrap();
        let id = sandbox.start(dir.path()).await.unwrap();
        sandbox.stop(&id).await.unwrap();
        assert!(matches!(
            sandbox.stop(&id).await.unwrap_err(),
            SandboxError::UnknownSandbox(_)
        ));
    }

    #[test]
    fn factory_resolves_modes() {
        assert_eq!(
            create_sandbox("local-subprocess", None).unwrap().name(),
            "local-subprocess"
        );
        assert_eq!(
            create_sandbox("container", Some("img:latest")).unwrap().name(),
            "container"
        );
        assert!(create_sandbox("vm", None).is_err());
    }
}
