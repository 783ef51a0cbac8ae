//! Backend processes behind adapters.
//!
//! [`CliBackend`] spawns a provider CLI in non-interactive single-shot
//! mode: the prompt goes in on stdin, the process runs in the session
//! working directory, and role output lands in scratch files named inside
//! the prompt. Stdout is never parsed; only the exit code and a stderr
//! excerpt feed error classification.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use super::{InvokeRequest, Provider};

/// Grace period between SIGTERM and SIGKILL when a deadline expires.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Cap on the stderr excerpt kept for classification.
const STDERR_EXCERPT_LEN: usize = 4096;

/// Raw facts about one finished (or killed) backend process.
#[derive(Debug, Clone)]
pub struct RawInvocation {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stderr_excerpt: String,
    pub duration_ms: u64,
}

/// The seam between adapters and real processes.
///
/// Production uses [`CliBackend`]; tests use scripted implementations that
/// write the expected output files themselves.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(&self, request: &InvokeRequest) -> Result<RawInvocation>;

    /// Cheap availability probe, used by the fallback chain and `doctor`.
    async fn probe(&self) -> bool;

    fn describe(&self) -> String;
}

/// Spawns one provider CLI per invocation.
pub struct CliBackend {
    command: String,
    args: Vec<String>,
    /// Env var that must be set for the provider to authenticate, if any
    required_env: Option<&'static str>,
}

impl CliBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            required_env: None,
        }
    }

    /// Backend wiring for a known provider CLI.
    pub fn for_provider(command: &str, model: &str, provider: Provider) -> Self {
        let (args, required_env): (Vec<String>, Option<&'static str>) = match provider {
            Provider::Sonnet | Provider::Opus => (
                vec![
                    "--print".into(),
                    "--model".into(),
                    model.into(),
                    "--dangerously-skip-permissions".into(),
                ],
                None,
            ),
            Provider::Gemini => (vec!["--model".into(), model.into()], Some("GEMINI_API_KEY")),
            Provider::Glm => (vec!["--model".into(), model.into()], Some("ZAI_API_KEY")),
            Provider::Codex => (
                vec!["exec".into(), "--model".into(), model.into()],
                Some("OPENAI_API_KEY"),
            ),
        };
        Self {
            command: command.to_string(),
            args,
            required_env,
        }
    }

    async fn spawn(&self, working_dir: &Path) -> Result<Child> {
        Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .current_dir(working_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn backend process '{}'", self.command))
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn invoke(&self, request: &InvokeRequest) -> Result<RawInvocation> {
        let start = Instant::now();
        let mut child = self.spawn(&request.working_dir).await?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .context("Failed to write prompt to backend stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut timed_out = false;
        let status = match tokio::time::timeout(request.deadline, child.wait()).await {
            Ok(status) => status.context("Failed to wait on backend process")?,
            Err(_) => {
                timed_out = true;
                terminate_gracefully(&mut child).await;
                child.wait().await.context("Failed to reap killed backend")?
            }
        };

        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let mut stderr_excerpt = String::from_utf8_lossy(&stderr_bytes).to_string();
        stderr_excerpt.truncate(STDERR_EXCERPT_LEN);

        Ok(RawInvocation {
            exit_code: status.code().unwrap_or(-1),
            timed_out,
            stderr_excerpt,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn probe(&self) -> bool {
        if let Some(var) = self.required_env
            && std::env::var(var).map(|v| v.is_empty()).unwrap_or(true)
        {
            return false;
        }
        let probe = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(status)) if status.success()
        )
    }

    fn describe(&self) -> String {
        format!("{} {}", self.command, self.args.join(" "))
    }
}

/// SIGTERM first so the CLI can flush partial output, SIGKILL after the
/// grace period.
async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn request(dir: &Path, deadline: Duration) -> InvokeRequest {
        InvokeRequest {
            prompt: "write a file".into(),
            working_dir: dir.to_path_buf(),
            deadline,
            expected_outputs: vec![dir.join("out")],
        }
    }

    #[tokio::test]
    async fn invoke_captures_exit_code_and_stderr() {
        let dir = tempdir().unwrap();
        let backend = CliBackend::new(
            "sh",
            vec!["-c".into(), "echo oops >&2; exit 3".into()],
        );
        let raw = backend
            .invoke(&request(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(raw.exit_code, 3);
        assert!(!raw.timed_out);
        assert!(raw.stderr_excerpt.contains("oops"));
    }

    #[tokio::test]
    async fn invoke_reads_prompt_from_stdin() {
        let dir = tempdir().unwrap();
        let backend = CliBackend::new("sh", vec!["-c".into(), "cat > out".into()]);
        let raw = backend
            .invoke(&request(dir.path(), Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(raw.exit_code, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out")).unwrap(),
            "write a file"
        );
    }

    #[tokio::test]
    async fn invoke_kills_on_deadline() {
        let dir = tempdir().unwrap();
        let backend = CliBackend::new("sh", vec!["-c".into(), "sleep 30".into()]);
        let start = Instant::now();
        let raw = backend
            .invoke(&request(dir.path(), Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(raw.timed_out);
        // SIGTERM should fell the sleep well before the 5 s SIGKILL grace
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn probe_fails_for_missing_binary() {
        let backend = CliBackend::new("definitely-not-a-real-cli-xyz", vec![]);
        assert!(!backend.probe().await);
    }

    #[tokio::test]
    async fn probe_fails_without_required_env() {
        let mut backend = CliBackend::new("sh", vec![]);
        backend.required_env = Some("ORCHESTRA_TEST_UNSET_VAR_XYZ");
        assert!(!backend.probe().await);
    }

    #[test]
    fn spawn_failure_surfaces_as_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let backend = CliBackend::new("definitely-not-a-real-cli-xyz", vec![]);
        let req = InvokeRequest {
            prompt: String::new(),
            working_dir: PathBuf::from("."),
            deadline: Duration::from_secs(1),
            expected_outputs: vec![],
        };
        let err = rt.block_on(backend.invoke(&req)).unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
