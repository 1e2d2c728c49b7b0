//! Helm invocation behind a narrow synchronous command runner.
//!
//! `CommandRunner` is the only seam through which external commands run.
//! `ProcessRunner` spawns real processes with a hard deadline;
//! `DryRunRunner` records invocations and reports success.
//!
//! # Timeouts
//! Every helm call carries helm's own `--timeout`. The runner enforces a
//! second, hard deadline of `timeout + grace` and kills the process when
//! it passes, reporting `timed_out` on the output.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RepositoryConfig;
use crate::error::{ClusterError, Result};
use crate::types::ChartRef;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REPO_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra time the runner allows beyond helm's own `--timeout`.
pub const DEADLINE_GRACE: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Invocation / CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Hard deadline after which the process is killed.
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `program arg1 arg2 ...`, for logs and diagnostics.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stderr if present, otherwise stdout, trimmed and capped.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        text.chars().take(2000).collect()
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs real processes, killing them at the invocation's deadline.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let start = Instant::now();
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ClusterError::Infra(format!("failed to spawn '{}': {e}", invocation.program))
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = start + invocation.timeout;
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout: collect(stdout),
            stderr: collect(stderr),
            elapsed: start.elapsed(),
            timed_out,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Records every invocation and reports success without running anything.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    invocations: Mutex<Vec<Invocation>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!(command = %invocation.command_line(), "dry run");
        if let Ok(mut log) = self.invocations.lock() {
            log.push(invocation.clone());
        }
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            timed_out: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Output classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelmAction {
    RepoAdd,
    UpgradeInstall,
    Uninstall,
}

/// A helm command that ran to completion or hit its deadline.
///
/// Failures are returned as `ClusterError::TransientInfra` or
/// `ClusterError::Infra` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelmCompletion {
    Done { upgraded: bool },
    TimedOut { diagnostic: String },
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "another operation (install/upgrade/rollback) is in progress",
    "the server is currently unable to handle the request",
    "too many requests",
    "etcdserver: request timed out",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    "timed out waiting for the condition",
    "context deadline exceeded",
];

pub fn classify(action: HelmAction, output: &CommandOutput) -> Result<HelmCompletion> {
    if output.timed_out {
        return Ok(HelmCompletion::TimedOut {
            diagnostic: format!("killed after {}s", output.elapsed.as_secs()),
        });
    }
    if output.success() {
        let upgraded = action == HelmAction::UpgradeInstall
            && output.stdout.contains("has been upgraded");
        return Ok(HelmCompletion::Done { upgraded });
    }

    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    if action == HelmAction::Uninstall && lower.contains("release: not found") {
        return Ok(HelmCompletion::Done { upgraded: false });
    }
    if TIMEOUT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Ok(HelmCompletion::TimedOut { diagnostic });
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Err(ClusterError::TransientInfra(diagnostic));
    }
    let code = output
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    Err(ClusterError::Infra(format!("helm exited with {code}: {diagnostic}")))
}

// ---------------------------------------------------------------------------
// HelmDriver
// ---------------------------------------------------------------------------

pub struct HelmDriver {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    kubeconfig: Option<PathBuf>,
}

impl HelmDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    fn invocation(&self, timeout: Duration) -> Invocation {
        let inv = Invocation::new(self.binary.clone(), timeout);
        match &self.kubeconfig {
            Some(path) => inv
                .arg("--kubeconfig")
                .arg(path.to_string_lossy().into_owned()),
            None => inv,
        }
    }

    async fn execute(&self, action: HelmAction, invocation: Invocation) -> Result<HelmCompletion> {
        debug!(command = %invocation.command_line(), "helm");
        let runner = Arc::clone(&self.runner);
        let output = tokio::task::spawn_blocking(move || runner.run(&invocation))
            .await
            .map_err(|e| ClusterError::Infra(format!("command task failed: {e}")))??;
        classify(action, &output)
    }

    /// `helm repo add <name> <url> --force-update`
    pub async fn repo_add(&self, repo: &RepositoryConfig) -> Result<HelmCompletion> {
        let inv = self.invocation(REPO_TIMEOUT).args([
            "repo",
            "add",
            repo.name.as_str(),
            repo.url.as_str(),
            "--force-update",
        ]);
        self.execute(HelmAction::RepoAdd, inv).await
    }

    /// `helm upgrade --install` with `values` written to a temporary file.
    pub async fn upgrade_install(
        &self,
        release: &str,
        namespace: &str,
        chart: &ChartRef,
        values: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HelmCompletion> {
        let mut values_file = tempfile::Builder::new()
            .prefix("jupytercluster-values-")
            .suffix(".yaml")
            .tempfile()?;
        serde_yaml::to_writer(&mut values_file, values)?;

        let mut inv = self
            .invocation(timeout + DEADLINE_GRACE)
            .args(["upgrade", "--install", release, chart.reference.as_str()])
            .args(["--namespace", namespace])
            .arg("--values")
            .arg(values_file.path().to_string_lossy().into_owned())
            .arg("--wait")
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs()));
        if let Some(version) = &chart.version {
            inv = inv.args(["--version", version.as_str()]);
        }
        let result = self.execute(HelmAction::UpgradeInstall, inv).await;
        drop(values_file);
        result
    }

    /// `helm uninstall <release> --namespace <ns> --wait --timeout <secs>s`
    pub async fn uninstall(
        &self,
        release: &str,
        namespace: &str,
        timeout: Duration,
    ) -> Result<HelmCompletion> {
        let inv = self
            .invocation(timeout + DEADLINE_GRACE)
            .args(["uninstall", release, "--namespace", namespace, "--wait"])
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs()));
        self.execute(HelmAction::Uninstall, inv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(10),
            timed_out: false,
        }
    }

    #[test]
    fn classify_success_and_upgrade() {
        let fresh = classify(HelmAction::UpgradeInstall, &output(0, "STATUS: deployed", ""));
        assert_eq!(fresh.unwrap(), HelmCompletion::Done { upgraded: false });

        let again = classify(
            HelmAction::UpgradeInstall,
            &output(0, "Release \"jupyterhub-a\" has been upgraded. Happy Helming!", ""),
        );
        assert_eq!(again.unwrap(), HelmCompletion::Done { upgraded: true });
    }

    #[test]
    fn classify_transient_and_permanent_failures() {
        let transient = classify(
            HelmAction::UpgradeInstall,
            &output(1, "", "Error: dial tcp 10.0.0.1:443: connect: connection refused"),
        )
        .unwrap_err();
        assert!(transient.is_transient());

        let busy = classify(
            HelmAction::UpgradeInstall,
            &output(
                1,
                "",
                "Error: UPGRADE FAILED: another operation (install/upgrade/rollback) is in progress",
            ),
        )
        .unwrap_err();
        assert!(busy.is_transient());

        let permanent = classify(
            HelmAction::UpgradeInstall,
            &output(1, "", "Error: chart \"nope\" not found"),
        )
        .unwrap_err();
        assert!(matches!(permanent, ClusterError::Infra(_)));
        assert!(permanent.to_string().contains("exited with 1"));
    }

    #[test]
    fn classify_uninstall_missing_release_is_success() {
        let out = output(1, "", "Error: uninstall: Release not loaded: jupyterhub-a: release: not found");
        assert_eq!(
            classify(HelmAction::Uninstall, &out).unwrap(),
            HelmCompletion::Done { upgraded: false }
        );
        assert!(classify(HelmAction::UpgradeInstall, &out).is_err());
    }

    #[test]
    fn classify_timeouts() {
        let waited = output(1, "", "Error: timed out waiting for the condition");
        assert!(matches!(
            classify(HelmAction::UpgradeInstall, &waited).unwrap(),
            HelmCompletion::TimedOut { .. }
        ));

        let mut killed = output(0, "", "");
        killed.exit_code = None;
        killed.timed_out = true;
        assert!(!killed.success());
        assert!(matches!(
            classify(HelmAction::Uninstall, &killed).unwrap(),
            HelmCompletion::TimedOut { .. }
        ));
    }

    #[tokio::test]
    async fn upgrade_install_builds_helm_arguments() {
        let runner = Arc::new(DryRunRunner::new());
        let helm = HelmDriver::new(runner.clone(), "helm")
            .with_kubeconfig(Some(PathBuf::from("/etc/kube/config")));
        let chart = ChartRef {
            reference: "jupyterhub/jupyterhub".into(),
            version: Some("3.3.7".into()),
        };

        let done = helm
            .upgrade_install(
                "jupyterhub-a",
                "jupyterhub-a",
                &chart,
                &serde_json::json!({"hub": {}}),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        assert_eq!(done, HelmCompletion::Done { upgraded: false });

        let calls = runner.invocations();
        assert_eq!(calls.len(), 1);
        let line = calls[0].command_line();
        assert!(line.starts_with("helm --kubeconfig /etc/kube/config upgrade --install jupyterhub-a jupyterhub/jupyterhub --namespace jupyterhub-a --values "), "{line}");
        assert!(line.contains("--wait --timeout 300s --version 3.3.7"), "{line}");
        assert_eq!(calls[0].timeout, Duration::from_secs(300) + DEADLINE_GRACE);
    }

    #[tokio::test]
    async fn uninstall_and_repo_add_arguments() {
        let runner = Arc::new(DryRunRunner::new());
        let helm = HelmDriver::new(runner.clone(), "helm");
        helm.uninstall("jupyterhub-a", "jupyterhub-a", Duration::from_secs(60))
            .await
            .unwrap();
        helm.repo_add(&RepositoryConfig {
            name: "jupyterhub".into(),
            url: "https://hub.jupyter.org/helm-chart/".into(),
        })
        .await
        .unwrap();

        let calls = runner.invocations();
        assert_eq!(
            calls[0].args,
            vec![
                "uninstall",
                "jupyterhub-a",
                "--namespace",
                "jupyterhub-a",
                "--wait",
                "--timeout",
                "60s"
            ]
        );
        assert_eq!(
            calls[1].command_line(),
            "helm repo add jupyterhub https://hub.jupyter.org/helm-chart/ --force-update"
        );
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_captures_output_and_exit_code() {
        let inv = Invocation::new("sh", Duration::from_secs(10))
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let out = ProcessRunner.run(&inv).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_kills_at_deadline() {
        let inv = Invocation::new("sleep", Duration::from_millis(200)).arg("10");
        let out = ProcessRunner.run(&inv).unwrap();
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(5), "{:?}", out.elapsed);
    }

    #[test]
    fn process_runner_spawn_failure_is_infra() {
        let inv = Invocation::new("__nonexistent_helm_xyz__", Duration::from_secs(1));
        let err = ProcessRunner.run(&inv).unwrap_err();
        assert!(matches!(err, ClusterError::Infra(_)));
        assert!(err.to_string().contains("__nonexistent_helm_xyz__"));
    }
}
