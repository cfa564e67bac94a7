//! Subprocess execution for package managers and interpreters.
//!
//! Every external command the backends run (conda, uv, pip, python) goes
//! through a [`CommandRunner`]. The default [`TokioRunner`] spawns real
//! processes; tests substitute a scripted runner that records invocations.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// A single command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment variables layered over the inherited environment.
    pub envs: Vec<(String, String)>,
    /// Capture stdout/stderr instead of inheriting the parent's streams.
    pub capture: bool,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            capture: true,
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

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Let the child write straight to our stdout/stderr.
    pub fn inherit_output(mut self) -> Self {
        self.capture = false;
        self
    }

    /// Name of the program without its directory, for matching and logs.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout (empty when output was inherited).
    pub stdout: String,
    /// Captured stderr (empty when output was inherited).
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes via `tokio::process`.
pub struct TokioRunner;

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        log::debug!("Running {invocation}");

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }

        if !invocation.capture {
            let status = cmd.status().await?;
            return Ok(CommandOutput {
                code: status.code(),
                ..Default::default()
            });
        }

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    //! Scripted runner for tests that must not touch real package managers.

    use super::{CommandOutput, CommandRunner, Invocation};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Invocation) -> std::io::Result<CommandOutput> + Send + Sync>;

    /// Records every invocation and answers with a caller-supplied closure.
    pub struct ScriptedRunner {
        responder: Responder,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&Invocation) -> std::io::Result<CommandOutput> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Every command exits 0 with empty output.
        pub fn succeeding() -> Self {
            Self::new(|_| Ok(CommandOutput::exited(0)))
        }

        /// Commands whose rendered form contains `needle` exit 1, all others 0.
        pub fn failing_on(needle: &str) -> Self {
            let needle = needle.to_string();
            Self::new(move |inv| {
                if inv.to_string().contains(&needle) {
                    Ok(CommandOutput::exited(1).with_stderr(format!("scripted failure: {needle}")))
                } else {
                    Ok(CommandOutput::exited(0))
                }
            })
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Rendered command lines, in call order.
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(ToString::to_string).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            (self.responder)(invocation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("/opt/conda/bin/conda")
            .args(["install", "--yes"])
            .arg("numpy>=1.26");
        assert_eq!(
            inv.to_string(),
            "/opt/conda/bin/conda install --yes numpy>=1.26"
        );
        assert_eq!(inv.program_name(), "conda");
        assert!(inv.capture);
    }

    #[test]
    fn test_inherit_output_disables_capture() {
        let inv = Invocation::new("python3").inherit_output();
        assert!(!inv.capture);
    }

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::exited(0).success());
        assert!(!CommandOutput::exited(2).success());
        assert!(!CommandOutput::default().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let out = TokioRunner
            .run(&Invocation::new("sh").args(["-c", "printf hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_passes_env() {
        let out = TokioRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "printf %s \"$KERNEL_ENV_TEST\""])
                    .env("KERNEL_ENV_TEST", "value"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "value");
    }
}
