//! The deployment contract shared by both backends.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::packages::Registry;
use crate::runner::{CommandOutput, CommandRunner, Invocation};

/// Which package-management backend governs the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// An active conda environment managed by the system package manager.
    SystemManager,
    /// A lightweight virtual environment owned by this tool.
    IsolatedVenv,
}

impl Backend {
    /// Short label used in progress events and logs.
    pub fn env_type(&self) -> &'static str {
        match self {
            Backend::SystemManager => "conda",
            Backend::IsolatedVenv => "venv",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::SystemManager => f.write_str("system-manager"),
            Backend::IsolatedVenv => f.write_str("isolated-venv"),
        }
    }
}

/// Errors from deploying an environment.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("failed to create environment at {path}: {reason}")]
    EnvCreation { path: PathBuf, reason: String },

    #[error("invalid {registry} spec {spec:?}: {reason}")]
    InvalidSpec {
        spec: String,
        registry: Registry,
        reason: String,
    },

    #[error("installing {package} from {registry} failed (exit code {code:?}): {stderr}")]
    InstallFailed {
        package: String,
        registry: Registry,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A realized environment whose interpreter can be invoked.
#[derive(Clone)]
pub struct Deployed {
    pub backend: Backend,
    /// Environment name (conda env name, or the venv directory name).
    pub env_name: String,
    pub env_path: PathBuf,
    pub python_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for Deployed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployed")
            .field("backend", &self.backend)
            .field("env_name", &self.env_name)
            .field("env_path", &self.env_path)
            .field("python_path", &self.python_path)
            .finish()
    }
}

impl Deployed {
    pub fn new(
        backend: Backend,
        env_name: impl Into<String>,
        env_path: impl Into<PathBuf>,
        python_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            backend,
            env_name: env_name.into(),
            env_path: env_path.into(),
            python_path: python_path.into(),
            runner,
        }
    }

    /// Run the environment's interpreter with `args`.
    ///
    /// With `capture` set, stdout and stderr are collected in the result;
    /// otherwise they go straight to this process's streams.
    pub async fn python<I, S>(&self, args: I, capture: bool) -> std::io::Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut invocation = Invocation::new(&self.python_path).args(args);
        if !capture {
            invocation = invocation.inherit_output();
        }
        self.runner.run(&invocation).await
    }
}

/// A backend strategy: installs its package set and hands back the result.
#[async_trait]
pub trait Setup: Send + Sync {
    fn backend(&self) -> Backend;

    async fn deploy(&self) -> Result<Deployed, DeployError>;
}

/// Interpreter location inside an environment prefix.
pub(crate) fn python_in(env_path: &Path, backend: Backend) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        match backend {
            Backend::SystemManager => env_path.join("python.exe"),
            Backend::IsolatedVenv => env_path.join("Scripts").join("python.exe"),
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        let _ = backend;
        env_path.join("bin").join("python")
    }
}

/// Run one install command and map a non-zero exit to [`DeployError::InstallFailed`].
pub(crate) async fn run_install(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    package: &str,
    registry: Registry,
) -> Result<(), DeployError> {
    let output = runner
        .run(invocation)
        .await
        .map_err(|source| DeployError::Spawn {
            program: invocation.program_name(),
            source,
        })?;

    if !output.success() {
        return Err(DeployError::InstallFailed {
            package: package.to_string(),
            registry,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}
