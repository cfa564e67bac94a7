//! Isolated virtual environment backend.
//!
//! Environments are keyed by a SHA-256 hash of the resolved package set and
//! stored under the env directory. `uv` is used when it answers
//! `uv --version`; otherwise the base interpreter's `venv` module and the
//! venv's own `pip` do the work. Every package is installed from PyPI.

use async_trait::async_trait;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::deployed::{python_in, run_install, Backend, DeployError, Deployed, Setup};
use crate::packages::{requirement, Packages, Registry};
use crate::progress::{EnvProgressPhase, ProgressHandler};
use crate::runner::{CommandRunner, Invocation};

/// Marker written once every package has been installed.
const COMPLETE_MARKER: &str = ".complete";

/// Manifest names that describe the interpreter itself rather than a package.
const INTERPRETER_PACKAGES: &[&str] = &["python", "pip"];

/// Get the default directory for virtual environments.
pub fn default_env_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kernel-bootstrap")
        .join("envs")
}

/// Compute a stable cache key for the given package set.
pub fn compute_env_hash(packages: &Packages) -> String {
    let mut hasher = Sha256::new();

    // Packages iterates in name order, so the hash is order independent.
    for (name, request) in packages.iter() {
        hasher.update(name.as_bytes());
        hasher.update(b"@");
        hasher.update(request.registry.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(request.constraint.as_bytes());
        hasher.update(b"\n");
    }

    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Turn a `python` constraint into a `uv venv --python` request.
///
/// uv takes version specifiers (`>=3.10`, `<3.12`, `!=3.11`) as they are; an
/// exact pin is passed as the bare version. Returns `None` for no constraint.
pub fn python_request(constraint: &str) -> Option<String> {
    let constraint = constraint.trim();
    let request = constraint.strip_prefix("==").unwrap_or(constraint).trim();
    if request.is_empty() {
        None
    } else {
        Some(request.to_string())
    }
}

/// Tool used to build the venv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenvTool {
    Uv(PathBuf),
    /// The base interpreter's `venv` module.
    Stdlib(PathBuf),
}

impl VenvTool {
    fn label(&self) -> &'static str {
        match self {
            VenvTool::Uv(_) => "uv",
            VenvTool::Stdlib(_) => "python -m venv",
        }
    }
}

/// Pick `uv` when it runs, else the stdlib `venv` module of `base_python`.
pub async fn detect_venv_tool(runner: &dyn CommandRunner, base_python: &Path) -> VenvTool {
    let probe = Invocation::new("uv").arg("--version");
    match runner.run(&probe).await {
        Ok(output) if output.success() => {
            info!("Using uv ({})", output.stdout.trim());
            VenvTool::Uv(PathBuf::from("uv"))
        }
        _ => {
            info!("uv not found, falling back to {:?} -m venv", base_python);
            VenvTool::Stdlib(base_python.to_path_buf())
        }
    }
}

/// Builds a venv for a package set under `env_dir`.
pub struct VenvSetup {
    packages: Packages,
    env_dir: PathBuf,
    base_python: PathBuf,
    runner: Arc<dyn CommandRunner>,
    handler: Arc<dyn ProgressHandler>,
}

impl VenvSetup {
    pub fn new(
        packages: Packages,
        env_dir: PathBuf,
        base_python: PathBuf,
        runner: Arc<dyn CommandRunner>,
        handler: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            packages,
            env_dir,
            base_python,
            runner,
            handler,
        }
    }

    /// Where this package set's environment lives.
    pub fn venv_path(&self) -> PathBuf {
        self.env_dir.join(compute_env_hash(&self.packages))
    }

    fn create_invocation(&self, tool: &VenvTool, venv_path: &Path) -> Invocation {
        let python_constraint = self
            .packages
            .get("python")
            .and_then(|req| python_request(&req.constraint));

        match tool {
            VenvTool::Uv(uv) => {
                let mut inv = Invocation::new(uv).arg("venv").path_arg(venv_path);
                if let Some(version) = python_constraint {
                    inv = inv.arg("--python").arg(version);
                }
                inv
            }
            VenvTool::Stdlib(python) => {
                if let Some(version) = python_constraint {
                    warn!(
                        "python {} requested but the venv module always uses {:?}",
                        version, python
                    );
                }
                Invocation::new(python).args(["-m", "venv"]).path_arg(venv_path)
            }
        }
    }

    /// Per-package install commands, in name order.
    pub fn install_plan(&self, tool: &VenvTool, python_path: &Path) -> Vec<(String, Invocation)> {
        let mut packages = self.packages.clone();
        if !packages.contains("ipykernel") {
            packages.insert("ipykernel", Registry::Pypi, "");
        }

        packages
            .iter()
            .filter(|(name, _)| !INTERPRETER_PACKAGES.contains(name))
            .map(|(name, request)| {
                let spec = requirement(name, &request.constraint);
                let inv = match tool {
                    VenvTool::Uv(uv) => Invocation::new(uv)
                        .args(["pip", "install", "--python"])
                        .path_arg(python_path)
                        .arg(spec),
                    VenvTool::Stdlib(_) => Invocation::new(python_path)
                        .args(["-m", "pip", "install", "--quiet"])
                        .arg(spec),
                };
                (name.to_string(), inv)
            })
            .collect()
    }

    fn deployed(&self, venv_path: PathBuf, python_path: PathBuf) -> Deployed {
        let env_name = venv_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Deployed::new(
            Backend::IsolatedVenv,
            env_name,
            venv_path,
            python_path,
            self.runner.clone(),
        )
    }

    fn report_error(&self, err: &DeployError) {
        self.handler.on_progress(
            "venv",
            EnvProgressPhase::Error {
                message: err.to_string(),
            },
        );
    }
}

#[async_trait]
impl Setup for VenvSetup {
    fn backend(&self) -> Backend {
        Backend::IsolatedVenv
    }

    async fn deploy(&self) -> Result<Deployed, DeployError> {
        let venv_path = self.venv_path();
        let python_path = python_in(&venv_path, Backend::IsolatedVenv);
        let env_path_str = venv_path.to_string_lossy().to_string();

        self.handler.on_progress(
            "venv",
            EnvProgressPhase::Starting {
                env_path: env_path_str.clone(),
            },
        );

        // Cache hit
        if python_path.exists() && venv_path.join(COMPLETE_MARKER).exists() {
            info!("Using cached environment at {:?}", venv_path);
            self.handler.on_progress(
                "venv",
                EnvProgressPhase::CacheHit {
                    env_path: env_path_str.clone(),
                },
            );
            self.handler.on_progress(
                "venv",
                EnvProgressPhase::Ready {
                    env_path: env_path_str,
                    python_path: python_path.to_string_lossy().to_string(),
                },
            );
            return Ok(self.deployed(venv_path, python_path));
        }

        info!("Creating new environment at {:?}", venv_path);
        tokio::fs::create_dir_all(&self.env_dir).await?;

        // Remove partial environment
        if venv_path.exists() {
            tokio::fs::remove_dir_all(&venv_path).await?;
        }

        let tool = detect_venv_tool(self.runner.as_ref(), &self.base_python).await;
        self.handler.on_progress(
            "venv",
            EnvProgressPhase::CreatingVenv {
                tool: tool.label().to_string(),
            },
        );

        let create = self.create_invocation(&tool, &venv_path);
        let output = self
            .runner
            .run(&create)
            .await
            .map_err(|source| DeployError::Spawn {
                program: create.program_name(),
                source,
            })
            .inspect_err(|e| self.report_error(e))?;
        if !output.success() {
            let err = DeployError::EnvCreation {
                path: venv_path.clone(),
                reason: output.stderr.trim().to_string(),
            };
            self.report_error(&err);
            return Err(err);
        }

        let plan = self.install_plan(&tool, &python_path);
        let total = plan.len();
        for (index, (name, invocation)) in plan.iter().enumerate() {
            self.handler.on_progress(
                "venv",
                EnvProgressPhase::InstallingPackage {
                    name: name.clone(),
                    registry: Registry::Pypi,
                    index: index + 1,
                    total,
                },
            );
            run_install(self.runner.as_ref(), invocation, name, Registry::Pypi)
                .await
                .inspect_err(|e| self.report_error(e))?;
        }

        tokio::fs::create_dir_all(&venv_path)
            .await
            .map_err(DeployError::from)
            .inspect_err(|e| self.report_error(e))?;
        tokio::fs::write(venv_path.join(COMPLETE_MARKER), "")
            .await
            .map_err(DeployError::from)
            .inspect_err(|e| self.report_error(e))?;

        info!("Environment ready at {:?}", venv_path);
        self.handler.on_progress(
            "venv",
            EnvProgressPhase::Ready {
                env_path: env_path_str,
                python_path: python_path.to_string_lossy().to_string(),
            },
        );

        Ok(self.deployed(venv_path, python_path))
    }
}
