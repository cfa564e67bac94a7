//! System-manager backend: install into the active conda environment.
//!
//! The conda environment already exists (the caller detected `CONDA_EXE`,
//! `CONDA_PREFIX` and `CONDA_DEFAULT_ENV`), so deployment installs the
//! resolved packages into that prefix, one package per installer call:
//! conda-registry packages through `conda install`, PyPI packages through
//! the prefix's own `pip`.

use async_trait::async_trait;
use log::info;
use rattler_conda_types::{MatchSpec, ParseMatchSpecOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::deployed::{python_in, run_install, Backend, DeployError, Deployed, Setup};
use crate::packages::{requirement, Packages, Registry};
use crate::progress::{EnvProgressPhase, ProgressHandler};
use crate::runner::{CommandRunner, Invocation};

/// Default channel when none is configured.
pub const DEFAULT_CHANNEL: &str = "conda-forge";

/// The active conda environment, as announced by conda's activation variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondaPrefix {
    /// `CONDA_EXE`
    pub conda_exe: PathBuf,
    /// `CONDA_PREFIX`
    pub prefix: PathBuf,
    /// `CONDA_DEFAULT_ENV`
    pub env_name: String,
}

/// Installs a package set into a [`CondaPrefix`].
pub struct CondaSetup {
    target: CondaPrefix,
    packages: Packages,
    channels: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    handler: Arc<dyn ProgressHandler>,
}

impl CondaSetup {
    pub fn new(
        target: CondaPrefix,
        packages: Packages,
        runner: Arc<dyn CommandRunner>,
        handler: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            target,
            packages,
            channels: Vec::new(),
            runner,
            handler,
        }
    }

    /// Channels passed to `conda install -c`; defaults to conda-forge.
    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    /// The ordered install steps: conda packages first, then PyPI packages.
    pub fn install_plan(&self) -> Result<Vec<(String, Registry, Invocation)>, DeployError> {
        let mut packages = self.packages.clone();
        if !packages.contains("ipykernel") {
            packages.insert("ipykernel", Registry::Conda, "");
        }

        let channels: Vec<&str> = if self.channels.is_empty() {
            vec![DEFAULT_CHANNEL]
        } else {
            self.channels.iter().map(String::as_str).collect()
        };

        let python_path = prefix_python(&self.target.prefix);
        let mut plan = Vec::new();

        for (name, request) in packages.from_registry(Registry::Conda) {
            let spec = conda_spec(name, &request.constraint)?;
            let mut invocation = Invocation::new(&self.target.conda_exe)
                .args(["install", "--yes", "--quiet", "--prefix"])
                .path_arg(&self.target.prefix);
            for channel in &channels {
                invocation = invocation.arg("-c").arg(*channel);
            }
            plan.push((name.to_string(), Registry::Conda, invocation.arg(spec)));
        }

        for (name, request) in packages.from_registry(Registry::Pypi) {
            let invocation = Invocation::new(&python_path)
                .args(["-m", "pip", "install", "--quiet"])
                .arg(requirement(name, &request.constraint));
            plan.push((name.to_string(), Registry::Pypi, invocation));
        }

        Ok(plan)
    }
}

#[async_trait]
impl Setup for CondaSetup {
    fn backend(&self) -> Backend {
        Backend::SystemManager
    }

    async fn deploy(&self) -> Result<Deployed, DeployError> {
        let prefix = &self.target.prefix;
        self.handler.on_progress(
            "conda",
            EnvProgressPhase::Starting {
                env_path: prefix.to_string_lossy().to_string(),
            },
        );

        if !prefix.is_dir() {
            let err = DeployError::EnvCreation {
                path: prefix.clone(),
                reason: "CONDA_PREFIX does not point to a directory".to_string(),
            };
            self.report_error(&err);
            return Err(err);
        }

        let plan = self.install_plan().inspect_err(|e| self.report_error(e))?;
        let total = plan.len();
        info!(
            "Installing {} packages into conda env {:?} at {:?}",
            total, self.target.env_name, prefix
        );

        for (index, (name, registry, invocation)) in plan.iter().enumerate() {
            self.handler.on_progress(
                "conda",
                EnvProgressPhase::InstallingPackage {
                    name: name.clone(),
                    registry: *registry,
                    index: index + 1,
                    total,
                },
            );
            run_install(self.runner.as_ref(), invocation, name, *registry)
                .await
                .inspect_err(|e| self.report_error(e))?;
        }

        let python_path = prefix_python(prefix);
        self.handler.on_progress(
            "conda",
            EnvProgressPhase::Ready {
                env_path: prefix.to_string_lossy().to_string(),
                python_path: python_path.to_string_lossy().to_string(),
            },
        );

        Ok(Deployed::new(
            Backend::SystemManager,
            self.target.env_name.clone(),
            prefix.clone(),
            python_path,
            self.runner.clone(),
        ))
    }
}

impl CondaSetup {
    fn report_error(&self, err: &DeployError) {
        self.handler.on_progress(
            "conda",
            EnvProgressPhase::Error {
                message: err.to_string(),
            },
        );
    }
}

/// Build and validate a conda match spec for `name` + `constraint`.
pub fn conda_spec(name: &str, constraint: &str) -> Result<String, DeployError> {
    let spec = requirement(name, constraint);
    MatchSpec::from_str(&spec, ParseMatchSpecOptions::strict()).map_err(|e| {
        DeployError::InvalidSpec {
            spec: spec.clone(),
            registry: Registry::Conda,
            reason: e.to_string(),
        }
    })?;
    Ok(spec)
}

/// Conda's `python` inside `prefix`.
pub fn prefix_python(prefix: &Path) -> PathBuf {
    python_in(prefix, Backend::SystemManager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingHandler;
    use crate::runner::testing::ScriptedRunner;

    fn setup_in(
        prefix: &Path,
        packages: Packages,
        runner: Arc<ScriptedRunner>,
        handler: Arc<RecordingHandler>,
    ) -> CondaSetup {
        CondaSetup::new(
            CondaPrefix {
                conda_exe: PathBuf::from("/opt/conda/bin/conda"),
                prefix: prefix.to_path_buf(),
                env_name: "analysis".to_string(),
            },
            packages,
            runner,
            handler,
        )
    }

    #[test]
    fn test_conda_spec_validation() {
        assert_eq!(conda_spec("python", ">=3.10").unwrap(), "python>=3.10");
        assert_eq!(conda_spec("numpy", "").unwrap(), "numpy");
        assert!(matches!(
            conda_spec("numpy", ">=>=1"),
            Err(DeployError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_install_plan_orders_conda_before_pypi() {
        let prefix = tempfile::tempdir().unwrap();
        let packages: Packages = [
            ("umap", Registry::Pypi, ""),
            ("numba", Registry::Conda, ""),
            ("python", Registry::Conda, ">=3.10"),
        ]
        .into_iter()
        .collect();
        let setup = setup_in(
            prefix.path(),
            packages,
            Arc::new(ScriptedRunner::succeeding()),
            Arc::new(RecordingHandler::default()),
        );

        let plan = setup.install_plan().unwrap();
        let names: Vec<&str> = plan.iter().map(|(n, _, _)| n.as_str()).collect();
        // ipykernel is always added for the kernelspec step
        assert_eq!(names, vec!["ipykernel", "numba", "python", "umap"]);

        let python_step = &plan[2].2;
        assert_eq!(python_step.program, PathBuf::from("/opt/conda/bin/conda"));
        assert!(python_step.args.contains(&"conda-forge".to_string()));
        assert_eq!(python_step.args.last().unwrap(), "python>=3.10");

        let umap_step = &plan[3].2;
        assert_eq!(umap_step.program, prefix_python(prefix.path()));
        assert_eq!(umap_step.args[..3], ["-m", "pip", "install"]);
    }

    #[test]
    fn test_custom_channels() {
        let prefix = tempfile::tempdir().unwrap();
        let packages: Packages = [("numpy", Registry::Conda, "")].into_iter().collect();
        let setup = setup_in(
            prefix.path(),
            packages,
            Arc::new(ScriptedRunner::succeeding()),
            Arc::new(RecordingHandler::default()),
        )
        .with_channels(vec!["bioconda".into(), "defaults".into()]);

        let plan = setup.install_plan().unwrap();
        let line = plan[1].2.to_string();
        assert!(line.contains("-c bioconda -c defaults"));
        assert!(!line.contains("conda-forge"));
    }

    #[tokio::test]
    async fn test_deploy_installs_each_package() {
        let prefix = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::succeeding());
        let handler = Arc::new(RecordingHandler::default());
        let packages: Packages = [("numpy", Registry::Conda, ""), ("umap", Registry::Pypi, "")]
            .into_iter()
            .collect();

        let deployed = setup_in(prefix.path(), packages, runner.clone(), handler.clone())
            .deploy()
            .await
            .unwrap();

        assert_eq!(deployed.backend, Backend::SystemManager);
        assert_eq!(deployed.env_name, "analysis");
        assert_eq!(deployed.python_path, prefix_python(prefix.path()));
        assert_eq!(runner.calls().len(), 3);
        assert!(matches!(
            handler.events().last().unwrap().1,
            EnvProgressPhase::Ready { .. }
        ));
    }

    #[tokio::test]
    async fn test_deploy_stops_at_first_failure() {
        let prefix = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::failing_on("numba"));
        let handler = Arc::new(RecordingHandler::default());
        let packages: Packages = [
            ("numba", Registry::Conda, ""),
            ("scipy", Registry::Conda, ""),
            ("umap", Registry::Pypi, ""),
        ]
        .into_iter()
        .collect();

        let err = setup_in(prefix.path(), packages, runner.clone(), handler.clone())
            .deploy()
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InstallFailed { ref package, .. } if package == "numba"));
        // ipykernel, then the failing numba; scipy and umap are never attempted
        assert_eq!(runner.calls().len(), 2);
        assert!(matches!(
            handler.events().last().unwrap().1,
            EnvProgressPhase::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_deploy_rejects_missing_prefix() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let err = setup_in(
            Path::new("/nonexistent/conda/prefix"),
            Packages::new(),
            runner.clone(),
            Arc::new(RecordingHandler::default()),
        )
        .deploy()
        .await
        .unwrap_err();
        assert!(matches!(err, DeployError::EnvCreation { .. }));
        assert!(runner.calls().is_empty());
    }
}
