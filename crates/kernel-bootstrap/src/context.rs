//! Context sensing: notebook host embedding and backend selection.
//!
//! Sensing reads an [`EnvVars`] snapshot, the ancestor chain from a
//! [`ProcessTable`] and, when a host is found, the versions its interpreter
//! has installed. For the same inputs it always produces the same [`Context`].

use async_trait::async_trait;
use kernel_env::{Backend, CommandRunner, Invocation};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::manifest::Manifest;
use crate::process_tree::{ProcessInfo, ProcessTable, ProcessTableError};

/// Set by Jupyter for processes it launches.
pub const NOTEBOOK_URL_VAR: &str = "JUPYTER_SERVER_URL";

/// Variables conda activation sets; all three mean "inside a conda env".
pub const SYSTEM_MANAGER_VARS: [&str; 3] = ["CONDA_EXE", "CONDA_PREFIX", "CONDA_DEFAULT_ENV"];

/// Executables that launch a notebook server.
pub const HOST_LAUNCHERS: &[&str] = &[
    "jupyter-lab",
    "jupyter-notebook",
    "jupyterhub-singleuser",
    "jupyter-labhub",
];

/// Snapshot of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    /// Capture the current process environment (non-UTF-8 entries skipped).
    pub fn capture() -> Self {
        Self(std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value of `name` if it is set and not empty.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) {
        self.0.remove(name);
    }

    fn log_var(&self, name: &str) {
        debug!("{name} = {}", self.get(name).unwrap_or("<nope>"));
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Whether the notebook URL variable suggests a host.
///
/// Only a hint: the variable may be stale, inherited from a parent shell.
pub fn notebook_url_present(vars: &EnvVars) -> bool {
    vars.log_var(NOTEBOOK_URL_VAR);
    vars.get(NOTEBOOK_URL_VAR)
        .is_some_and(|url| url.starts_with("http"))
}

/// `SystemManager` iff every conda activation variable is set and non-empty.
pub fn detect_backend(vars: &EnvVars) -> Backend {
    for var in SYSTEM_MANAGER_VARS {
        vars.log_var(var);
    }
    if SYSTEM_MANAGER_VARS
        .iter()
        .all(|var| vars.non_empty(var).is_some())
    {
        Backend::SystemManager
    } else {
        Backend::IsolatedVenv
    }
}

/// Whether a command line belongs to a notebook server launcher.
pub fn is_host_launcher(cmdline: &[String]) -> bool {
    cmdline
        .get(1)
        .is_some_and(|script| HOST_LAUNCHERS.iter().any(|name| script.ends_with(name)))
}

/// Nearest ancestor that is a notebook server launcher.
pub fn find_host(ancestors: &[ProcessInfo]) -> Option<&ProcessInfo> {
    ancestors.iter().find(|p| is_host_launcher(&p.cmdline))
}

/// Reports package versions installed in the host's interpreter.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Installed versions of `names`; names the host lacks are omitted.
    async fn installed_versions(
        &self,
        host: &ProcessInfo,
        names: &[String],
    ) -> Result<BTreeMap<String, String>, String>;
}

const VERSIONS_SCRIPT: &str = r#"
import json, platform, sys
from importlib import metadata
out = {}
for name in sys.argv[1:]:
    if name == "python":
        out[name] = platform.python_version()
        continue
    try:
        out[name] = metadata.version(name)
    except metadata.PackageNotFoundError:
        pass
print(json.dumps(out))
"#;

/// Runs the host's interpreter (`cmdline[0]`) with an `importlib.metadata` script.
pub struct PythonHostProbe {
    pub runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl HostProbe for PythonHostProbe {
    async fn installed_versions(
        &self,
        host: &ProcessInfo,
        names: &[String],
    ) -> Result<BTreeMap<String, String>, String> {
        let interpreter = host
            .cmdline
            .first()
            .ok_or_else(|| format!("host pid {} has an empty command line", host.pid))?;
        let invocation = Invocation::new(PathBuf::from(interpreter))
            .args(["-c", VERSIONS_SCRIPT])
            .args(names.iter().cloned());
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| format!("{interpreter}: {e}"))?;
        if !output.success() {
            return Err(output.stderr.trim().to_string());
        }
        serde_json::from_str(output.stdout.trim()).map_err(|e| e.to_string())
    }
}

/// Host probe that knows nothing; no versions are pinned.
pub struct NoHostProbe;

#[async_trait]
impl HostProbe for NoHostProbe {
    async fn installed_versions(
        &self,
        _host: &ProcessInfo,
        _names: &[String],
    ) -> Result<BTreeMap<String, String>, String> {
        Ok(BTreeMap::new())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SenseError {
    #[error("failed to inspect ancestor processes: {0}")]
    ProcessTable(#[from] ProcessTableError),
}

/// What sensing found about this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Context {
    pub running_inside_notebook_host: bool,
    /// Name to constraint that must be honored.
    pub critical_dependencies: BTreeMap<String, String>,
    pub environment: Backend,
    /// The notebook server ancestor, when hosted.
    #[serde(skip)]
    pub host: Option<ProcessInfo>,
}

/// Builds a [`Context`] from its three inputs.
pub struct ContextSensor<'a> {
    pub vars: &'a EnvVars,
    pub processes: &'a dyn ProcessTable,
    pub host_probe: &'a dyn HostProbe,
}

impl ContextSensor<'_> {
    pub async fn sense(&self, manifest: &Manifest) -> Result<Context, SenseError> {
        let environment = detect_backend(self.vars);

        let host = if notebook_url_present(self.vars) {
            let ancestors = self.processes.ancestors().await?;
            let host = find_host(&ancestors).cloned();
            match &host {
                Some(h) => info!("Running inside a notebook host (pid {})", h.pid),
                None => info!(
                    "{NOTEBOOK_URL_VAR} is set but no notebook server among {} ancestors",
                    ancestors.len()
                ),
            }
            host
        } else {
            None
        };

        let critical_dependencies = match &host {
            None => manifest
                .iter()
                .map(|d| (d.name.clone(), d.constraint.clone()))
                .collect(),
            Some(host) => self.host_pins(host, manifest).await,
        };

        Ok(Context {
            running_inside_notebook_host: host.is_some(),
            critical_dependencies,
            environment,
            host,
        })
    }

    /// Conditional and `sync` dependencies, pinned to the host's versions.
    async fn host_pins(&self, host: &ProcessInfo, manifest: &Manifest) -> BTreeMap<String, String> {
        let critical: Vec<_> = manifest
            .iter()
            .filter(|d| d.conditional || d.syncs_with_host())
            .collect();
        let names: Vec<String> = critical.iter().map(|d| d.name.clone()).collect();

        let versions = match self.host_probe.installed_versions(host, &names).await {
            Ok(versions) => versions,
            Err(e) => {
                warn!("Could not read package versions from the notebook host: {e}");
                BTreeMap::new()
            }
        };

        critical
            .into_iter()
            .map(|dep| {
                let constraint = match versions.get(&dep.name) {
                    Some(version) => format!("=={version}"),
                    None => dep.constraint.clone(),
                };
                debug!("critical dependency {} {}", dep.name, constraint);
                (dep.name.clone(), constraint)
            })
            .collect()
    }
}
