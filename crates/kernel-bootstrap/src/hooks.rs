//! IPython startup hook for kernels running from the deployed environment.
//!
//! Kernels launched by a notebook server inherit the server's `PATH`, so
//! `!pip` or `!python` in a cell would reach the server's tools instead of
//! the kernel's. The hook puts the environment's `bin` directory first.

use async_trait::async_trait;
use kernel_env::Deployed;
use log::info;
use std::path::{Path, PathBuf};

use crate::context::EnvVars;

/// File name inside `profile_default/startup`.
pub const HOOK_FILE_NAME: &str = "50-kernel-bootstrap.py";

const HOOK_TEMPLATE: &str = r#"# Installed by kernel-bootstrap; rewritten on every run.
import os
import sys

_ENV_PATH = __ENV_PATH__

if os.path.realpath(sys.prefix) == os.path.realpath(_ENV_PATH):
    _bin = os.path.join(sys.prefix, "Scripts" if os.name == "nt" else "bin")
    _path = os.environ.get("PATH", "")
    if _bin not in _path.split(os.pathsep):
        os.environ["PATH"] = _bin + os.pathsep + _path
"#;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("no IPython directory: set IPYTHONDIR or pass --hooks-dir")]
    NoIpythonDir,

    #[error("failed to write hook {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Installs host-side hooks for a deployed environment.
#[async_trait]
pub trait HookDeploy: Send + Sync {
    /// Returns the files written.
    async fn deploy(&self, deployed: &Deployed) -> Result<Vec<PathBuf>, HookError>;
}

/// Writes the startup hook into an IPython profile directory.
#[derive(Debug, Clone)]
pub struct StartupHookInstaller {
    pub ipython_dir: PathBuf,
}

impl StartupHookInstaller {
    /// Resolve the IPython directory: explicit, `IPYTHONDIR`, then `~/.ipython`.
    pub fn locate(explicit: Option<PathBuf>, vars: &EnvVars) -> Result<Self, HookError> {
        let ipython_dir = explicit
            .or_else(|| vars.non_empty("IPYTHONDIR").map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|home| home.join(".ipython")))
            .ok_or(HookError::NoIpythonDir)?;
        Ok(Self { ipython_dir })
    }

    pub fn hook_path(&self) -> PathBuf {
        self.ipython_dir
            .join("profile_default")
            .join("startup")
            .join(HOOK_FILE_NAME)
    }
}

/// Hook source for an environment rooted at `env_path`.
pub fn render_hook(env_path: &Path) -> String {
    // A JSON string literal is also a valid Python string literal.
    let literal = serde_json::Value::String(env_path.to_string_lossy().to_string()).to_string();
    HOOK_TEMPLATE.replace("__ENV_PATH__", &literal)
}

#[async_trait]
impl HookDeploy for StartupHookInstaller {
    async fn deploy(&self, deployed: &Deployed) -> Result<Vec<PathBuf>, HookError> {
        let path = self.hook_path();
        let write_err = |source| HookError::Write {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
        }
        tokio::fs::write(&path, render_hook(&deployed.env_path))
            .await
            .map_err(write_err)?;

        info!("Installed startup hook at {:?}", path);
        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_env::runner::testing::ScriptedRunner;
    use kernel_env::Backend;
    use std::sync::Arc;

    fn deployed(env_path: &str) -> Deployed {
        Deployed::new(
            Backend::IsolatedVenv,
            "x",
            env_path,
            format!("{env_path}/bin/python"),
            Arc::new(ScriptedRunner::succeeding()),
        )
    }

    #[test]
    fn test_render_hook_quotes_path() {
        let hook = render_hook(Path::new("/home/a \"b\"/envs/x"));
        assert!(hook.contains(r#"_ENV_PATH = "/home/a \"b\"/envs/x""#));
        assert!(!hook.contains("__ENV_PATH__"));
    }

    #[test]
    fn test_locate_prefers_explicit_then_ipythondir() {
        let vars: EnvVars = [("IPYTHONDIR", "/srv/ipython")].into_iter().collect();
        let installer = StartupHookInstaller::locate(Some("/explicit".into()), &vars).unwrap();
        assert_eq!(installer.ipython_dir, PathBuf::from("/explicit"));

        let installer = StartupHookInstaller::locate(None, &vars).unwrap();
        assert_eq!(
            installer.hook_path(),
            PathBuf::from("/srv/ipython/profile_default/startup").join(HOOK_FILE_NAME)
        );
    }

    #[tokio::test]
    async fn test_deploy_writes_and_overwrites_hook() {
        let dir = tempfile::tempdir().unwrap();
        let installer = StartupHookInstaller {
            ipython_dir: dir.path().to_path_buf(),
        };

        let written = installer.deploy(&deployed("/envs/one")).await.unwrap();
        assert_eq!(written, vec![installer.hook_path()]);
        let first = std::fs::read_to_string(installer.hook_path()).unwrap();
        assert!(first.contains("\"/envs/one\""));

        installer.deploy(&deployed("/envs/two")).await.unwrap();
        let second = std::fs::read_to_string(installer.hook_path()).unwrap();
        assert!(second.contains("\"/envs/two\""));
        assert!(!second.contains("/envs/one"));
    }
}
