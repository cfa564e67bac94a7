//! Kernelspec registration for a deployed environment.

use async_trait::async_trait;
use kernel_env::{Backend, Deployed};
use log::info;

/// Default kernel name for virtual environments.
pub const DEFAULT_KERNEL_NAME: &str = "kernel-bootstrap";

#[derive(Debug, thiserror::Error)]
pub enum KernelInstallError {
    #[error("failed to run {python}: {source}")]
    Spawn {
        python: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ipykernel install failed for {name} (exit code {code:?}): {stderr}")]
    Failed {
        name: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Where the kernelspec is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum KernelScope {
    /// The user's Jupyter data directory.
    #[default]
    User,
    /// The environment's own prefix.
    SysPrefix,
}

/// What was registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpecInfo {
    pub name: String,
    pub display_name: String,
}

/// Registers a kernel for a deployed environment.
#[async_trait]
pub trait KernelInstall: Send + Sync {
    async fn install(&self, deployed: &Deployed) -> Result<KernelSpecInfo, KernelInstallError>;
}

/// `python -m ipykernel install` inside the deployed environment.
#[derive(Debug, Clone, Default)]
pub struct IpykernelInstaller {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub scope: KernelScope,
}

impl IpykernelInstaller {
    /// Kernel name and display name for `deployed`.
    pub fn spec_for(&self, deployed: &Deployed) -> KernelSpecInfo {
        let base = match (&self.name, deployed.backend) {
            (Some(name), _) => name.clone(),
            (None, Backend::SystemManager) => deployed.env_name.clone(),
            (None, Backend::IsolatedVenv) => DEFAULT_KERNEL_NAME.to_string(),
        };
        let name = sanitize_kernel_name(&base);
        let display_name = self
            .display_name
            .clone()
            .unwrap_or_else(|| format!("Python ({base})"));
        KernelSpecInfo { name, display_name }
    }
}

#[async_trait]
impl KernelInstall for IpykernelInstaller {
    async fn install(&self, deployed: &Deployed) -> Result<KernelSpecInfo, KernelInstallError> {
        let spec = self.spec_for(deployed);
        let scope = match self.scope {
            KernelScope::User => "--user",
            KernelScope::SysPrefix => "--sys-prefix",
        };
        info!(
            "Installing kernelspec {:?} ({}) for {:?}",
            spec.name, spec.display_name, deployed.python_path
        );

        let args = vec![
            "-m".to_string(),
            "ipykernel".to_string(),
            "install".to_string(),
            scope.to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--display-name".to_string(),
            spec.display_name.clone(),
        ];
        let output = deployed
            .python(args, true)
            .await
            .map_err(|source| KernelInstallError::Spawn {
                python: deployed.python_path.display().to_string(),
                source,
            })?;

        if !output.success() {
            return Err(KernelInstallError::Failed {
                name: spec.name,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(spec)
    }
}

/// Kernel names may only contain ASCII letters, digits, `.`, `_` and `-`.
pub fn sanitize_kernel_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        DEFAULT_KERNEL_NAME.to_string()
    } else {
        cleaned
    }
}
