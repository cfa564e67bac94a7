use kernel_env::DeployError;

use crate::capability::{CapabilityError, CAPABILITY_EXIT_CODE};
use crate::context::SenseError;
use crate::hooks::HookError;
use crate::kernelspec::KernelInstallError;
use crate::manifest::ManifestError;

/// Any failure that aborts a bootstrap run.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Sense(#[from] SenseError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    KernelInstall(#[from] KernelInstallError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootstrapError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Capability(CapabilityError::StillMissing) => CAPABILITY_EXIT_CODE,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            BootstrapError::from(CapabilityError::StillMissing).exit_code(),
            CAPABILITY_EXIT_CODE
        );
        let err = BootstrapError::from(ManifestError::UnknownRegistry {
            line: 1,
            token: "npm".into(),
        });
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("npm"));
        assert_eq!(BootstrapError::Config("x".into()).exit_code(), 1);
    }
}
