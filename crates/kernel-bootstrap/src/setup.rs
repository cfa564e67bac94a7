//! Strategy selection: pick the backend [`Setup`] for a sensed context.

use kernel_env::{
    Backend, CommandRunner, CondaPrefix, CondaSetup, Packages, ProgressHandler, Setup, VenvSetup,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::{Context, EnvVars};

/// Inputs both backends need besides the package set.
#[derive(Clone)]
pub struct SetupOptions {
    /// Root for hash-keyed virtual environments.
    pub env_dir: PathBuf,
    /// Interpreter that creates virtual environments.
    pub base_python: PathBuf,
    /// Channels for `conda install`; empty means conda-forge.
    pub channels: Vec<String>,
    pub runner: Arc<dyn CommandRunner>,
    pub handler: Arc<dyn ProgressHandler>,
}

/// Build the strategy matching `context.environment`.
///
/// The conda prefix is read from `vars`; if the variables disappeared since
/// sensing, the venv strategy is used.
pub fn select_setup(
    context: &Context,
    packages: Packages,
    vars: &EnvVars,
    options: &SetupOptions,
) -> Box<dyn Setup> {
    if context.environment == Backend::SystemManager {
        if let Some(prefix) = conda_prefix(vars) {
            return Box::new(
                CondaSetup::new(prefix, packages, options.runner.clone(), options.handler.clone())
                    .with_channels(options.channels.clone()),
            );
        }
    }

    Box::new(VenvSetup::new(
        packages,
        options.env_dir.clone(),
        options.base_python.clone(),
        options.runner.clone(),
        options.handler.clone(),
    ))
}

/// The active conda environment, when all activation variables are set.
pub fn conda_prefix(vars: &EnvVars) -> Option<CondaPrefix> {
    Some(CondaPrefix {
        conda_exe: PathBuf::from(vars.non_empty("CONDA_EXE")?),
        prefix: PathBuf::from(vars.non_empty("CONDA_PREFIX")?),
        env_name: vars.non_empty("CONDA_DEFAULT_ENV")?.to_string(),
    })
}
