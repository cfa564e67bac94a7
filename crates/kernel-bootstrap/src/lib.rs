//! kernel-bootstrap - deploy a Python kernel environment for a notebook host.
//!
//! A run senses whether it lives inside a Jupyter server's process tree and
//! whether a conda environment is active, resolves a dependency manifest
//! against that context, deploys either the conda prefix or an isolated venv,
//! then registers a kernelspec and an IPython startup hook for it.
//!
//! Walking the process tree needs `/proc` or `psutil`. When neither is
//! available the run re-executes itself once inside a temporary venv that has
//! `psutil`; see [`capability`].

pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod kernelspec;
pub mod manifest;
pub mod orchestrator;
pub mod process_tree;
pub mod resolver;
pub mod setup;

pub use capability::{ProgramArgs, CAPABILITY_EXIT_CODE, RERUN_SENTINEL};
pub use config::{BootstrapConfig, Cli};
pub use context::{Context, EnvVars};
pub use error::BootstrapError;
pub use manifest::{Dependency, Manifest, ManifestError};
pub use orchestrator::{Collaborators, Orchestrator, Outcome, Plan, Report};
