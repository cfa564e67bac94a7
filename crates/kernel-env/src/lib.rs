//! Kernel environment backends with progress reporting.
//!
//! Two interchangeable [`Setup`] strategies realize a resolved [`Packages`]
//! plan into an environment whose interpreter can be invoked through a
//! [`Deployed`] handle:
//!
//! - [`CondaSetup`] installs into the active conda prefix (system manager)
//! - [`VenvSetup`] builds a hash-keyed virtual environment with `uv` or the
//!   stdlib `venv` module
//!
//! All subprocesses go through a [`CommandRunner`], and lifecycle events are
//! reported to a [`ProgressHandler`].
//!
//! ```ignore
//! use kernel_env::{LogHandler, Setup, TokioRunner, VenvSetup};
//!
//! let setup = VenvSetup::new(packages, env_dir, "python3".into(),
//!     Arc::new(TokioRunner), Arc::new(LogHandler));
//! let deployed = setup.deploy().await?;
//! deployed.python(["-m", "ipykernel", "--version"], true).await?;
//! ```

pub mod conda;
pub mod deployed;
pub mod packages;
pub mod progress;
pub mod runner;
pub mod venv;

// Re-export key types
pub use conda::{CondaPrefix, CondaSetup};
pub use deployed::{Backend, DeployError, Deployed, Setup};
pub use packages::{PackageRequest, Packages, Registry};
pub use progress::{EnvProgressPhase, LogHandler, ProgressHandler};
pub use runner::{CommandOutput, CommandRunner, Invocation, TokioRunner};
pub use venv::VenvSetup;
