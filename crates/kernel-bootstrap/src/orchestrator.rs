//! One bootstrap run, start to finish.
//!
//! ```text
//! manifest ─▶ capability ─▶ sense ─▶ resolve ─▶ select ─▶ deploy ─▶ kernelspec ─▶ hook
//! ```
//!
//! Every step needs the previous one; the first error ends the run.

use kernel_env::{
    Backend, CommandRunner, LogHandler, Packages, ProgressHandler, TokioRunner,
};
use log::info;
use serde::Serialize;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use crate::capability::{
    ensure_capability, BootstrapOutcome, CapabilityError, CapabilityProbe, ProgramArgs,
    Relauncher, SystemCapabilityProbe, VenvRelauncher,
};
use crate::config::BootstrapConfig;
use crate::context::{Context, ContextSensor, EnvVars, HostProbe, PythonHostProbe};
use crate::error::BootstrapError;
use crate::hooks::{HookDeploy, StartupHookInstaller};
use crate::kernelspec::{IpykernelInstaller, KernelInstall, KernelSpecInfo};
use crate::manifest::Manifest;
use crate::resolver::resolve;
use crate::setup::{select_setup, SetupOptions};

/// The pieces of a run that touch the outside world.
pub struct Collaborators {
    pub probe: Arc<dyn CapabilityProbe>,
    pub relauncher: Arc<dyn Relauncher>,
    pub host_probe: Arc<dyn HostProbe>,
    pub runner: Arc<dyn CommandRunner>,
    pub handler: Arc<dyn ProgressHandler>,
    /// `None` skips kernelspec registration.
    pub kernel: Option<Arc<dyn KernelInstall>>,
    /// `None` skips the startup hook.
    pub hooks: Option<Arc<dyn HookDeploy>>,
}

impl Collaborators {
    /// Real subprocesses, `/proc` or psutil, and the user's IPython profile.
    pub fn system(
        config: &BootstrapConfig,
        vars: &EnvVars,
        program_args: &ProgramArgs,
    ) -> Result<Self, BootstrapError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioRunner);

        // A re-executed run looks for psutil in the venv it was started from.
        let probe_python = match vars.non_empty("VIRTUAL_ENV") {
            Some(venv) if program_args.is_rerun => PathBuf::from(venv).join("bin").join("python"),
            _ => config.base_python.clone(),
        };

        let work_dir = std::env::current_dir().map_err(|e| CapabilityError::TempEnv {
            dir: PathBuf::from("."),
            reason: e.to_string(),
        })?;
        let program = std::env::current_exe().map_err(|source| CapabilityError::Relaunch {
            program: "kernel-bootstrap".to_string(),
            source,
        })?;

        let kernel: Option<Arc<dyn KernelInstall>> = if config.skip_kernel {
            None
        } else {
            Some(Arc::new(IpykernelInstaller {
                name: config.kernel_name.clone(),
                display_name: config.display_name.clone(),
                scope: config.kernel_scope,
            }))
        };
        let hooks: Option<Arc<dyn HookDeploy>> = if config.skip_hooks {
            None
        } else {
            Some(Arc::new(StartupHookInstaller::locate(
                config.hooks_dir.clone(),
                vars,
            )?))
        };

        Ok(Self {
            probe: Arc::new(SystemCapabilityProbe {
                python: probe_python,
                preference: config.table_preference,
                runner: runner.clone(),
            }),
            relauncher: Arc::new(VenvRelauncher {
                base_python: config.base_python.clone(),
                work_dir,
                program,
                search_path: vars.get("PATH").unwrap_or_default().to_string(),
                runner: runner.clone(),
            }),
            host_probe: Arc::new(PythonHostProbe {
                runner: runner.clone(),
            }),
            runner,
            handler: Arc::new(LogHandler),
            kernel,
            hooks,
        })
    }
}

/// Resolution result printed by `--dry-run`.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub context: Context,
    pub packages: Packages,
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct Report {
    pub context: Context,
    pub packages: Packages,
    pub backend: Backend,
    pub env_path: PathBuf,
    pub python_path: PathBuf,
    pub kernel: Option<KernelSpecInfo>,
    pub hooks: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(Report),
    /// The run was handed to a re-executed child, which exited with this code.
    ReExecuted(i32),
    Planned(Plan),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::ReExecuted(code) => *code,
            Outcome::Completed(_) | Outcome::Planned(_) => 0,
        }
    }
}

pub struct Orchestrator {
    pub config: BootstrapConfig,
    pub vars: EnvVars,
    pub collaborators: Collaborators,
}

impl Orchestrator {
    pub fn new(config: BootstrapConfig, vars: EnvVars, collaborators: Collaborators) -> Self {
        Self {
            config,
            vars,
            collaborators,
        }
    }

    pub async fn run(&self, program_args: &ProgramArgs) -> Result<Outcome, BootstrapError> {
        let manifest: Cow<'_, Manifest> = match &self.config.manifest {
            Some(path) => {
                info!("Loading manifest from {:?}", path);
                Cow::Owned(Manifest::load(path)?)
            }
            None => Cow::Borrowed(Manifest::builtin()?),
        };

        let table = match ensure_capability(
            self.collaborators.probe.as_ref(),
            self.collaborators.relauncher.as_ref(),
            program_args,
        )
        .await?
        {
            BootstrapOutcome::Proceed(table) => table,
            BootstrapOutcome::ReExecuted { exit_code } => {
                info!("Re-executed run finished with exit code {exit_code}");
                return Ok(Outcome::ReExecuted(exit_code));
            }
        };

        let sensor = ContextSensor {
            vars: &self.vars,
            processes: table.as_ref(),
            host_probe: self.collaborators.host_probe.as_ref(),
        };
        let context = sensor.sense(&manifest).await?;
        info!(
            "Context: hosted={}, backend={}",
            context.running_inside_notebook_host, context.environment
        );

        let packages = resolve(&manifest, &context);
        for (name, request) in packages.iter() {
            info!("  {name} [{}] {}", request.registry, request.constraint);
        }

        if self.config.dry_run {
            return Ok(Outcome::Planned(Plan { context, packages }));
        }

        let options = SetupOptions {
            env_dir: self.config.env_dir.clone(),
            base_python: self.config.base_python.clone(),
            channels: self.config.channels.clone(),
            runner: self.collaborators.runner.clone(),
            handler: self.collaborators.handler.clone(),
        };
        let setup = select_setup(&context, packages.clone(), &self.vars, &options);
        let deployed = setup.deploy().await?;

        let kernel = match &self.collaborators.kernel {
            Some(installer) => {
                let spec = installer.install(&deployed).await?;
                info!("Registered kernel {:?} ({})", spec.name, spec.display_name);
                Some(spec)
            }
            None => None,
        };

        let hooks = match &self.collaborators.hooks {
            Some(installer) => installer.deploy(&deployed).await?,
            None => Vec::new(),
        };

        Ok(Outcome::Completed(Report {
            context,
            packages,
            backend: deployed.backend,
            env_path: deployed.env_path,
            python_path: deployed.python_path,
            kernel,
            hooks,
        }))
    }
}
