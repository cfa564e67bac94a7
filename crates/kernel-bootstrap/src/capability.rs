//! Capability bootstrap: make sure a [`ProcessTable`] is available.
//!
//! ```text
//! HasCapability ──────────────────────────────▶ Proceed
//! NeedsCapability ── first run ──▶ Bootstrapping ──▶ ReExecuted(child exit code)
//! NeedsCapability ── `rerun` ────▶ Fatal (exit code 11)
//! ```
//!
//! Bootstrapping creates a throw-away venv in the working directory, installs
//! `psutil` into it and runs this executable again with the venv activated
//! and `rerun` appended. The venv directory is removed when the child exits,
//! whatever its outcome.

use async_trait::async_trait;
use kernel_env::{CommandRunner, Invocation};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::process_tree::{ProcFs, ProcessTable, PsutilTable};

/// Trailing argument that marks a re-executed run.
pub const RERUN_SENTINEL: &str = "rerun";

/// Exit code when the capability is still missing after one retry.
pub const CAPABILITY_EXIT_CODE: i32 = 11;

/// Package that provides the capability inside the temporary venv.
pub const CAPABILITY_PACKAGE: &str = "psutil";

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("process introspection is still unavailable after re-running with a temporary {CAPABILITY_PACKAGE} venv")]
    StillMissing,

    #[error("failed to prepare temporary venv in {dir}: {reason}")]
    TempEnv { dir: PathBuf, reason: String },

    #[error("failed to re-run {program}: {source}")]
    Relaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which process table implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TablePreference {
    /// `/proc` when readable, else `psutil`.
    #[default]
    Auto,
    ProcFs,
    Psutil,
}

impl TablePreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(Self::Auto),
            "procfs" | "proc" => Some(Self::ProcFs),
            "psutil" => Some(Self::Psutil),
            _ => None,
        }
    }
}

/// Detects whether the capability is present.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn detect(&self) -> Option<Arc<dyn ProcessTable>>;
}

/// Obtains the capability by running the program again.
#[async_trait]
pub trait Relauncher: Send + Sync {
    /// Run the program again with `args` (sentinel included) and return its exit code.
    async fn relaunch(&self, args: &[String]) -> Result<i32, CapabilityError>;
}

/// Command-line arguments of this run, split from the retry sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgramArgs {
    /// Arguments after the program name, without the sentinel.
    pub args: Vec<String>,
    /// Whether this run is already the retry.
    pub is_rerun: bool,
}

impl ProgramArgs {
    /// Split `args` (program name excluded) into user arguments and the sentinel.
    pub fn from_args(mut args: Vec<String>) -> Self {
        let is_rerun = args.last().map(String::as_str) == Some(RERUN_SENTINEL);
        if is_rerun {
            args.pop();
        }
        Self { args, is_rerun }
    }

    /// Arguments for the retry: the same ones plus the sentinel.
    pub fn rerun_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(RERUN_SENTINEL.to_string());
        args
    }
}

/// Result of the bootstrap step.
pub enum BootstrapOutcome {
    /// Capability present, carry on with this table.
    Proceed(Arc<dyn ProcessTable>),
    /// The retry ran to completion; exit with its code.
    ReExecuted { exit_code: i32 },
}

impl std::fmt::Debug for BootstrapOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed(table) => f.debug_tuple("Proceed").field(&table.name()).finish(),
            Self::ReExecuted { exit_code } => f
                .debug_struct("ReExecuted")
                .field("exit_code", exit_code)
                .finish(),
        }
    }
}

/// Drive the capability state machine once.
pub async fn ensure_capability(
    probe: &dyn CapabilityProbe,
    relauncher: &dyn Relauncher,
    program_args: &ProgramArgs,
) -> Result<BootstrapOutcome, CapabilityError> {
    if let Some(table) = probe.detect().await {
        debug!("Process introspection via {}", table.name());
        return Ok(BootstrapOutcome::Proceed(table));
    }

    if program_args.is_rerun {
        return Err(CapabilityError::StillMissing);
    }

    info!("Process introspection unavailable, re-running with a temporary {CAPABILITY_PACKAGE} venv");
    let exit_code = relauncher.relaunch(&program_args.rerun_args()).await?;
    Ok(BootstrapOutcome::ReExecuted { exit_code })
}

/// Looks for `/proc` first, then `psutil` in the configured interpreter.
pub struct SystemCapabilityProbe {
    pub python: PathBuf,
    pub preference: TablePreference,
    pub runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl CapabilityProbe for SystemCapabilityProbe {
    async fn detect(&self) -> Option<Arc<dyn ProcessTable>> {
        if self.preference != TablePreference::Psutil {
            let procfs = ProcFs::new();
            if procfs.available() {
                return Some(Arc::new(procfs));
            }
            debug!("/proc is not readable");
        }

        if self.preference != TablePreference::ProcFs
            && PsutilTable::available(&self.python, self.runner.as_ref()).await
        {
            return Some(Arc::new(PsutilTable::new(
                self.python.clone(),
                self.runner.clone(),
            )));
        }

        None
    }
}

/// Re-runs the current executable inside a temporary venv with `psutil`.
pub struct VenvRelauncher {
    /// Interpreter used to create the venv.
    pub base_python: PathBuf,
    /// Directory that will hold the temporary venv.
    pub work_dir: PathBuf,
    /// Executable to re-run.
    pub program: PathBuf,
    /// Inherited `PATH`; the venv's `bin` is put in front of it for the child.
    pub search_path: String,
    pub runner: Arc<dyn CommandRunner>,
}

impl VenvRelauncher {
    async fn run_step(&self, invocation: Invocation, dir: &Path) -> Result<(), CapabilityError> {
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| CapabilityError::TempEnv {
                dir: dir.to_path_buf(),
                reason: format!("{}: {e}", invocation.program_name()),
            })?;
        if !output.success() {
            return Err(CapabilityError::TempEnv {
                dir: dir.to_path_buf(),
                reason: format!("`{invocation}` failed: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Relauncher for VenvRelauncher {
    async fn relaunch(&self, args: &[String]) -> Result<i32, CapabilityError> {
        let temp = tempfile::Builder::new()
            .prefix(".kernel-bootstrap-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| CapabilityError::TempEnv {
                dir: self.work_dir.clone(),
                reason: e.to_string(),
            })?;
        let venv = temp.path();
        let bin = venv_bin(venv);

        debug!("Put up temporary venv with {CAPABILITY_PACKAGE} at {:?}", venv);
        self.run_step(
            Invocation::new(&self.base_python)
                .args(["-m", "venv"])
                .path_arg(venv),
            venv,
        )
        .await?;
        self.run_step(
            Invocation::new(bin.join("python"))
                .args(["-m", "pip", "install", "--quiet", CAPABILITY_PACKAGE]),
            venv,
        )
        .await?;

        let mut paths = vec![bin.clone()];
        paths.extend(std::env::split_paths(&self.search_path));
        let joined = std::env::join_paths(paths).map_err(|e| CapabilityError::TempEnv {
            dir: venv.to_path_buf(),
            reason: e.to_string(),
        })?;

        debug!("Restart {:?} in this venv", self.program);
        let invocation = Invocation::new(&self.program)
            .args(args.iter().cloned())
            .env("PATH", joined.to_string_lossy())
            .env("VIRTUAL_ENV", venv.to_string_lossy())
            .inherit_output();
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|source| CapabilityError::Relaunch {
                program: invocation.program_name(),
                source,
            })?;

        // `temp` is dropped here (or on any early return above), removing the venv.
        Ok(output.code.unwrap_or(1))
    }
}

fn venv_bin(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_tree::StaticTable;
    use kernel_env::runner::testing::ScriptedRunner;
    use kernel_env::CommandOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FixedProbe(bool);

    #[async_trait]
    impl CapabilityProbe for FixedProbe {
        async fn detect(&self) -> Option<Arc<dyn ProcessTable>> {
            self.0
                .then(|| Arc::new(StaticTable(Vec::new())) as Arc<dyn ProcessTable>)
        }
    }

    /// Simulates the child process: runs the bootstrap again with the
    /// child's own probe and maps its result to an exit code.
    struct SimulatedChild {
        child_has_capability: bool,
        child_exit_code: i32,
        launches: AtomicUsize,
        seen_args: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Relauncher for SimulatedChild {
        async fn relaunch(&self, args: &[String]) -> Result<i32, CapabilityError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.seen_args.lock().unwrap() = args.to_vec();

            let child = ProgramArgs::from_args(args.to_vec());
            let probe = FixedProbe(self.child_has_capability);
            match ensure_capability(&probe, self, &child).await {
                Ok(BootstrapOutcome::Proceed(_)) => Ok(self.child_exit_code),
                Ok(BootstrapOutcome::ReExecuted { exit_code }) => Ok(exit_code),
                Err(CapabilityError::StillMissing) => Ok(CAPABILITY_EXIT_CODE),
                Err(e) => Err(e),
            }
        }
    }

    fn child(has_capability: bool, exit_code: i32) -> SimulatedChild {
        SimulatedChild {
            child_has_capability: has_capability,
            child_exit_code: exit_code,
            launches: AtomicUsize::new(0),
            seen_args: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_sentinel_split() {
        let inv = ProgramArgs::from_args(vec!["debug".into(), RERUN_SENTINEL.into()]);
        assert!(inv.is_rerun);
        assert_eq!(inv.args, vec!["debug"]);

        let inv = ProgramArgs::from_args(vec!["debug".into()]);
        assert!(!inv.is_rerun);
        assert_eq!(inv.rerun_args(), vec!["debug", RERUN_SENTINEL]);

        // Only a trailing sentinel counts.
        let inv = ProgramArgs::from_args(vec![RERUN_SENTINEL.into(), "debug".into()]);
        assert!(!inv.is_rerun);
    }

    #[test]
    fn test_table_preference_parse() {
        assert_eq!(TablePreference::parse("AUTO"), Some(TablePreference::Auto));
        assert_eq!(TablePreference::parse("psutil"), Some(TablePreference::Psutil));
        assert_eq!(TablePreference::parse("procfs"), Some(TablePreference::ProcFs));
        assert_eq!(TablePreference::parse("ps"), None);
    }

    #[tokio::test]
    async fn test_capability_present_proceeds() {
        let relauncher = child(true, 0);
        let outcome = ensure_capability(&FixedProbe(true), &relauncher, &ProgramArgs::default())
            .await
            .unwrap();
        assert!(matches!(outcome, BootstrapOutcome::Proceed(_)));
        assert_eq!(relauncher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_propagates_child_exit_code() {
        let relauncher = child(true, 42);
        let invocation = ProgramArgs::from_args(vec!["debug".into()]);
        let outcome = ensure_capability(&FixedProbe(false), &relauncher, &invocation)
            .await
            .unwrap();
        assert!(matches!(outcome, BootstrapOutcome::ReExecuted { exit_code: 42 }));
        assert_eq!(relauncher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            *relauncher.seen_args.lock().unwrap(),
            vec!["debug".to_string(), RERUN_SENTINEL.to_string()]
        );
    }

    #[tokio::test]
    async fn test_retry_terminates_when_capability_never_appears() {
        let relauncher = child(false, 0);
        let outcome = ensure_capability(&FixedProbe(false), &relauncher, &ProgramArgs::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            BootstrapOutcome::ReExecuted {
                exit_code: CAPABILITY_EXIT_CODE
            }
        ));
        // Parent launched the child once; the child refused to launch again.
        assert_eq!(relauncher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerun_without_capability_is_fatal() {
        let relauncher = child(false, 0);
        let invocation = ProgramArgs::from_args(vec![RERUN_SENTINEL.into()]);
        let err = ensure_capability(&FixedProbe(false), &relauncher, &invocation)
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::StillMissing));
        assert_eq!(relauncher.launches.load(Ordering::SeqCst), 0);
    }

    fn temp_venv_from(calls: &[Invocation]) -> PathBuf {
        PathBuf::from(calls[0].args.last().unwrap())
    }

    #[tokio::test]
    async fn test_venv_relauncher_runs_child_and_cleans_up() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new(|inv| {
            if inv.program_name() == "kernel-bootstrap" {
                Ok(CommandOutput::exited(5))
            } else {
                Ok(CommandOutput::exited(0))
            }
        }));
        let relauncher = VenvRelauncher {
            base_python: PathBuf::from("python3"),
            work_dir: work.path().to_path_buf(),
            program: PathBuf::from("/usr/local/bin/kernel-bootstrap"),
            search_path: "/usr/local/bin:/usr/bin".to_string(),
            runner: runner.clone(),
        };

        let code = relauncher
            .relaunch(&["info".to_string(), RERUN_SENTINEL.to_string()])
            .await
            .unwrap();
        assert_eq!(code, 5);

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        let venv = temp_venv_from(&calls);
        assert!(venv.starts_with(work.path()));
        assert_eq!(calls[1].program, venv_bin(&venv).join("python"));
        assert!(calls[1].args.contains(&CAPABILITY_PACKAGE.to_string()));

        let rerun = &calls[2];
        assert_eq!(rerun.args, vec!["info", RERUN_SENTINEL]);
        assert!(!rerun.capture);
        let path_var = rerun.envs.iter().find(|(k, _)| k == "PATH").unwrap();
        assert_eq!(
            path_var.1,
            format!("{}:/usr/local/bin:/usr/bin", venv_bin(&venv).display())
        );
        assert!(rerun.envs.iter().any(|(k, _)| k == "VIRTUAL_ENV"));

        assert!(!venv.exists(), "temporary venv must be removed");
    }

    #[tokio::test]
    async fn test_venv_relauncher_cleans_up_after_failed_install() {
        let work = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::failing_on("pip install"));
        let relauncher = VenvRelauncher {
            base_python: PathBuf::from("python3"),
            work_dir: work.path().to_path_buf(),
            program: PathBuf::from("kernel-bootstrap"),
            search_path: String::new(),
            runner: runner.clone(),
        };

        let err = relauncher.relaunch(&[RERUN_SENTINEL.to_string()]).await.unwrap_err();
        assert!(matches!(err, CapabilityError::TempEnv { .. }));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2, "child must not run after a failed install");
        assert!(!temp_venv_from(&calls).exists());
    }

    #[tokio::test]
    async fn test_system_probe_psutil_only() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let probe = SystemCapabilityProbe {
            python: PathBuf::from("python3"),
            preference: TablePreference::Psutil,
            runner: runner.clone(),
        };
        let table = probe.detect().await.unwrap();
        assert_eq!(table.name(), "psutil");

        let missing = SystemCapabilityProbe {
            python: PathBuf::from("python3"),
            preference: TablePreference::Psutil,
            runner: Arc::new(ScriptedRunner::failing_on("import psutil")),
        };
        assert!(missing.detect().await.is_none());
    }
}
