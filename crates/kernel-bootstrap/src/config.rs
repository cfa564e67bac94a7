//! Command line and environment configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use crate::capability::TablePreference;
use crate::context::EnvVars;
use crate::error::BootstrapError;
use crate::kernelspec::KernelScope;

/// Interpreter used for temporary and isolated venvs.
pub const PYTHON_VAR: &str = "KERNEL_BOOTSTRAP_PYTHON";
/// Root directory for isolated venvs.
pub const ENV_DIR_VAR: &str = "KERNEL_BOOTSTRAP_ENV_DIR";
/// `auto`, `procfs` or `psutil`.
pub const PROCESS_TABLE_VAR: &str = "KERNEL_BOOTSTRAP_PROCESS_TABLE";

const DEFAULT_PYTHON: &str = "python3";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "kernel-bootstrap")]
#[command(about = "Deploy a Python kernel environment for the current notebook host")]
pub struct Cli {
    /// Log level (debug, info, warning, error, critical)
    #[arg(default_value = "info")]
    pub log_level: String,

    /// Dependency manifest to use instead of the built-in one
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Kernel name (default: conda env name, or kernel-bootstrap)
    #[arg(long)]
    pub kernel_name: Option<String>,

    /// Kernel display name
    #[arg(long)]
    pub display_name: Option<String>,

    /// Where to register the kernelspec
    #[arg(long, value_enum, default_value_t = KernelScope::User)]
    pub kernel_scope: KernelScope,

    /// Directory for isolated venvs (default: ~/.cache/kernel-bootstrap/envs)
    #[arg(long)]
    pub env_dir: Option<PathBuf>,

    /// IPython directory for the startup hook (default: $IPYTHONDIR or ~/.ipython)
    #[arg(long)]
    pub hooks_dir: Option<PathBuf>,

    /// Conda channel, repeatable (default: conda-forge)
    #[arg(long = "channel")]
    pub channels: Vec<String>,

    /// Do not register a kernelspec
    #[arg(long)]
    pub skip_kernel: bool,

    /// Do not install the IPython startup hook
    #[arg(long)]
    pub skip_hooks: bool,

    /// Resolve and print the install plan without deploying
    #[arg(long)]
    pub dry_run: bool,
}

/// Everything a run needs, resolved from the CLI and the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapConfig {
    pub log_level: LevelFilter,
    pub manifest: Option<PathBuf>,
    pub kernel_name: Option<String>,
    pub display_name: Option<String>,
    pub kernel_scope: KernelScope,
    pub env_dir: PathBuf,
    pub hooks_dir: Option<PathBuf>,
    pub channels: Vec<String>,
    pub skip_kernel: bool,
    pub skip_hooks: bool,
    pub dry_run: bool,
    pub base_python: PathBuf,
    pub table_preference: TablePreference,
}

impl BootstrapConfig {
    pub fn from_cli(cli: Cli, vars: &EnvVars) -> Result<Self, BootstrapError> {
        let log_level = parse_log_level(&cli.log_level)
            .ok_or_else(|| BootstrapError::Config(format!("unknown log level {:?}", cli.log_level)))?;

        let table_preference = match vars.get(PROCESS_TABLE_VAR) {
            None => TablePreference::Auto,
            Some(value) => TablePreference::parse(value).ok_or_else(|| {
                BootstrapError::Config(format!("{PROCESS_TABLE_VAR}: unknown value {value:?}"))
            })?,
        };

        let env_dir = cli
            .env_dir
            .or_else(|| vars.non_empty(ENV_DIR_VAR).map(PathBuf::from))
            .unwrap_or_else(kernel_env::venv::default_env_dir);

        let base_python = PathBuf::from(vars.non_empty(PYTHON_VAR).unwrap_or(DEFAULT_PYTHON));

        Ok(Self {
            log_level,
            manifest: cli.manifest,
            kernel_name: cli.kernel_name,
            display_name: cli.display_name,
            kernel_scope: cli.kernel_scope,
            env_dir,
            hooks_dir: cli.hooks_dir,
            channels: cli.channels,
            skip_kernel: cli.skip_kernel,
            skip_hooks: cli.skip_hooks,
            dry_run: cli.dry_run,
            base_python,
            table_preference,
        })
    }
}

/// Python-style level names; `critical` maps to `error`.
pub fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warning" | "warn" => Some(LevelFilter::Warn),
        "error" | "critical" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("kernel-bootstrap").chain(args.iter().copied()))
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(parse_log_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_log_level("Warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_log_level("critical"), Some(LevelFilter::Error));
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn test_defaults() {
        let config = BootstrapConfig::from_cli(cli(&[]), &EnvVars::default()).unwrap();
        assert_eq!(config.log_level, LevelFilter::Info);
        assert_eq!(config.base_python, PathBuf::from("python3"));
        assert_eq!(config.table_preference, TablePreference::Auto);
        assert_eq!(config.kernel_scope, KernelScope::User);
        assert_eq!(config.env_dir, kernel_env::venv::default_env_dir());
        assert!(!config.dry_run);
    }

    #[test]
    fn test_flags_and_env() {
        let vars: EnvVars = [
            (PYTHON_VAR, "/opt/py/bin/python3.12"),
            (ENV_DIR_VAR, "/var/envs"),
            (PROCESS_TABLE_VAR, "psutil"),
        ]
        .into_iter()
        .collect();
        let config = BootstrapConfig::from_cli(
            cli(&[
                "debug",
                "--channel",
                "conda-forge",
                "--channel",
                "bioconda",
                "--kernel-scope",
                "sys-prefix",
                "--dry-run",
            ]),
            &vars,
        )
        .unwrap();
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.channels, vec!["conda-forge", "bioconda"]);
        assert_eq!(config.kernel_scope, KernelScope::SysPrefix);
        assert_eq!(config.env_dir, PathBuf::from("/var/envs"));
        assert_eq!(config.base_python, PathBuf::from("/opt/py/bin/python3.12"));
        assert_eq!(config.table_preference, TablePreference::Psutil);
        assert!(config.dry_run);

        // The flag wins over the variable.
        let config = BootstrapConfig::from_cli(cli(&["--env-dir", "/tmp/e"]), &vars).unwrap();
        assert_eq!(config.env_dir, PathBuf::from("/tmp/e"));
    }

    #[test]
    fn test_invalid_values() {
        let err = BootstrapConfig::from_cli(cli(&["loud"]), &EnvVars::default()).unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));

        let vars: EnvVars = [(PROCESS_TABLE_VAR, "ps")].into_iter().collect();
        assert!(BootstrapConfig::from_cli(cli(&[]), &vars).is_err());
    }
}
